//! Mount orchestration for the guest filesystem tree.
//!
//! Locates the root filesystem by trial-mounting candidates, resolves the
//! guest's fstab against the discovered partitions to satisfy the
//! essential-directory invariant, then mounts everything into a scratch
//! tree in nesting order with pseudo-filesystems last. Teardown reverses
//! the exact order and tolerates targets that never got mounted, since it
//! also runs on failure-cleanup paths.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use imglift_shared::constants::guest::ESSENTIAL_DIRS;
use imglift_shared::errors::{MigrateError, MigrateResult};

use crate::inspect::{PartRole, PartitionInfo};
use crate::util::cleanup::defer;
use crate::util::process::run_helper;
use crate::util::retry::RetryPolicy;

/// One fstab line that survived tokenization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub spec: String,
    pub mountpoint: String,
    pub fstype: String,
}

/// Ordered mounting instructions for one guest.
#[derive(Debug, Clone)]
pub struct MountPlan {
    pub root: PartitionInfo,
    /// Auxiliary mounts as (partition, guest-relative target), sorted
    /// parents before children.
    pub aux: Vec<(PartitionInfo, String)>,
}

/// Pseudo-filesystems bound into the scratch tree after the real ones.
const PSEUDO_MOUNTS: &[(&str, &str, &str)] = &[
    // (source, fstype or "bind", guest-relative target)
    ("proc", "proc", "/proc"),
    ("sysfs", "sysfs", "/sys"),
    ("/dev", "bind", "/dev"),
];

/// Locate the root partition by trial-mounting candidates read-only.
///
/// A candidate is the root when it carries both `/etc` and `/sbin`.
/// Returns the partition, its fstab text (empty if absent), and the set
/// of top-level directories present on it.
pub fn find_root(
    candidates: &[PartitionInfo],
    scratch: &Path,
) -> MigrateResult<(PartitionInfo, String, BTreeSet<String>)> {
    let probe_dir = scratch.join("probe");
    std::fs::create_dir_all(&probe_dir)?;
    let _probe_cleanup = defer(|| {
        let _ = std::fs::remove_dir(&probe_dir);
    });

    // LVM convention already names one volume root; try those first.
    let mut ordered: Vec<&PartitionInfo> = Vec::new();
    ordered.extend(candidates.iter().filter(|p| p.role == PartRole::Root));
    ordered.extend(candidates.iter().filter(|p| p.role != PartRole::Root));

    for candidate in ordered {
        if !candidate.kind.mountable() {
            continue;
        }
        tracing::debug!(node = %candidate.node.display(), "probing candidate root");
        if let Err(err) = mount_filesystem(candidate, &probe_dir, true) {
            tracing::debug!(
                node = %candidate.node.display(),
                error = %err,
                "candidate refused a read-only mount"
            );
            continue;
        }

        let is_root = probe_dir.join("etc").is_dir() && probe_dir.join("sbin").exists();
        let fstab = std::fs::read_to_string(probe_dir.join("etc/fstab")).unwrap_or_default();
        let top_level = list_top_level(&probe_dir);
        unmount_target(&probe_dir, true)?;

        if is_root {
            tracing::info!(node = %candidate.node.display(), "root filesystem found");
            return Ok((candidate.clone(), fstab, top_level));
        }
    }

    Err(MigrateError::Format(
        "no partition carries a root filesystem (/etc and /sbin)".to_string(),
    ))
}

/// Build the mount plan, enforcing the essential-directory invariant.
///
/// Every essential directory must resolve either to a directory on the
/// root filesystem or, through fstab, to a discovered partition. This is
/// checked before any write is attempted; an unresolvable essential
/// directory rejects the image.
pub fn build_plan(
    root: PartitionInfo,
    fstab_text: &str,
    partitions: &[PartitionInfo],
    root_top_level: &BTreeSet<String>,
) -> MigrateResult<MountPlan> {
    let entries = parse_fstab(fstab_text);
    let mut aux: Vec<(PartitionInfo, String)> = Vec::new();

    for dir in ESSENTIAL_DIRS {
        let name = dir.trim_start_matches('/');
        match entries.iter().find(|e| e.mountpoint == *dir) {
            Some(entry) => match resolve_spec(&entry.spec, partitions) {
                Some(partition) => {
                    let mut part = partition.clone();
                    if part.role == PartRole::AuxiliaryEssential && *dir == "/boot" {
                        part.role = PartRole::Boot;
                    }
                    aux.push((part, (*dir).to_string()));
                }
                None => {
                    return Err(MigrateError::Format(format!(
                        "essential directory {} maps to unresolvable device '{}'",
                        dir, entry.spec
                    )));
                }
            },
            None => {
                if !root_top_level.contains(name) {
                    return Err(MigrateError::Format(format!(
                        "essential directory {} is missing from the root filesystem \
                         and no fstab entry provides it",
                        dir
                    )));
                }
            }
        }
    }

    // Mounts nested below an essential directory (the EFI partition under
    // /boot is the common case) ride along when resolvable.
    for entry in &entries {
        if entry.mountpoint == "/" || ESSENTIAL_DIRS.contains(&entry.mountpoint.as_str()) {
            continue;
        }
        let nested = ESSENTIAL_DIRS
            .iter()
            .any(|dir| entry.mountpoint.starts_with(&format!("{dir}/")));
        if !nested {
            continue;
        }
        match resolve_spec(&entry.spec, partitions) {
            Some(partition) => aux.push((partition.clone(), entry.mountpoint.clone())),
            None => {
                tracing::warn!(
                    mountpoint = %entry.mountpoint,
                    spec = %entry.spec,
                    "skipping nested mount with unresolvable device"
                );
            }
        }
    }

    // Parents before children.
    aux.sort_by(|a, b| {
        let depth = |t: &str| t.matches('/').count();
        depth(&a.1).cmp(&depth(&b.1)).then_with(|| a.1.cmp(&b.1))
    });

    Ok(MountPlan { root, aux })
}

/// The mounted guest tree. Unmounted exactly once, in reverse order.
pub struct MountedRoot {
    root_dir: PathBuf,
    /// Mount targets in the order they were mounted.
    mounted: Vec<PathBuf>,
    active: bool,
}

impl MountedRoot {
    /// Absolute path of the mounted guest root.
    pub fn path(&self) -> &Path {
        &self.root_dir
    }

    /// Unmount everything, pseudo-filesystems first, children before
    /// parents. Already-unmounted targets are logged and tolerated.
    pub fn unmount(&mut self) -> MigrateResult<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        let mut first_error = None;
        for target in self.mounted.drain(..).rev() {
            if let Err(err) = unmount_target(&target, true) {
                tracing::warn!(target = %target.display(), error = %err, "unmount failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            None => {
                tracing::info!(root = %self.root_dir.display(), "guest tree unmounted");
                Ok(())
            }
            Some(err) => Err(err.in_stage("unmount")),
        }
    }
}

impl Drop for MountedRoot {
    fn drop(&mut self) {
        if self.active {
            tracing::warn!(
                root = %self.root_dir.display(),
                "mounted root dropped without explicit unmount, cleaning up"
            );
            if let Err(err) = self.unmount() {
                tracing::warn!(error = %err, "implicit unmount failed");
            }
        }
    }
}

/// Execute a mount plan into `scratch`.
///
/// Any failure unmounts everything mounted so far before propagating; no
/// partial mount state survives a failed run.
pub fn mount(plan: &MountPlan, scratch: &Path) -> MigrateResult<MountedRoot> {
    let root_dir = scratch.join("root");
    std::fs::create_dir_all(&root_dir)?;

    let mut tree = MountedRoot {
        root_dir: root_dir.clone(),
        mounted: Vec::new(),
        active: true,
    };

    let mount_one = |partition: Option<&PartitionInfo>,
                         fstype: &str,
                         source: &str,
                         target_rel: &str|
     -> MigrateResult<PathBuf> {
        let target = join_guest_path(&root_dir, target_rel);
        std::fs::create_dir_all(&target)?;
        match partition {
            Some(p) => mount_filesystem(p, &target, false)?,
            None => mount_pseudo(source, fstype, &target)?,
        }
        Ok(target)
    };

    let result = (|| -> MigrateResult<()> {
        mount_filesystem(&plan.root, &root_dir, false)?;
        tree.mounted.push(root_dir.clone());

        for (partition, target_rel) in &plan.aux {
            let target = mount_one(Some(partition), "", "", target_rel)?;
            tree.mounted.push(target);
        }

        for (source, fstype, target_rel) in PSEUDO_MOUNTS {
            let target = mount_one(None, fstype, source, target_rel)?;
            tree.mounted.push(target);
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            tracing::info!(root = %root_dir.display(), mounts = tree.mounted.len(), "guest tree mounted");
            Ok(tree)
        }
        Err(err) => {
            // tree.unmount() runs via the explicit call so the error from
            // the failed stage, not the cleanup, is what propagates.
            if let Err(cleanup_err) = tree.unmount() {
                tracing::warn!(error = %cleanup_err, "cleanup after failed mount also failed");
            }
            Err(err.in_stage("mount"))
        }
    }
}

fn mount_filesystem(partition: &PartitionInfo, target: &Path, read_only: bool) -> MigrateResult<()> {
    let retry = RetryPolicy::busy();
    retry.run("mount", || {
        let mut args: Vec<&OsStr> = vec![OsStr::new("-t"), OsStr::new(partition.kind.as_str())];
        if read_only {
            args.push(OsStr::new("-o"));
            args.push(OsStr::new("ro"));
        }
        args.push(partition.node.as_os_str());
        args.push(target.as_os_str());
        run_helper("mount", args).map(|_| ())
    })
}

fn mount_pseudo(source: &str, fstype: &str, target: &Path) -> MigrateResult<()> {
    let args: Vec<&OsStr> = if fstype == "bind" {
        vec![
            OsStr::new("--bind"),
            OsStr::new(source),
            target.as_os_str(),
        ]
    } else {
        vec![
            OsStr::new("-t"),
            OsStr::new(fstype),
            OsStr::new(source),
            target.as_os_str(),
        ]
    };
    run_helper("mount", args).map(|_| ())
}

/// Unmount one target. With `tolerate_unmounted`, a target that is not
/// mounted (cleanup after partial failure) logs and succeeds.
fn unmount_target(target: &Path, tolerate_unmounted: bool) -> MigrateResult<()> {
    match run_helper("umount", [target.as_os_str()]) {
        Ok(_) => Ok(()),
        Err(MigrateError::Helper { stderr, .. })
            if tolerate_unmounted && stderr.contains("not mounted") =>
        {
            tracing::debug!(target = %target.display(), "target was not mounted");
            Ok(())
        }
        Err(err) => {
            if err.is_busy() {
                // Retry, then fall back to a lazy detach so cleanup can
                // finish even while something still holds the target.
                tracing::warn!(target = %target.display(), "busy, retrying unmount");
                let retried = RetryPolicy::busy().run("umount", || {
                    run_helper("umount", [target.as_os_str()]).map(|_| ())
                });
                match retried {
                    Ok(()) => Ok(()),
                    Err(retry_err) => {
                        tracing::warn!(
                            target = %target.display(),
                            error = %retry_err,
                            "still busy, detaching lazily"
                        );
                        nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH).map_err(
                            |e| {
                                MigrateError::Resource(format!(
                                    "lazy detach of {} failed: {}",
                                    target.display(),
                                    e
                                ))
                            },
                        )
                    }
                }
            } else {
                Err(err)
            }
        }
    }
}

fn join_guest_path(root: &Path, guest_path: &str) -> PathBuf {
    root.join(guest_path.trim_start_matches('/'))
}

fn list_top_level(dir: &Path) -> BTreeSet<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

/// Tokenize fstab, dropping comments, blanks, and malformed lines.
pub fn parse_fstab(text: &str) -> Vec<FstabEntry> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut fields = line.split_whitespace();
            let spec = fields.next()?.to_string();
            let mountpoint = fields.next()?.to_string();
            let fstype = fields.next()?.to_string();
            Some(FstabEntry {
                spec,
                mountpoint,
                fstype,
            })
        })
        .collect()
}

/// Resolve an fstab device spec against the discovered partitions.
///
/// `UUID=` and `LABEL=` match probe results; `/dev/mapper/VG-LV` and
/// `/dev/VG/LV` match logical-volume nodes. Raw guest device names
/// (`/dev/sda1`) cannot be mapped onto the bound device and resolve to
/// nothing.
pub fn resolve_spec<'a>(spec: &str, partitions: &'a [PartitionInfo]) -> Option<&'a PartitionInfo> {
    if let Some(uuid) = spec.strip_prefix("UUID=") {
        return partitions.iter().find(|p| p.uuid.as_deref() == Some(uuid));
    }
    if let Some(label) = spec.strip_prefix("LABEL=") {
        return partitions
            .iter()
            .find(|p| p.label.as_deref() == Some(label));
    }
    if let Some(mapper) = spec.strip_prefix("/dev/mapper/") {
        return partitions
            .iter()
            .find(|p| p.node.as_path() == Path::new(spec) || mapper_name_matches(&p.node, mapper));
    }
    partitions
        .iter()
        .find(|p| p.node.as_path() == Path::new(spec))
}

/// Whether `/dev/VG/LV` encodes to the given device-mapper name
/// (dashes in VG/LV are doubled in mapper names).
fn mapper_name_matches(node: &Path, mapper: &str) -> bool {
    let mut components = node.components().rev();
    let lv = components.next().map(|c| c.as_os_str().to_string_lossy());
    let vg = components.next().map(|c| c.as_os_str().to_string_lossy());
    match (vg, lv) {
        (Some(vg), Some(lv)) => {
            let encoded = format!("{}-{}", vg.replace('-', "--"), lv.replace('-', "--"));
            encoded == mapper
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::FsKind;

    fn part(node: &str, kind: FsKind, uuid: Option<&str>, role: PartRole) -> PartitionInfo {
        PartitionInfo {
            node: PathBuf::from(node),
            kind,
            size: 8 << 30,
            uuid: uuid.map(str::to_string),
            label: None,
            role,
        }
    }

    fn root_dirs() -> BTreeSet<String> {
        ["bin", "boot", "etc", "lib", "opt", "sbin", "usr", "var"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn fstab_tokenizer_skips_comments_and_malformed_lines() {
        let entries = parse_fstab(
            "# /etc/fstab\n\
             UUID=aaaa / ext4 defaults 0 1\n\
             broken-line\n\
             \n\
             UUID=bbbb /boot xfs defaults 0 2\n",
        );
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].mountpoint, "/boot");
    }

    #[test]
    fn spec_resolution_by_uuid_label_and_mapper_name() {
        let parts = vec![
            part("/dev/nbd0p1", FsKind::Xfs, Some("aaaa"), PartRole::AuxiliaryEssential),
            part("/dev/my-vg/lv-root", FsKind::Ext4, None, PartRole::Root),
        ];
        assert!(resolve_spec("UUID=aaaa", &parts).is_some());
        assert!(resolve_spec("UUID=zzzz", &parts).is_none());
        assert!(resolve_spec("/dev/mapper/my--vg-lv--root", &parts).is_some());
        assert!(resolve_spec("/dev/my-vg/lv-root", &parts).is_some());
        // Raw guest device names do not resolve.
        assert!(resolve_spec("/dev/sda1", &parts).is_none());
    }

    #[test]
    fn plan_includes_fstab_backed_essential_dirs() {
        let root = part("/dev/vg/root", FsKind::Ext4, None, PartRole::Root);
        let parts = vec![
            root.clone(),
            part("/dev/nbd0p1", FsKind::Xfs, Some("boot-uuid"), PartRole::AuxiliaryEssential),
        ];
        let plan = build_plan(
            root,
            "UUID=boot-uuid /boot xfs defaults 0 2\n",
            &parts,
            &root_dirs(),
        )
        .unwrap();
        assert_eq!(plan.aux.len(), 1);
        assert_eq!(plan.aux[0].1, "/boot");
        assert_eq!(plan.aux[0].0.role, PartRole::Boot);
    }

    #[test]
    fn unresolvable_essential_dir_rejects_before_any_write() {
        let root = part("/dev/vg/root", FsKind::Ext4, None, PartRole::Root);
        let parts = vec![root.clone()];
        let err = build_plan(
            root,
            "UUID=gone /boot xfs defaults 0 2\n",
            &parts,
            &root_dirs(),
        )
        .unwrap_err();
        match err {
            MigrateError::Format(msg) => {
                assert!(msg.contains("/boot"));
                assert!(msg.contains("gone"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn missing_essential_dir_without_fstab_entry_rejects() {
        let root = part("/dev/vg/root", FsKind::Ext4, None, PartRole::Root);
        let parts = vec![root.clone()];
        let mut dirs = root_dirs();
        dirs.remove("boot");
        let err = build_plan(root, "", &parts, &dirs).unwrap_err();
        assert!(matches!(err, MigrateError::Format(_)));
    }

    #[test]
    fn nested_mounts_sort_after_their_parents() {
        let root = part("/dev/vg/root", FsKind::Ext4, None, PartRole::Root);
        let parts = vec![
            root.clone(),
            part("/dev/nbd0p2", FsKind::Xfs, Some("boot-uuid"), PartRole::AuxiliaryEssential),
            part("/dev/nbd0p1", FsKind::Other("vfat".into()), Some("esp-uuid"), PartRole::Boot),
        ];
        let plan = build_plan(
            root,
            "UUID=esp-uuid /boot/efi vfat defaults 0 2\n\
             UUID=boot-uuid /boot xfs defaults 0 2\n",
            &parts,
            &root_dirs(),
        )
        .unwrap();
        let targets: Vec<&str> = plan.aux.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(targets, vec!["/boot", "/boot/efi"]);
    }

    #[test]
    fn nested_mount_with_unresolvable_device_is_skipped_not_fatal() {
        let root = part("/dev/vg/root", FsKind::Ext4, None, PartRole::Root);
        let parts = vec![root.clone()];
        let plan = build_plan(
            root,
            "/dev/sda9 /boot/efi vfat defaults 0 2\n",
            &parts,
            &root_dirs(),
        )
        .unwrap();
        assert!(plan.aux.is_empty());
    }
}
