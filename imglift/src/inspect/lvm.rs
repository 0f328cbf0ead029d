//! LVM volume-group handling for image volumes.
//!
//! Images built with LVM carry their own volume groups. Activating them
//! on the migration host has one sharp edge: the image's group name may
//! collide with a group the host itself uses. The session below renames
//! the host's colliding groups (by UUID) to a temporary name before
//! activation and guarantees the originals are restored on teardown,
//! success or failure downstream.

use std::path::{Path, PathBuf};

use imglift_shared::errors::{MigrateError, MigrateResult};

use super::{probe_node, PartRole, PartitionInfo};
use crate::util::process::run_helper;
use crate::util::retry::RetryPolicy;

/// Suffix appended to a host volume group while the image's group with
/// the same name is active.
const RENAME_SUFFIX: &str = "_premigrate";

/// One volume group visible on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroup {
    pub name: String,
    pub uuid: String,
}

/// An activated set of image volume groups, plus the bookkeeping needed
/// to put the host back exactly as it was.
pub struct LvmSession {
    vgs: Vec<String>,
    /// (uuid, original name) of host groups we renamed out of the way.
    renamed: Vec<VolumeGroup>,
    active: bool,
}

/// List the volume groups currently visible on this host.
pub fn list_volume_groups() -> MigrateResult<Vec<VolumeGroup>> {
    let output = run_helper(
        "vgs",
        ["--noheadings", "--separator", ":", "-o", "vg_name,vg_uuid"],
    )
    .map_err(|e| e.in_stage("lvm"))?;
    Ok(parse_vg_listing(&output.stdout))
}

/// Map LVM physical members to the image volume groups they belong to.
pub fn groups_of_members(members: &[PathBuf]) -> MigrateResult<Vec<String>> {
    let output = run_helper(
        "pvs",
        ["--noheadings", "--separator", ":", "-o", "pv_name,vg_name"],
    )
    .map_err(|e| e.in_stage("lvm"))?;
    Ok(parse_pv_listing(&output.stdout, members))
}

/// Activate the image's volume groups, renaming colliding host groups
/// out of the way first.
pub fn activate(members: &[PathBuf]) -> MigrateResult<LvmSession> {
    let image_vgs = groups_of_members(members)?;
    if image_vgs.is_empty() {
        return Err(MigrateError::Resource(
            "LVM members present but no volume group claims them".to_string(),
        ));
    }

    // The host listing includes the image's groups once the device is
    // bound; a collision is a host group with an image group's name whose
    // UUID differs from every group claimed by our members. Renaming by
    // UUID keeps this unambiguous even while two groups share a name.
    let host_vgs = list_volume_groups()?;
    let mut session = LvmSession {
        vgs: image_vgs.clone(),
        renamed: Vec::new(),
        active: false,
    };

    for vg in &image_vgs {
        let same_name: Vec<&VolumeGroup> =
            host_vgs.iter().filter(|h| &h.name == vg).collect();
        if same_name.len() > 1 {
            // More than one group wears this name: ours plus the host's.
            // Rename every host-owned one, identified by UUID so the
            // image's own group is never touched.
            let candidates = match collision_candidates(&same_name, members) {
                Ok(candidates) => candidates,
                Err(err) => {
                    session.best_effort_teardown();
                    return Err(err);
                }
            };
            for host_vg in candidates {
                let temp = format!("{}{}", host_vg.name, RENAME_SUFFIX);
                tracing::info!(
                    vg = %host_vg.name,
                    uuid = %host_vg.uuid,
                    temp = %temp,
                    "renaming colliding host volume group"
                );
                run_helper("vgrename", [host_vg.uuid.as_str(), temp.as_str()])
                    .map_err(|e| {
                        session.best_effort_teardown();
                        e.in_stage("lvm rename")
                    })?;
                session.renamed.push(host_vg);
            }
        }
    }

    let retry = RetryPolicy::busy();
    for vg in &image_vgs {
        if let Err(err) = retry.run("vgchange activate", || {
            run_helper("vgchange", ["-ay", vg]).map(|_| ())
        }) {
            session.best_effort_teardown();
            return Err(err.in_stage("lvm activate"));
        }
    }
    session.active = true;
    Ok(session)
}

impl LvmSession {
    /// The image volume groups this session activated.
    pub fn volume_groups(&self) -> &[String] {
        &self.vgs
    }

    /// Expand the activated groups into logical-volume partition entries.
    pub fn logical_volumes(&self) -> MigrateResult<Vec<PartitionInfo>> {
        let mut volumes = Vec::new();
        for vg in &self.vgs {
            let output = run_helper(
                "lvs",
                [
                    "--noheadings",
                    "--separator",
                    ":",
                    "--units",
                    "b",
                    "--nosuffix",
                    "-o",
                    "lv_name,lv_path,lv_size",
                    vg,
                ],
            )
            .map_err(|e| e.in_stage("lvm"))?;
            for (name, path, size) in parse_lv_listing(&output.stdout) {
                let node = PathBuf::from(&path);
                let (kind, uuid, label) = probe_node(&node);
                volumes.push(PartitionInfo {
                    node,
                    kind,
                    size,
                    uuid,
                    label,
                    role: role_from_name(&name),
                });
            }
        }
        Ok(volumes)
    }

    /// Deactivate the image groups and restore renamed host groups.
    ///
    /// Idempotent; invoked from the pipeline's teardown path and again
    /// from drop as a fallback.
    pub fn teardown(&mut self) -> MigrateResult<()> {
        let mut first_error = None;

        if self.active {
            let retry = RetryPolicy::busy();
            for vg in &self.vgs {
                if let Err(err) = retry.run("vgchange deactivate", || {
                    run_helper("vgchange", ["-an", vg]).map(|_| ())
                }) {
                    tracing::warn!(vg = %vg, error = %err, "failed to deactivate volume group");
                    first_error.get_or_insert(err);
                }
            }
            self.active = false;
        }

        // Restore host names regardless of deactivation outcome.
        for host_vg in self.renamed.drain(..) {
            if let Err(err) = run_helper("vgrename", [host_vg.uuid.as_str(), host_vg.name.as_str()])
            {
                tracing::warn!(
                    vg = %host_vg.name,
                    error = %err,
                    "failed to restore host volume group name"
                );
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => Err(err.in_stage("lvm teardown")),
        }
    }

    fn best_effort_teardown(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::warn!(error = %err, "lvm teardown during error handling failed");
        }
    }
}

impl Drop for LvmSession {
    fn drop(&mut self) {
        if self.active || !self.renamed.is_empty() {
            tracing::warn!("lvm session dropped without explicit teardown, cleaning up");
            self.best_effort_teardown();
        }
    }
}

/// Host groups to rename: the ones sharing a name with an image group
/// but not backed by any of the image's member devices.
fn collision_candidates(
    same_name: &[&VolumeGroup],
    members: &[PathBuf],
) -> MigrateResult<Vec<VolumeGroup>> {
    let output = run_helper(
        "pvs",
        ["--noheadings", "--separator", ":", "-o", "pv_name,vg_uuid"],
    )
    .map_err(|e| e.in_stage("lvm"))?;
    let image_uuids: Vec<String> = output
        .stdout
        .lines()
        .filter_map(|line| {
            let (pv, uuid) = line.trim().split_once(':')?;
            let pv = Path::new(pv.trim());
            members
                .iter()
                .any(|m| m == pv)
                .then(|| uuid.trim().to_string())
        })
        .collect();
    Ok(same_name
        .iter()
        .filter(|vg| !image_uuids.contains(&vg.uuid))
        .map(|vg| (*vg).clone())
        .collect())
}

fn role_from_name(lv_name: &str) -> PartRole {
    let lowered = lv_name.to_ascii_lowercase();
    if lowered.contains("root") {
        PartRole::Root
    } else if lowered.contains("swap") {
        PartRole::SwapOrSkip
    } else {
        PartRole::AuxiliaryEssential
    }
}

fn parse_vg_listing(text: &str) -> Vec<VolumeGroup> {
    text.lines()
        .filter_map(|line| {
            let (name, uuid) = line.trim().split_once(':')?;
            Some(VolumeGroup {
                name: name.trim().to_string(),
                uuid: uuid.trim().to_string(),
            })
        })
        .collect()
}

fn parse_pv_listing(text: &str, members: &[PathBuf]) -> Vec<String> {
    let mut vgs = Vec::new();
    for line in text.lines() {
        let Some((pv, vg)) = line.trim().split_once(':') else {
            continue;
        };
        let pv = Path::new(pv.trim());
        let vg = vg.trim();
        if vg.is_empty() || !members.iter().any(|m| m == pv) {
            continue;
        }
        if !vgs.iter().any(|existing: &String| existing == vg) {
            vgs.push(vg.to_string());
        }
    }
    vgs
}

fn parse_lv_listing(text: &str) -> Vec<(String, String, u64)> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.trim().split(':');
            let name = parts.next()?.trim().to_string();
            let path = parts.next()?.trim().to_string();
            let size = parts.next()?.trim().parse().ok()?;
            if name.is_empty() || path.is_empty() {
                return None;
            }
            Some((name, path, size))
        })
        .collect()
}
