//! Partition, filesystem, and boot-type inspection of a bound device.
//!
//! Enumerates the kernel partition table through `sfdisk --json`,
//! cross-references `blkid` signature probing for filesystem
//! classification, and expands LVM physical members into their logical
//! volumes. Boot-type classification is a required output: an image with
//! no recognizable boot configuration is rejected here, before anything
//! is mounted.

pub mod lvm;

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use imglift_shared::constants::geometry::SECTOR_SIZE;
use imglift_shared::errors::{MigrateError, MigrateResult};

use crate::binder::BoundDevice;
use crate::util::process::run_helper;

/// EFI System Partition type GUID (GPT).
const ESP_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
/// BIOS boot partition type GUID (GPT).
const BIOS_BOOT_GUID: &str = "21686148-6449-6E6F-744E-656564454649";

/// Filesystem classification from signature probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsKind {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    Ocfs2,
    LvmMember,
    Swap,
    Other(String),
}

impl FsKind {
    /// Map a blkid `TYPE` value onto the known set.
    pub fn from_signature(signature: &str) -> Self {
        match signature {
            "ext2" => FsKind::Ext2,
            "ext3" => FsKind::Ext3,
            "ext4" => FsKind::Ext4,
            "xfs" => FsKind::Xfs,
            "btrfs" => FsKind::Btrfs,
            "ocfs2" => FsKind::Ocfs2,
            "LVM2_member" => FsKind::LvmMember,
            "swap" => FsKind::Swap,
            other => FsKind::Other(other.to_string()),
        }
    }

    /// Whether this is a filesystem the mount orchestrator may try.
    pub fn mountable(&self) -> bool {
        matches!(
            self,
            FsKind::Ext2 | FsKind::Ext3 | FsKind::Ext4 | FsKind::Xfs | FsKind::Btrfs | FsKind::Ocfs2
        )
    }

    /// The mount-helper filesystem type string.
    pub fn as_str(&self) -> &str {
        match self {
            FsKind::Ext2 => "ext2",
            FsKind::Ext3 => "ext3",
            FsKind::Ext4 => "ext4",
            FsKind::Xfs => "xfs",
            FsKind::Btrfs => "btrfs",
            FsKind::Ocfs2 => "ocfs2",
            FsKind::LvmMember => "LVM2_member",
            FsKind::Swap => "swap",
            FsKind::Other(s) => s,
        }
    }
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a partition plays in the migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartRole {
    /// EFI system partition or dedicated boot partition.
    Boot,
    /// The root filesystem (promoted by the mount orchestrator).
    Root,
    /// Required to satisfy the essential-directory invariant.
    AuxiliaryEssential,
    /// Swap or otherwise not mounted during migration.
    SwapOrSkip,
}

/// Upload-time launch-mode recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootType {
    Bios,
    Uefi,
}

impl fmt::Display for BootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootType::Bios => write!(f, "BIOS"),
            BootType::Uefi => write!(f, "UEFI"),
        }
    }
}

/// One discovered partition or logical volume. Read-only after discovery.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub node: PathBuf,
    pub kind: FsKind,
    /// Size in bytes.
    pub size: u64,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub role: PartRole,
}

/// Result of inspecting a bound device.
pub struct Inspection {
    pub boot_type: BootType,
    pub partitions: Vec<PartitionInfo>,
    /// Present when LVM members were found and activated; owns the
    /// deactivate/rename-restore teardown.
    pub lvm: Option<lvm::LvmSession>,
}

#[derive(Debug, Deserialize)]
struct SfdiskReport {
    partitiontable: PartitionTable,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PartitionTable {
    label: String,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
struct SfdiskPartition {
    node: String,
    /// Size in 512-byte sectors.
    #[serde(default)]
    size: u64,
    #[serde(rename = "type")]
    part_type: String,
    #[serde(default)]
    bootable: bool,
}

/// Inspect a bound device: partition table, filesystem signatures, LVM.
pub fn inspect(device: &BoundDevice) -> MigrateResult<Inspection> {
    let table = read_partition_table(device.path())?;
    let boot_type = classify_boot(&table).ok_or_else(|| {
        MigrateError::Format(
            "no recognizable boot configuration (no EFI system partition, \
             BIOS-boot partition, or MBR boot flag)"
                .to_string(),
        )
    })?;

    let mut partitions = Vec::new();
    for entry in &table.partitions {
        let node = PathBuf::from(&entry.node);
        let (kind, uuid, label) = probe_node(&node);
        let role = initial_role(entry, &kind);
        partitions.push(PartitionInfo {
            node,
            kind,
            size: entry.size * SECTOR_SIZE,
            uuid,
            label,
            role,
        });
    }

    let members: Vec<PathBuf> = partitions
        .iter()
        .filter(|p| p.kind == FsKind::LvmMember)
        .map(|p| p.node.clone())
        .collect();
    let lvm = if members.is_empty() {
        None
    } else {
        let session = lvm::activate(&members)?;
        partitions.extend(session.logical_volumes()?);
        Some(session)
    };

    tracing::info!(
        device = %device.path().display(),
        boot_type = %boot_type,
        partitions = partitions.len(),
        lvm = lvm.is_some(),
        "inspection complete"
    );
    Ok(Inspection {
        boot_type,
        partitions,
        lvm,
    })
}

fn read_partition_table(device: &Path) -> MigrateResult<PartitionTable> {
    let output = run_helper("sfdisk", [OsStr::new("--json"), device.as_os_str()])
        .map_err(|e| e.in_stage("inspect"))?;
    let report: SfdiskReport = serde_json::from_str(&output.stdout).map_err(|e| {
        MigrateError::Resource(format!(
            "cannot parse sfdisk output for {}: {}",
            device.display(),
            e
        ))
    })?;
    Ok(report.partitiontable)
}

/// Boot-type classification with explicit precedence:
/// 1. GPT table containing an EFI System Partition -> UEFI
/// 2. GPT table containing a BIOS-boot partition   -> BIOS
/// 3. DOS/MBR table with any bootable flag set     -> BIOS
/// 4. otherwise unclassifiable (caller rejects)
pub(crate) fn classify_boot(table: &PartitionTable) -> Option<BootType> {
    match table.label.as_str() {
        "gpt" => {
            if table
                .partitions
                .iter()
                .any(|p| p.part_type.eq_ignore_ascii_case(ESP_GUID))
            {
                Some(BootType::Uefi)
            } else if table
                .partitions
                .iter()
                .any(|p| p.part_type.eq_ignore_ascii_case(BIOS_BOOT_GUID))
            {
                Some(BootType::Bios)
            } else {
                None
            }
        }
        "dos" => {
            if table.partitions.iter().any(|p| p.bootable) {
                Some(BootType::Bios)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn initial_role(entry: &SfdiskPartition, kind: &FsKind) -> PartRole {
    if entry.part_type.eq_ignore_ascii_case(ESP_GUID) || entry.part_type == "ef" {
        return PartRole::Boot;
    }
    match kind {
        FsKind::Swap | FsKind::LvmMember => PartRole::SwapOrSkip,
        FsKind::Other(_) => PartRole::SwapOrSkip,
        _ => PartRole::AuxiliaryEssential,
    }
}

/// Probe one node with blkid. A missing signature is not an error; the
/// partition is simply classified `Other` and skipped by the planner.
pub(crate) fn probe_node(node: &Path) -> (FsKind, Option<String>, Option<String>) {
    match run_helper("blkid", [OsStr::new("-o"), OsStr::new("export"), node.as_os_str()]) {
        Ok(output) => {
            let map = parse_blkid_export(&output.stdout);
            let kind = map
                .get("TYPE")
                .map(|t| FsKind::from_signature(t))
                .unwrap_or(FsKind::Other("unknown".to_string()));
            (kind, map.get("UUID").cloned(), map.get("LABEL").cloned())
        }
        Err(err) => {
            tracing::debug!(node = %node.display(), error = %err, "blkid found no signature");
            (FsKind::Other("unknown".to_string()), None, None)
        }
    }
}

/// Parse `blkid -o export` KEY=VALUE lines.
pub(crate) fn parse_blkid_export(text: &str) -> std::collections::BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            line.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(json: &str) -> PartitionTable {
        let report: SfdiskReport = serde_json::from_str(json).unwrap();
        report.partitiontable
    }

    #[test]
    fn gpt_with_esp_classifies_uefi_before_bios_boot() {
        // Both markers present: ESP wins by documented precedence.
        let table = table(
            r#"{"partitiontable": {"label": "gpt", "partitions": [
                {"node": "/dev/nbd0p1", "start": 2048, "size": 1048576,
                 "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B"},
                {"node": "/dev/nbd0p2", "start": 1050624, "size": 2048,
                 "type": "21686148-6449-6E6F-744E-656564454649"}
            ]}}"#,
        );
        assert_eq!(classify_boot(&table), Some(BootType::Uefi));
    }

    #[test]
    fn gpt_with_bios_boot_only_classifies_bios() {
        let table = table(
            r#"{"partitiontable": {"label": "gpt", "partitions": [
                {"node": "/dev/nbd0p1", "start": 2048, "size": 2048,
                 "type": "21686148-6449-6E6F-744E-656564454649"},
                {"node": "/dev/nbd0p2", "start": 4096, "size": 20971520,
                 "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4"}
            ]}}"#,
        );
        assert_eq!(classify_boot(&table), Some(BootType::Bios));
    }

    #[test]
    fn dos_with_boot_flag_classifies_bios() {
        let table = table(
            r#"{"partitiontable": {"label": "dos", "partitions": [
                {"node": "/dev/nbd0p1", "start": 2048, "size": 20971520,
                 "type": "83", "bootable": true}
            ]}}"#,
        );
        assert_eq!(classify_boot(&table), Some(BootType::Bios));
    }

    #[test]
    fn unclassifiable_tables_yield_none() {
        let no_flag = table(
            r#"{"partitiontable": {"label": "dos", "partitions": [
                {"node": "/dev/nbd0p1", "start": 2048, "size": 2048, "type": "83"}
            ]}}"#,
        );
        assert_eq!(classify_boot(&no_flag), None);

        let plain_gpt = table(
            r#"{"partitiontable": {"label": "gpt", "partitions": [
                {"node": "/dev/nbd0p1", "start": 2048, "size": 2048,
                 "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4"}
            ]}}"#,
        );
        assert_eq!(classify_boot(&plain_gpt), None);
    }

    #[test]
    fn blkid_export_parses_key_values() {
        let map = parse_blkid_export(
            "DEVNAME=/dev/nbd0p2\nUUID=0a1b2c3d\nTYPE=ext4\nLABEL=root\n",
        );
        assert_eq!(map.get("TYPE").map(String::as_str), Some("ext4"));
        assert_eq!(map.get("LABEL").map(String::as_str), Some("root"));
    }

    #[test]
    fn signature_mapping_covers_the_known_set() {
        assert_eq!(FsKind::from_signature("ext4"), FsKind::Ext4);
        assert_eq!(FsKind::from_signature("LVM2_member"), FsKind::LvmMember);
        assert_eq!(FsKind::from_signature("swap"), FsKind::Swap);
        assert_eq!(
            FsKind::from_signature("vfat"),
            FsKind::Other("vfat".to_string())
        );
        assert!(FsKind::Ext3.mountable());
        assert!(!FsKind::Swap.mountable());
    }
}
