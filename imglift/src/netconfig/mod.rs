//! Guest network reconfiguration.
//!
//! Probes the network-configuration subsystems a guest might use, in a
//! fixed order, and replaces whatever it finds with a minimal DHCP
//! single-interface configuration. Hard-coded MAC addresses and stale
//! interface names are the classic cause of import-time network loss.
//! Originals are renamed to timestamped backups, never deleted. Runs
//! against the mounted tree, not inside the isolated root.

pub mod ifcfg;
pub mod interfaces;
pub mod keyfile;
pub mod netplan;
pub mod networkd;

use std::path::{Path, PathBuf};

use chrono::Utc;

use imglift_shared::errors::{MigrateError, MigrateResult};

/// What one subsystem's probe found.
#[derive(Debug, Default)]
pub struct SubsystemScan {
    /// Configuration files belonging to the subsystem.
    pub files: Vec<PathBuf>,
    /// Interface names the files mention, in discovery order.
    pub interfaces: Vec<String>,
}

/// Captured pre-migration configuration of one subsystem.
#[derive(Debug)]
pub struct SubsystemSnapshot {
    pub subsystem: &'static str,
    /// (original path, file content) pairs captured before the rewrite.
    pub files: Vec<(PathBuf, String)>,
}

/// Result of the scan-and-fix pass.
#[derive(Debug, Default)]
pub struct NetworkReport {
    /// Union of interface names across all subsystems, discovery order.
    /// May be empty; some guests configure networking purely through the
    /// init-time agent at first boot.
    pub interfaces: Vec<String>,
    pub snapshots: Vec<SubsystemSnapshot>,
}

struct Subsystem {
    name: &'static str,
    scan: fn(&Path) -> MigrateResult<Option<SubsystemScan>>,
    rewrite: fn(&Path, &str) -> MigrateResult<()>,
}

/// Fixed probe order.
const SUBSYSTEMS: &[Subsystem] = &[
    Subsystem {
        name: "ifcfg",
        scan: ifcfg::scan,
        rewrite: ifcfg::rewrite,
    },
    Subsystem {
        name: "networkmanager-keyfile",
        scan: keyfile::scan,
        rewrite: keyfile::rewrite,
    },
    Subsystem {
        name: "netplan",
        scan: netplan::scan,
        rewrite: netplan::rewrite,
    },
    Subsystem {
        name: "systemd-networkd",
        scan: networkd::scan,
        rewrite: networkd::rewrite,
    },
    Subsystem {
        name: "interfaces",
        scan: interfaces::scan,
        rewrite: interfaces::rewrite,
    },
];

/// Probe every subsystem, snapshot and back up what exists, and write
/// replacement DHCP configuration for the first interface discovered.
pub fn scan_and_fix(root: &Path) -> MigrateResult<NetworkReport> {
    let mut report = NetworkReport::default();
    let mut scans = Vec::new();

    for subsystem in SUBSYSTEMS {
        match (subsystem.scan)(root)? {
            Some(scan) => {
                tracing::info!(
                    subsystem = subsystem.name,
                    files = scan.files.len(),
                    interfaces = ?scan.interfaces,
                    "network subsystem found"
                );
                for name in &scan.interfaces {
                    if !report.interfaces.contains(name) {
                        report.interfaces.push(name.clone());
                    }
                }
                scans.push((subsystem, scan));
            }
            None => {
                tracing::debug!(subsystem = subsystem.name, "subsystem not present");
            }
        }
    }

    let first_iface = report.interfaces.first().cloned();
    if first_iface.is_none() && !scans.is_empty() {
        tracing::warn!("network configuration found but no interface name; leaving it untouched");
    }
    if report.interfaces.is_empty() {
        tracing::info!("no interface names discovered in any subsystem");
    }

    let stamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    for (subsystem, scan) in scans {
        let mut snapshot = SubsystemSnapshot {
            subsystem: subsystem.name,
            files: Vec::new(),
        };
        for file in &scan.files {
            let content = std::fs::read_to_string(file).unwrap_or_default();
            snapshot.files.push((file.clone(), content));
            backup_file(file, &stamp)?;
        }
        if let Some(iface) = &first_iface {
            (subsystem.rewrite)(root, iface)
                .map_err(|e| e.in_stage("network rewrite"))?;
            tracing::info!(
                subsystem = subsystem.name,
                interface = %iface,
                "replacement DHCP configuration written"
            );
        }
        report.snapshots.push(snapshot);
    }

    Ok(report)
}

/// Rename a configuration file to a timestamped backup beside it.
fn backup_file(path: &Path, stamp: &str) -> MigrateResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            MigrateError::Guest(format!("cannot back up pathless file {}", path.display()))
        })?;
    let backup = path.with_file_name(format!("{file_name}.premigrate-{stamp}"));
    std::fs::rename(path, &backup).map_err(|e| {
        MigrateError::Guest(format!(
            "cannot back up {} to {}: {}",
            path.display(),
            backup.display(),
            e
        ))
    })?;
    tracing::debug!(original = %path.display(), backup = %backup.display(), "backed up");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use imglift_test_utils::guest::GuestTree;

    #[test]
    fn union_of_interfaces_across_subsystems_in_probe_order() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        tree.ifcfg("ens3").unwrap();
        tree.netplan("eth0").unwrap();
        tree.networkd("ens3").unwrap();

        let report = scan_and_fix(tree.root()).unwrap();
        assert_eq!(report.interfaces, vec!["ens3", "eth0"]);
        assert_eq!(report.snapshots.len(), 3);
    }

    #[test]
    fn originals_become_timestamped_backups_never_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        let original = tree.ifcfg("eth0").unwrap();

        let report = scan_and_fix(tree.root()).unwrap();
        assert!(!original.exists());

        let script_dir = original.parent().unwrap();
        let backups: Vec<_> = std::fs::read_dir(script_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains("premigrate-"))
            .collect();
        assert_eq!(backups.len(), 1);
        // Snapshot preserved the original content for the report.
        assert!(report.snapshots[0].files[0].1.contains("BOOTPROTO=static"));
    }

    #[test]
    fn empty_guest_reports_no_interfaces_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();

        let report = scan_and_fix(tree.root()).unwrap();
        assert!(report.interfaces.is_empty());
        assert!(report.snapshots.is_empty());
    }
}
