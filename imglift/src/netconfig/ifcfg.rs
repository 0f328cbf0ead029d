//! Legacy per-interface `ifcfg` files
//! (`/etc/sysconfig/network-scripts/ifcfg-*`).

use std::path::Path;

use imglift_shared::errors::{MigrateError, MigrateResult};

use super::SubsystemScan;

const SCRIPTS_DIR: &str = "etc/sysconfig/network-scripts";

pub(super) fn scan(root: &Path) -> MigrateResult<Option<SubsystemScan>> {
    let dir = root.join(SCRIPTS_DIR);
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut scan = SubsystemScan::default();
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let Some(suffix) = name.strip_prefix("ifcfg-") else {
            continue;
        };
        if suffix == "lo" {
            continue;
        }
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        let device = content
            .lines()
            .find_map(|line| line.trim().strip_prefix("DEVICE="))
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_else(|| suffix.to_string());
        scan.interfaces.push(device);
        scan.files.push(path);
    }

    if scan.files.is_empty() {
        Ok(None)
    } else {
        Ok(Some(scan))
    }
}

pub(super) fn rewrite(root: &Path, iface: &str) -> MigrateResult<()> {
    let dir = root.join(SCRIPTS_DIR);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("ifcfg-{iface}"));
    let content = format!(
        "DEVICE={iface}\nTYPE=Ethernet\nBOOTPROTO=dhcp\nONBOOT=yes\n\
         DEFROUTE=yes\nPEERDNS=yes\nNM_CONTROLLED=yes\n"
    );
    std::fs::write(&path, content)
        .map_err(|e| MigrateError::Guest(format!("cannot write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imglift_test_utils::guest::GuestTree;

    #[test]
    fn scan_reads_device_names_and_skips_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        tree.ifcfg("ens3").unwrap();
        let lo_dir = dir.path().join("etc/sysconfig/network-scripts");
        std::fs::write(lo_dir.join("ifcfg-lo"), "DEVICE=lo\n").unwrap();

        let scan = scan(tree.root()).unwrap().unwrap();
        assert_eq!(scan.interfaces, vec!["ens3"]);
        assert_eq!(scan.files.len(), 1);
    }

    #[test]
    fn rewrite_produces_dhcp_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        tree.ifcfg("ens3").unwrap();

        rewrite(tree.root(), "ens3").unwrap();
        let content = std::fs::read_to_string(
            dir.path().join("etc/sysconfig/network-scripts/ifcfg-ens3"),
        )
        .unwrap();
        assert!(content.contains("BOOTPROTO=dhcp"));
        assert!(!content.contains("HWADDR"));
    }

    #[test]
    fn absent_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan(dir.path()).unwrap().is_none());
    }
}
