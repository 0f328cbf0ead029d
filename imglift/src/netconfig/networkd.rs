//! systemd-networkd per-interface descriptors
//! (`/etc/systemd/network/*.network`).

use std::path::Path;

use imglift_shared::errors::{MigrateError, MigrateResult};

use super::SubsystemScan;

const NETWORK_DIR: &str = "etc/systemd/network";

pub(super) fn scan(root: &Path) -> MigrateResult<Option<SubsystemScan>> {
    let dir = root.join(NETWORK_DIR);
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut scan = SubsystemScan::default();
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("network"))
        .collect();
    entries.sort();

    for path in entries {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        if let Some(name) = match_name(&content) {
            if name != "lo" {
                scan.interfaces.push(name);
            }
        }
        scan.files.push(path);
    }

    if scan.files.is_empty() {
        Ok(None)
    } else {
        Ok(Some(scan))
    }
}

/// Pull `Name=` out of the `[Match]` section.
fn match_name(content: &str) -> Option<String> {
    let mut in_match = false;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_match = line.eq_ignore_ascii_case("[match]");
            continue;
        }
        if in_match {
            if let Some(name) = line.strip_prefix("Name=") {
                let name = name.trim().to_string();
                if !name.is_empty() {
                    return Some(name);
                }
            }
        }
    }
    None
}

pub(super) fn rewrite(root: &Path, iface: &str) -> MigrateResult<()> {
    let dir = root.join(NETWORK_DIR);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("99-imglift-dhcp.network");
    let content = format!("[Match]\nName={iface}\n\n[Network]\nDHCP=yes\n");
    std::fs::write(&path, content)
        .map_err(|e| MigrateError::Guest(format!("cannot write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imglift_test_utils::guest::GuestTree;

    #[test]
    fn scan_reads_the_match_section_name() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        tree.networkd("ens5").unwrap();

        let scan = scan(tree.root()).unwrap().unwrap();
        assert_eq!(scan.interfaces, vec!["ens5"]);
    }

    #[test]
    fn name_outside_match_section_is_ignored() {
        assert_eq!(
            match_name("[Link]\nName=ignored\n\n[Match]\nName=ens5\n"),
            Some("ens5".to_string())
        );
        assert_eq!(match_name("[Network]\nDHCP=yes\n"), None);
    }

    #[test]
    fn rewrite_emits_a_dhcp_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        tree.networkd("ens5").unwrap();

        rewrite(tree.root(), "ens5").unwrap();
        let content = std::fs::read_to_string(
            dir.path().join("etc/systemd/network/99-imglift-dhcp.network"),
        )
        .unwrap();
        assert!(content.contains("Name=ens5"));
        assert!(content.contains("DHCP=yes"));
    }
}
