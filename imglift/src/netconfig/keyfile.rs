//! NetworkManager key-file store
//! (`/etc/NetworkManager/system-connections/*.nmconnection`).

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use walkdir::WalkDir;

use imglift_shared::errors::{MigrateError, MigrateResult};

use super::SubsystemScan;

const CONNECTIONS_DIR: &str = "etc/NetworkManager/system-connections";

pub(super) fn scan(root: &Path) -> MigrateResult<Option<SubsystemScan>> {
    let dir = root.join(CONNECTIONS_DIR);
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut scan = SubsystemScan::default();
    // The store occasionally grows subdirectories (package drop-ins);
    // walk it instead of assuming a flat layout.
    for entry in WalkDir::new(&dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("nmconnection") {
            continue;
        }
        let content = std::fs::read_to_string(path).unwrap_or_default();
        if let Some(name) = content
            .lines()
            .find_map(|line| line.trim().strip_prefix("interface-name="))
        {
            let name = name.trim().to_string();
            if !name.is_empty() && name != "lo" {
                scan.interfaces.push(name);
            }
        }
        scan.files.push(path.to_path_buf());
    }

    if scan.files.is_empty() {
        Ok(None)
    } else {
        Ok(Some(scan))
    }
}

pub(super) fn rewrite(root: &Path, iface: &str) -> MigrateResult<()> {
    let dir = root.join(CONNECTIONS_DIR);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("imglift-default.nmconnection");
    let content = format!(
        "[connection]\nid=imglift-default\ntype=ethernet\ninterface-name={iface}\n\
         autoconnect=true\n\n[ipv4]\nmethod=auto\n\n[ipv6]\nmethod=auto\n"
    );
    std::fs::write(&path, content)
        .map_err(|e| MigrateError::Guest(format!("cannot write {}: {}", path.display(), e)))?;
    // NetworkManager refuses world-readable connection files.
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| MigrateError::Guest(format!("cannot chmod {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imglift_test_utils::guest::GuestTree;

    #[test]
    fn scan_collects_interface_names_from_keyfiles() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        tree.nm_keyfile("enp0s5").unwrap();

        let scan = scan(tree.root()).unwrap().unwrap();
        assert_eq!(scan.interfaces, vec!["enp0s5"]);
    }

    #[test]
    fn rewrite_writes_a_restricted_mode_keyfile() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        tree.nm_keyfile("enp0s5").unwrap();

        rewrite(tree.root(), "enp0s5").unwrap();
        let path = dir
            .path()
            .join("etc/NetworkManager/system-connections/imglift-default.nmconnection");
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("method=auto"));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
