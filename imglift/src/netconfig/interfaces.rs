//! Flat Debian-style interfaces file (`/etc/network/interfaces` plus
//! `interfaces.d` drop-ins).

use std::path::Path;

use imglift_shared::errors::{MigrateError, MigrateResult};

use super::SubsystemScan;

const INTERFACES_FILE: &str = "etc/network/interfaces";
const DROPIN_DIR: &str = "etc/network/interfaces.d";

pub(super) fn scan(root: &Path) -> MigrateResult<Option<SubsystemScan>> {
    let main = root.join(INTERFACES_FILE);
    if !main.is_file() {
        return Ok(None);
    }

    let mut scan = SubsystemScan::default();
    collect(&main, &mut scan);

    let dropin_dir = root.join(DROPIN_DIR);
    if dropin_dir.is_dir() {
        let mut dropins: Vec<_> = std::fs::read_dir(&dropin_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        dropins.sort();
        for path in dropins {
            collect(&path, &mut scan);
        }
    }

    Ok(Some(scan))
}

fn collect(path: &Path, scan: &mut SubsystemScan) {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    for line in content.lines() {
        let mut fields = line.trim().split_whitespace();
        match fields.next() {
            Some("iface") | Some("auto") | Some("allow-hotplug") => {
                if let Some(name) = fields.next() {
                    if name != "lo" && !scan.interfaces.iter().any(|n| n == name) {
                        scan.interfaces.push(name.to_string());
                    }
                }
            }
            _ => {}
        }
    }
    scan.files.push(path.to_path_buf());
}

pub(super) fn rewrite(root: &Path, iface: &str) -> MigrateResult<()> {
    let path = root.join(INTERFACES_FILE);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = format!(
        "auto lo\niface lo inet loopback\n\nauto {iface}\niface {iface} inet dhcp\n"
    );
    std::fs::write(&path, content)
        .map_err(|e| MigrateError::Guest(format!("cannot write {}: {}", path.display(), e)))
}
