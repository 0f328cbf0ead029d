//! netplan declarative YAML planner (`/etc/netplan/*.yaml`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use imglift_shared::errors::{MigrateError, MigrateResult};

use super::SubsystemScan;

const NETPLAN_DIR: &str = "etc/netplan";

/// The replacement plan written after backup.
#[derive(Debug, Serialize, Deserialize)]
struct NetplanFile {
    network: NetplanNetwork,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetplanNetwork {
    version: u32,
    ethernets: BTreeMap<String, NetplanEthernet>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NetplanEthernet {
    dhcp4: bool,
}

pub(super) fn scan(root: &Path) -> MigrateResult<Option<SubsystemScan>> {
    let dir = root.join(NETPLAN_DIR);
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut scan = SubsystemScan::default();
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    entries.sort();

    for path in entries {
        let content = std::fs::read_to_string(&path).unwrap_or_default();
        // Existing plans come in many shapes; read them loosely and pull
        // out only the ethernet stanza names.
        if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(&content) {
            if let Some(ethernets) = value
                .get("network")
                .and_then(|n| n.get("ethernets"))
                .and_then(|e| e.as_mapping())
            {
                for key in ethernets.keys() {
                    if let Some(name) = key.as_str() {
                        scan.interfaces.push(name.to_string());
                    }
                }
            }
        } else {
            tracing::debug!(path = %path.display(), "unparseable netplan file");
        }
        scan.files.push(path);
    }

    if scan.files.is_empty() {
        Ok(None)
    } else {
        Ok(Some(scan))
    }
}

pub(super) fn rewrite(root: &Path, iface: &str) -> MigrateResult<()> {
    let dir = root.join(NETPLAN_DIR);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("99-imglift-dhcp.yaml");

    let mut ethernets = BTreeMap::new();
    ethernets.insert(iface.to_string(), NetplanEthernet { dhcp4: true });
    let plan = NetplanFile {
        network: NetplanNetwork {
            version: 2,
            ethernets,
        },
    };
    let content = serde_yaml::to_string(&plan)
        .map_err(|e| MigrateError::Guest(format!("cannot serialize netplan: {e}")))?;
    std::fs::write(&path, content)
        .map_err(|e| MigrateError::Guest(format!("cannot write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imglift_test_utils::guest::GuestTree;

    #[test]
    fn scan_pulls_ethernet_stanza_names() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        tree.netplan("eth0").unwrap();

        let scan = scan(tree.root()).unwrap().unwrap();
        assert_eq!(scan.interfaces, vec!["eth0"]);
    }

    #[test]
    fn rewrite_round_trips_as_dhcp_plan() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        tree.netplan("eth0").unwrap();

        rewrite(tree.root(), "eth0").unwrap();
        let content =
            std::fs::read_to_string(dir.path().join("etc/netplan/99-imglift-dhcp.yaml")).unwrap();
        let parsed: NetplanFile = serde_yaml::from_str(&content).unwrap();
        assert_eq!(parsed.network.version, 2);
        assert!(parsed.network.ethernets["eth0"].dhcp4);
    }

    #[test]
    fn unparseable_plans_are_still_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let tree = GuestTree::new(dir.path()).unwrap();
        let netplan_dir = dir.path().join("etc/netplan");
        std::fs::create_dir_all(&netplan_dir).unwrap();
        std::fs::write(netplan_dir.join("broken.yaml"), ":\n  - not yaml: [").unwrap();

        let scan = scan(tree.root()).unwrap().unwrap();
        assert!(scan.interfaces.is_empty());
        assert_eq!(scan.files.len(), 1);
    }
}
