//! Fake guest filesystem trees.
//!
//! Builds a directory tree that looks like a mounted guest root: release
//! identifier, fstab, and per-subsystem network configuration files with
//! realistic content. Used by the mount-planning and network-rewrite
//! tests.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A guest root under construction.
pub struct GuestTree {
    root: PathBuf,
}

impl GuestTree {
    /// Create the base directory skeleton of a bootable guest.
    pub fn new(root: &Path) -> io::Result<Self> {
        for dir in [
            "bin", "boot", "etc", "lib", "opt", "sbin", "usr", "var", "root",
        ] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `/etc/os-release` with the given identifiers.
    pub fn os_release(&self, id: &str, id_like: Option<&str>) -> io::Result<()> {
        let mut content = format!("NAME=\"Test Linux\"\nID={id}\nVERSION_ID=\"9\"\n");
        if let Some(like) = id_like {
            content.push_str(&format!("ID_LIKE=\"{like}\"\n"));
        }
        fs::write(self.root.join("etc/os-release"), content)
    }

    /// Write `/etc/fstab` verbatim.
    pub fn fstab(&self, content: &str) -> io::Result<()> {
        fs::write(self.root.join("etc/fstab"), content)
    }

    /// Write a legacy `ifcfg` file for `iface` with a static address.
    pub fn ifcfg(&self, iface: &str) -> io::Result<PathBuf> {
        let dir = self.root.join("etc/sysconfig/network-scripts");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("ifcfg-{iface}"));
        fs::write(
            &path,
            format!(
                "DEVICE={iface}\nBOOTPROTO=static\nIPADDR=10.0.0.15\n\
                 NETMASK=255.255.255.0\nHWADDR=52:54:00:12:34:56\nONBOOT=yes\n"
            ),
        )?;
        Ok(path)
    }

    /// Write a NetworkManager key-file connection for `iface`.
    pub fn nm_keyfile(&self, iface: &str) -> io::Result<PathBuf> {
        let dir = self.root.join("etc/NetworkManager/system-connections");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{iface}.nmconnection"));
        fs::write(
            &path,
            format!(
                "[connection]\nid={iface}\ntype=ethernet\ninterface-name={iface}\n\n\
                 [ipv4]\nmethod=manual\naddress1=10.0.0.15/24,10.0.0.1\n"
            ),
        )?;
        Ok(path)
    }

    /// Write a netplan YAML planner file for `iface`.
    pub fn netplan(&self, iface: &str) -> io::Result<PathBuf> {
        let dir = self.root.join("etc/netplan");
        fs::create_dir_all(&dir)?;
        let path = dir.join("50-cloud-init.yaml");
        fs::write(
            &path,
            format!(
                "network:\n  version: 2\n  ethernets:\n    {iface}:\n      \
                 addresses: [10.0.0.15/24]\n      gateway4: 10.0.0.1\n"
            ),
        )?;
        Ok(path)
    }

    /// Write a systemd-networkd descriptor for `iface`.
    pub fn networkd(&self, iface: &str) -> io::Result<PathBuf> {
        let dir = self.root.join("etc/systemd/network");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("10-{iface}.network"));
        fs::write(
            &path,
            format!("[Match]\nName={iface}\n\n[Network]\nAddress=10.0.0.15/24\nGateway=10.0.0.1\n"),
        )?;
        Ok(path)
    }

    /// Write a flat `/etc/network/interfaces` file for `iface`.
    pub fn interfaces_file(&self, iface: &str) -> io::Result<PathBuf> {
        let dir = self.root.join("etc/network");
        fs::create_dir_all(&dir)?;
        let path = dir.join("interfaces");
        fs::write(
            &path,
            format!(
                "auto lo\niface lo inet loopback\n\nauto {iface}\n\
                 iface {iface} inet static\n    address 10.0.0.15\n    netmask 255.255.255.0\n"
            ),
        )?;
        Ok(path)
    }
}
