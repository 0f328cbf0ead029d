//! Migration configuration.
//!
//! A YAML file supplies the knobs the core consumes as plain keyed
//! lookups: which helper binaries are expected (and which package ships
//! them), the per-family guest package lists, script templates written
//! into the guest, the staged cloud-agent location, and the result-file
//! path template. How the file got there is the frontend's problem.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use imglift_shared::errors::{MigrateError, MigrateResult};

use crate::tasks::OsFamily;

/// Keyed configuration for one migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// Helper binary -> package that provides it. Used by preflight to
    /// explain exactly what to install when a helper is missing.
    pub helpers: BTreeMap<String, String>,
    /// Template for the migration report path. `{image}` expands to the
    /// image file stem.
    pub result_path: String,
    /// Guest packages installed per OS family.
    pub os_packages: OsPackages,
    /// Script templates written into the guest, by name.
    pub scripts: BTreeMap<String, String>,
    /// Guest path where an optional cloud agent package was staged ahead
    /// of time (checked inside the isolated root).
    pub cloud_agent_stage: Option<String>,
}

/// Per-family guest package lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OsPackages {
    pub oracle: Vec<String>,
    pub debian: Vec<String>,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            helpers: default_helpers(),
            result_path: "/var/tmp/imglift-{image}.json".to_string(),
            os_packages: OsPackages {
                oracle: vec!["cloud-init".to_string()],
                debian: vec!["cloud-init".to_string()],
            },
            scripts: default_scripts(),
            cloud_agent_stage: None,
        }
    }
}

impl MigrateConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> MigrateResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&text).map_err(|e| {
            MigrateError::Config(format!("cannot parse config {}: {}", path.display(), e))
        })
    }

    /// The package list for one OS family.
    pub fn packages_for(&self, family: OsFamily) -> &[String] {
        match family {
            OsFamily::OracleLinux => &self.os_packages.oracle,
            OsFamily::Debian => &self.os_packages.debian,
            OsFamily::Template => &[],
        }
    }

    /// A script template by name, or a config error naming the key.
    pub fn script(&self, name: &str) -> MigrateResult<&str> {
        self.scripts
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| MigrateError::Config(format!("missing script template '{name}'")))
    }

    /// Expand the result-path template for one image.
    pub fn result_file(&self, image: &Path) -> PathBuf {
        let stem = image
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        PathBuf::from(self.result_path.replace("{image}", &stem))
    }
}

fn default_helpers() -> BTreeMap<String, String> {
    [
        ("qemu-nbd", "qemu-img"),
        ("sfdisk", "util-linux"),
        ("blkid", "util-linux"),
        ("mount", "util-linux"),
        ("pvs", "lvm2"),
        ("vgs", "lvm2"),
        ("lvs", "lvm2"),
        ("vgchange", "lvm2"),
        ("vgrename", "lvm2"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_scripts() -> BTreeMap<String, String> {
    let region_detect = "#!/bin/sh\n\
# Detect the cloud region from the instance metadata service on first\n\
# boot and record it for configuration tooling.\n\
METADATA_URL=\"http://169.254.169.254/opc/v2/instance/\"\n\
REGION=$(curl -sf -H 'Authorization: Bearer Oracle' \"$METADATA_URL\" | \
sed -n 's/.*\"canonicalRegionName\" *: *\"\\([^\"]*\\)\".*/\\1/p')\n\
[ -n \"$REGION\" ] && echo \"$REGION\" > /var/lib/imglift-region\n";
    [("region-detect".to_string(), region_detect.to_string())]
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_required_helper() {
        let config = MigrateConfig::default();
        for helper in ["qemu-nbd", "sfdisk", "blkid", "vgchange"] {
            assert!(config.helpers.contains_key(helper), "missing {helper}");
        }
    }

    #[test]
    fn yaml_round_trip_preserves_keyed_lookups() {
        let yaml = "
helpers:
  qemu-nbd: qemu-img
result_path: /tmp/report-{image}.json
os_packages:
  oracle: [cloud-init, oci-utils]
  debian: [cloud-init]
scripts:
  region-detect: \"#!/bin/sh\\necho hi\\n\"
cloud_agent_stage: /root/agent.rpm
";
        let config: MigrateConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.packages_for(OsFamily::OracleLinux).len(), 2);
        assert_eq!(config.script("region-detect").unwrap(), "#!/bin/sh\necho hi\n");
        assert!(config.script("nope").is_err());
        assert_eq!(
            config.result_file(Path::new("/images/web01.vmdk")),
            PathBuf::from("/tmp/report-web01.json")
        );
    }

    #[test]
    fn template_family_has_no_packages() {
        let config = MigrateConfig::default();
        assert!(config.packages_for(OsFamily::Template).is_empty());
    }
}
