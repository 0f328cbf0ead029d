//! Machine-readable migration report.
//!
//! Everything the operator (and the upload frontend) needs to know about
//! one run: what the image is, what was found inside it, what was
//! changed, and whether it may proceed to upload. Serialized as JSON to
//! the configured result path.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use imglift_shared::errors::{MigrateError, MigrateResult};

use crate::format::ImageHeader;
use crate::inspect::PartitionInfo;
use crate::netconfig::NetworkReport;
use crate::state::MigrationState;
use crate::tasks::TaskOutcome;

/// Full run summary handed past the upload boundary.
#[derive(Debug, Serialize)]
pub struct MigrationReport {
    pub image: PathBuf,
    pub format: Option<String>,
    /// Header fields in on-disk order, rendered as strings.
    pub header_fields: Vec<(String, String)>,
    pub logical_gib: Option<f64>,
    pub physical_gib: Option<f64>,
    pub boot_type: Option<String>,
    pub partitions: Vec<PartitionReport>,
    pub os_family: Option<String>,
    pub tasks: Vec<TaskReport>,
    pub interfaces: Vec<String>,
    pub network_snapshots: Vec<NetworkSnapshotReport>,
    pub eligible: bool,
    pub reasons: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PartitionReport {
    pub node: PathBuf,
    pub filesystem: String,
    pub size_bytes: u64,
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct TaskReport {
    pub name: String,
    pub ok: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NetworkSnapshotReport {
    pub subsystem: String,
    pub files: Vec<PathBuf>,
}

impl MigrationReport {
    /// Start an empty report for one image.
    pub fn new(image: &Path) -> Self {
        Self {
            image: image.to_path_buf(),
            format: None,
            header_fields: Vec::new(),
            logical_gib: None,
            physical_gib: None,
            boot_type: None,
            partitions: Vec::new(),
            os_family: None,
            tasks: Vec::new(),
            interfaces: Vec::new(),
            network_snapshots: Vec::new(),
            eligible: true,
            reasons: Vec::new(),
            finished_at: Utc::now(),
        }
    }

    /// Record the parsed header.
    pub fn set_header(&mut self, format: &str, header: &ImageHeader) {
        self.format = Some(format.to_string());
        self.header_fields = header
            .fields
            .iter()
            .map(|f| (f.name.to_string(), f.value.to_string()))
            .collect();
        self.logical_gib = Some(header.logical_gib());
        self.physical_gib = Some(header.physical_gib());
    }

    /// Record the partition inventory.
    pub fn set_partitions(&mut self, partitions: &[PartitionInfo]) {
        self.partitions = partitions
            .iter()
            .map(|p| PartitionReport {
                node: p.node.clone(),
                filesystem: p.kind.to_string(),
                size_bytes: p.size,
                role: format!("{:?}", p.role),
            })
            .collect();
    }

    /// Record the task outcomes.
    pub fn set_tasks(&mut self, outcomes: &[TaskOutcome]) {
        self.tasks = outcomes
            .iter()
            .map(|o| TaskReport {
                name: o.name.to_string(),
                ok: o.ok,
                detail: o.detail.clone(),
            })
            .collect();
    }

    /// Record the network scan results.
    pub fn set_network(&mut self, network: &NetworkReport) {
        self.interfaces = network.interfaces.clone();
        self.network_snapshots = network
            .snapshots
            .iter()
            .map(|s| NetworkSnapshotReport {
                subsystem: s.subsystem.to_string(),
                files: s.files.iter().map(|(p, _)| p.clone()).collect(),
            })
            .collect();
    }

    /// Take the final eligibility decision from the migration state.
    pub fn finalize(&mut self, state: &MigrationState) {
        self.eligible = state.is_eligible();
        self.reasons = state.reasons();
        self.finished_at = Utc::now();
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> MigrateResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MigrateError::Config(format!("cannot serialize report: {e}")))?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "migration report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_reflects_state_and_serializes() {
        let state = MigrationState::new();
        state.disqualify("too big");

        let mut report = MigrationReport::new(Path::new("/images/a.vmdk"));
        report.finalize(&state);
        assert!(!report.eligible);
        assert_eq!(report.reasons, vec!["too big"]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write_json(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"eligible\": false"));
        assert!(text.contains("too big"));
    }
}
