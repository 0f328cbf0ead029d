//! The migration pipeline.
//!
//! Strictly sequential: detect, parse, preflight, bind, inspect, mount,
//! guest tasks, network rewrite, then symmetric teardown. Each stage's
//! output is the next stage's input and the bound device, mounts, and
//! isolated root are exclusive resources, so there is nothing to
//! parallelize. Format-class findings disqualify and let the run finish
//! its inspection; resource-class failures abort after full cleanup.
//!
//! External helpers are synchronous and carry no timeout: a hung helper
//! hangs the pipeline. That limitation is inherited deliberately;
//! timeout/cancellation support is a known candidate improvement.

use std::path::{Path, PathBuf};
use std::time::Duration;

use imglift_shared::errors::{MigrateError, MigrateResult};

use crate::binder::NbdBinder;
use crate::config::MigrateConfig;
use crate::format::{self, ContainerFormat, ImageFile, ImageHeader, SupportCheck};
use crate::inspect;
use crate::mount;
use crate::netconfig;
use crate::progress::ProgressTicker;
use crate::report::MigrationReport;
use crate::state::MigrationState;
use crate::tasks;

/// Options for one migration run.
#[derive(Debug, Clone)]
pub struct MigrateOptions {
    pub image: PathBuf,
    pub config: MigrateConfig,
    /// Accept fragile-variant confirmations without an operator present.
    pub assume_yes: bool,
}

/// Everything preflight learns without touching kernel resources.
pub struct Preflight {
    pub image: ImageFile,
    pub format: &'static dyn ContainerFormat,
    pub header: ImageHeader,
    pub support: SupportCheck,
}

/// Run format detection, header parsing, and prerequisite checks.
///
/// Disqualifying findings land in `state` instead of aborting, so the
/// operator sees every preflight problem at once. Returns `None` when
/// the image could not even be parsed (nothing further can run).
pub fn preflight(
    image_path: &Path,
    state: &MigrationState,
    assume_yes: bool,
) -> MigrateResult<Option<Preflight>> {
    let image = ImageFile::open(image_path)?;

    let format = match format::detect(&image) {
        Ok(format) => format,
        Err(err) => {
            state.disqualify(err.to_string());
            return Ok(None);
        }
    };

    let header = match format.parse(&image.path) {
        Ok(header) => header,
        Err(err @ (MigrateError::TruncatedHeader(_) | MigrateError::Format(_))) => {
            state.disqualify(err.to_string());
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    let support = format.check_prerequisites(&header);
    for failure in &support.failures {
        state.disqualify(failure.clone());
    }
    if let Some(confirmation) = &support.confirmation {
        if assume_yes {
            tracing::warn!(%confirmation, "operator pre-confirmed, continuing");
        } else {
            state.disqualify(format!(
                "{confirmation} (re-run with --assume-yes to accept)"
            ));
        }
    }

    Ok(Some(Preflight {
        image,
        format,
        header,
        support,
    }))
}

/// Execute the full migration pipeline for one image.
///
/// Always returns a report when the pipeline itself held together;
/// `Err` means a resource-class failure after symmetric cleanup.
pub fn run(options: &MigrateOptions) -> MigrateResult<MigrationReport> {
    let state = MigrationState::new();
    let mut report = MigrationReport::new(&options.image);

    let preflight_info = preflight(&options.image, &state, options.assume_yes)?;
    if let Some(info) = &preflight_info {
        report.set_header(info.format.descriptor().name, &info.header);
    }

    check_helpers(&options.config, &state);

    if !state.is_eligible() {
        tracing::warn!("preflight disqualified the image, skipping guest modification");
        report.finalize(&state);
        return Ok(report);
    }

    if !nix::unistd::geteuid().is_root() {
        return Err(MigrateError::Resource(
            "migration requires root privileges for device binding and mounting".to_string(),
        ));
    }

    let binder = NbdBinder::new();
    let mut bound = binder.bind(&options.image)?;

    let outcome = prepare_guest(options, &state, &mut report, &bound);

    // Teardown always runs; a teardown failure only masks success.
    let unbind_result = bound.unbind();
    match outcome {
        Ok(()) => unbind_result?,
        Err(err) => {
            if let Err(unbind_err) = unbind_result {
                tracing::warn!(error = %unbind_err, "unbind after failed run also failed");
            }
            return Err(err);
        }
    }

    report.finalize(&state);
    Ok(report)
}

/// The mutation phase: inspect, mount, run tasks, rewrite networking.
fn prepare_guest(
    options: &MigrateOptions,
    state: &MigrationState,
    report: &mut MigrationReport,
    bound: &crate::binder::BoundDevice,
) -> MigrateResult<()> {
    let inspection = match inspect::inspect(bound) {
        Ok(inspection) => inspection,
        Err(err @ MigrateError::Format(_)) => {
            // Image-shaped problem (e.g. no recognizable boot type):
            // disqualify, report, tear down cleanly.
            state.disqualify(err.to_string());
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    report.boot_type = Some(inspection.boot_type.to_string());
    report.set_partitions(&inspection.partitions);

    let scratch = tempfile::tempdir().map_err(|e| {
        MigrateError::Resource(format!("cannot create scratch directory: {e}"))
    })?;

    let mut lvm = inspection.lvm;
    let partitions = inspection.partitions;

    let guest_result = (|| -> MigrateResult<()> {
        let (root, fstab, top_level) = match mount::find_root(&partitions, scratch.path()) {
            Ok(found) => found,
            Err(err @ MigrateError::Format(_)) => {
                state.disqualify(err.to_string());
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let plan = match mount::build_plan(root, &fstab, &partitions, &top_level) {
            Ok(plan) => plan,
            Err(err @ MigrateError::Format(_)) => {
                state.disqualify(err.to_string());
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let mut tree = mount::mount(&plan, scratch.path())?;

        let guest_outcome = (|| -> MigrateResult<()> {
            let family = tasks::detect_family(tree.path());
            report.os_family = Some(family.to_string());

            let ticker = ProgressTicker::start("guest task execution", Duration::from_secs(10));
            let outcomes = tasks::run_tasks(tree.path(), family, &options.config, state);
            ticker.stop();
            report.set_tasks(&outcomes?);

            let network = netconfig::scan_and_fix(tree.path())?;
            if network.interfaces.is_empty() {
                tracing::info!(
                    "no interfaces discovered; guest may configure networking at first boot"
                );
            }
            report.set_network(&network);
            Ok(())
        })();

        // Unmount before propagating so no partial mount state survives.
        let unmount_result = tree.unmount();
        guest_outcome?;
        unmount_result?;
        Ok(())
    })();

    // The LVM session tears down after unmount (its volumes were the
    // mounted filesystems) and before unbind, restoring renamed host
    // groups regardless of the guest outcome.
    let lvm_result = match lvm.as_mut() {
        Some(session) => session.teardown(),
        None => Ok(()),
    };

    guest_result?;
    lvm_result?;
    Ok(())
}

/// Verify every configured helper is present, disqualifying with the
/// providing package named when one is missing.
fn check_helpers(config: &MigrateConfig, state: &MigrationState) {
    for (helper, package) in &config.helpers {
        if !crate::util::process::helper_available(helper) {
            state.disqualify(format!(
                "required helper '{}' not found (provided by package '{}')",
                helper, package
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imglift_shared::constants::geometry::{GIB, SECTOR_SIZE};
    use imglift_test_utils::images::{write_qcow2, write_vmdk, Qcow2Spec, VmdkSpec};

    #[test]
    fn unsupported_subtype_disqualifies_with_exactly_one_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        let capacity = 50 * GIB / SECTOR_SIZE;
        write_vmdk(&path, &VmdkSpec::new(capacity, Some("vmfs"))).unwrap();

        let state = MigrationState::new();
        let info = preflight(&path, &state, false).unwrap().unwrap();
        assert!(!info.support.supported);
        assert!(!state.is_eligible());
        let reasons = state.reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("vmfs"));
    }

    #[test]
    fn oversized_image_reason_names_limit_and_computed_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.qcow2");
        write_qcow2(&path, &Qcow2Spec::new(600 * GIB)).unwrap();

        let state = MigrationState::new();
        preflight(&path, &state, false).unwrap().unwrap();
        assert!(!state.is_eligible());
        let reasons = state.reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("300 GiB"));
        assert!(reasons[0].contains("600.0 GiB"));
    }

    #[test]
    fn unrecognized_magic_disqualifies_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.raw");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let state = MigrationState::new();
        let info = preflight(&path, &state, false).unwrap();
        assert!(info.is_none());
        assert!(!state.is_eligible());
    }

    #[test]
    fn fragile_subtype_needs_confirmation_unless_assumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.vmdk");
        write_vmdk(&path, &VmdkSpec::new(2048, Some("streamOptimized"))).unwrap();

        let state = MigrationState::new();
        preflight(&path, &state, false).unwrap().unwrap();
        assert!(!state.is_eligible());
        assert!(state.reasons()[0].contains("--assume-yes"));

        let state = MigrationState::new();
        preflight(&path, &state, true).unwrap().unwrap();
        assert!(state.is_eligible());
    }

    #[test]
    fn truncated_image_disqualifies_with_truncation_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.vmdk");
        imglift_test_utils::images::write_truncated_file(&path, b"KDMV", 100).unwrap();

        let state = MigrationState::new();
        let info = preflight(&path, &state, false).unwrap();
        assert!(info.is_none());
        assert!(state.reasons()[0].contains("truncated"));
    }

    #[test]
    fn missing_helpers_disqualify_and_name_the_package() {
        let mut config = MigrateConfig::default();
        config.helpers.insert(
            "imglift-no-such-helper".to_string(),
            "imaginary-package".to_string(),
        );
        let state = MigrationState::new();
        check_helpers(&config, &state);
        assert!(!state.is_eligible());
        assert!(state
            .reasons()
            .iter()
            .any(|r| r.contains("imaginary-package")));
    }
}
