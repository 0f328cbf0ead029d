//! Task set for the Oracle Linux family (yum/rpm based guests).
//!
//! Every task edits the mounted filesystem directly; no running service
//! manager is assumed. The package manager is invoked for file
//! installation only, which works against a non-executing root.

use imglift_shared::errors::{MigrateError, MigrateResult};

use super::{install_script, OsTask, TaskContext};
use crate::util::process::run_helper;

/// First-boot region-detection script location (cloud-init per-boot).
const REGION_SCRIPT_PATH: &str = "/var/lib/cloud/scripts/per-boot/imglift-region.sh";

pub static TASKS: &[OsTask] = &[
    OsTask {
        order: 10,
        name: "reinstall-configuration-agent",
        essential: true,
        run: reinstall_configuration_agent,
    },
    OsTask {
        order: 20,
        name: "install-extra-packages",
        essential: false,
        run: install_extra_packages,
    },
    OsTask {
        order: 30,
        name: "inject-region-script",
        essential: false,
        run: inject_region_script,
    },
    OsTask {
        order: 40,
        name: "regenerate-initramfs",
        essential: true,
        run: regenerate_initramfs,
    },
    OsTask {
        order: 50,
        name: "install-cloud-agent",
        essential: false,
        run: install_cloud_agent,
    },
];

/// Remove and reinstall the init-time configuration agent so its first
/// boot in the cloud starts from a clean instance state.
fn reinstall_configuration_agent(ctx: &TaskContext) -> MigrateResult<()> {
    // Removal may fail when the agent was never installed; that is fine,
    // the install below is what matters.
    if let Err(err) = run_helper("yum", ["-y", "remove", "cloud-init"]) {
        tracing::debug!(error = %err, "cloud-init removal failed (may not be installed)");
    }
    run_helper("yum", ["-y", "install", "cloud-init"])
        .map_err(|e| MigrateError::Guest(format!("cloud-init install failed: {e}")))?;
    ctx.packages_changed.set(true);
    Ok(())
}

/// Install the configured extra packages. Individual failures accumulate
/// instead of aborting the list.
fn install_extra_packages(ctx: &TaskContext) -> MigrateResult<()> {
    let mut failed = Vec::new();
    for package in ctx.config.packages_for(ctx.family) {
        match run_helper("yum", ["-y", "install", package.as_str()]) {
            Ok(_) => {
                ctx.packages_changed.set(true);
            }
            Err(err) => {
                tracing::warn!(package = %package, error = %err, "package install failed");
                failed.push(package.clone());
            }
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(MigrateError::Guest(format!(
            "packages failed to install: {}",
            failed.join(", ")
        )))
    }
}

/// Drop the first-boot region-detection script into the per-boot hook
/// directory.
fn inject_region_script(ctx: &TaskContext) -> MigrateResult<()> {
    let body = ctx.config.script("region-detect")?;
    install_script(REGION_SCRIPT_PATH, body)
}

/// Rebuild every initramfs so freshly installed modules are available at
/// boot. Skipped when no task changed the installed package set.
fn regenerate_initramfs(ctx: &TaskContext) -> MigrateResult<()> {
    if !ctx.packages_changed.get() {
        tracing::info!("no package changes, skipping initramfs rebuild");
        return Ok(());
    }
    run_helper("dracut", ["--force", "--regenerate-all"])
        .map(|_| ())
        .map_err(|e| MigrateError::Guest(format!("initramfs rebuild failed: {e}")))
}

/// Install the pre-staged cloud agent package, when one was staged.
fn install_cloud_agent(ctx: &TaskContext) -> MigrateResult<()> {
    let Some(stage) = ctx.config.cloud_agent_stage.as_deref() else {
        tracing::debug!("no cloud agent staged, skipping");
        return Ok(());
    };
    if !std::path::Path::new(stage).exists() {
        tracing::info!(stage, "staged cloud agent not present, skipping");
        return Ok(());
    }
    run_helper("yum", ["-y", "localinstall", stage])
        .map(|_| ())
        .map_err(|e| MigrateError::Guest(format!("cloud agent install failed: {e}")))
}
