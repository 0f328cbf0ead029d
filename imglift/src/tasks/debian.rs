//! Task set for the Debian family (apt/dpkg based guests).
//!
//! Mirrors the Oracle Linux set step for step with the family's own
//! tooling. apt runs through `env` to force the noninteractive frontend,
//! since there is no terminal inside the isolated root.

use imglift_shared::errors::{MigrateError, MigrateResult};

use super::{install_script, OsTask, TaskContext};
use crate::util::process::run_helper;

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

fn apt_get(args: &[&str]) -> MigrateResult<()> {
    let mut full = vec!["DEBIAN_FRONTEND=noninteractive", "apt-get", "-y"];
    full.extend_from_slice(args);
    run_helper("env", full).map(|_| ())
}

fn reinstall_configuration_agent(ctx: &TaskContext) -> MigrateResult<()> {
    if let Err(err) = apt_get(&["remove", "--purge", "cloud-init"]) {
        tracing::debug!(error = %err, "cloud-init removal failed (may not be installed)");
    }
    apt_get(&["install", "cloud-init"])
        .map_err(|e| MigrateError::Guest(format!("cloud-init install failed: {e}")))?;
    ctx.packages_changed.set(true);
    Ok(())
}

fn install_extra_packages(ctx: &TaskContext) -> MigrateResult<()> {
    let mut failed = Vec::new();
    for package in ctx.config.packages_for(ctx.family) {
        match apt_get(&["install", package.as_str()]) {
            Ok(()) => {
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

fn inject_region_script(ctx: &TaskContext) -> MigrateResult<()> {
    let body = ctx.config.script("region-detect")?;
    install_script(REGION_SCRIPT_PATH, body)
}

fn regenerate_initramfs(ctx: &TaskContext) -> MigrateResult<()> {
    if !ctx.packages_changed.get() {
        tracing::info!("no package changes, skipping initramfs rebuild");
        return Ok(());
    }
    run_helper("update-initramfs", ["-u", "-k", "all"])
        .map(|_| ())
        .map_err(|e| MigrateError::Guest(format!("initramfs rebuild failed: {e}")))
}

fn install_cloud_agent(ctx: &TaskContext) -> MigrateResult<()> {
    let Some(stage) = ctx.config.cloud_agent_stage.as_deref() else {
        tracing::debug!("no cloud agent staged, skipping");
        return Ok(());
    };
    if !std::path::Path::new(stage).exists() {
        tracing::info!(stage, "staged cloud agent not present, skipping");
        return Ok(());
    }
    run_helper("dpkg", ["-i", stage])
        .map(|_| ())
        .map_err(|e| MigrateError::Guest(format!("cloud agent install failed: {e}")))
}
