//! Isolated-root task execution.
//!
//! After the guest tree is mounted, the pipeline enters it as the process
//! root and runs the task set for the guest's OS family. Task sets are
//! explicit static registries: each family exposes an ordered list of
//! named task functions, so execution order is a compile-time-visible
//! contract. Entry and exit are balanced for every task outcome.

pub mod debian;
pub mod oracle;
pub mod template;

use std::cell::Cell;
use std::fmt;
use std::path::{Path, PathBuf};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, chroot, fchdir};

use imglift_shared::constants::guest::OS_RELEASE;
use imglift_shared::errors::{MigrateError, MigrateResult};

use crate::config::MigrateConfig;
use crate::state::MigrationState;

/// Guest OS family, selecting the task set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    /// Oracle Linux and other RPM/yum relatives.
    OracleLinux,
    /// Debian and Ubuntu.
    Debian,
    /// Unrecognized guests: template (no-op) task set.
    Template,
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::OracleLinux => write!(f, "oracle-linux"),
            OsFamily::Debian => write!(f, "debian"),
            OsFamily::Template => write!(f, "template"),
        }
    }
}

/// Identifiers that map onto the Oracle Linux family.
const ORACLE_IDS: &[&str] = &["ol", "oracle", "rhel", "centos", "almalinux", "rocky", "fedora"];
/// Identifiers that map onto the Debian family.
const DEBIAN_IDS: &[&str] = &["debian", "ubuntu"];

/// Select the OS family from the mounted tree's release-identifier file.
///
/// Read before entering the isolated root. `ID` wins over `ID_LIKE`; an
/// unreadable or unrecognized file selects the no-op template family.
pub fn detect_family(mounted_root: &Path) -> OsFamily {
    let path = mounted_root.join(OS_RELEASE);
    let Ok(text) = std::fs::read_to_string(&path) else {
        tracing::warn!(path = %path.display(), "no release identifier, using template family");
        return OsFamily::Template;
    };
    let family = family_from_os_release(&text);
    tracing::info!(family = %family, "guest OS family selected");
    family
}

fn family_from_os_release(text: &str) -> OsFamily {
    let mut id = None;
    let mut id_like = Vec::new();
    for line in text.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            id = Some(value.trim().trim_matches('"').to_ascii_lowercase());
        } else if let Some(value) = line.strip_prefix("ID_LIKE=") {
            id_like = value
                .trim()
                .trim_matches('"')
                .split_whitespace()
                .map(str::to_ascii_lowercase)
                .collect();
        }
    }

    let matches_family = |candidate: &str| -> Option<OsFamily> {
        if ORACLE_IDS.contains(&candidate) {
            Some(OsFamily::OracleLinux)
        } else if DEBIAN_IDS.contains(&candidate) {
            Some(OsFamily::Debian)
        } else {
            None
        }
    };

    if let Some(family) = id.as_deref().and_then(matches_family) {
        return family;
    }
    for like in &id_like {
        if let Some(family) = matches_family(like) {
            return family;
        }
    }
    OsFamily::Template
}

/// Context handed to every task. Paths inside tasks are guest-absolute;
/// the process root is the mounted tree while they run.
pub struct TaskContext<'a> {
    pub config: &'a MigrateConfig,
    pub family: OsFamily,
    /// Set by any task that changed the guest's installed packages; the
    /// initramfs task only rebuilds when something actually changed.
    pub packages_changed: Cell<bool>,
}

/// One unit of idempotent guest modification.
pub struct OsTask {
    /// Ascending execution-order key.
    pub order: u32,
    pub name: &'static str,
    /// Essential tasks disqualify the image when they fail; the rest
    /// only log and record.
    pub essential: bool,
    pub run: fn(&TaskContext) -> MigrateResult<()>,
}

/// Per-task result collected by the executor.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub name: &'static str,
    pub ok: bool,
    pub detail: Option<String>,
}

/// The static, ordered task registry for a family.
pub fn family_tasks(family: OsFamily) -> &'static [OsTask] {
    match family {
        OsFamily::OracleLinux => oracle::TASKS,
        OsFamily::Debian => debian::TASKS,
        OsFamily::Template => template::TASKS,
    }
}

/// The isolated-root scope: `NotEntered -> Entered -> Left`.
///
/// Entering records the host root and working directory, then switches
/// the process root into the mounted tree. Leaving restores both in
/// reverse order, exactly once, with a drop fallback so a panicking task
/// cannot strand the process inside the guest.
pub struct ChrootScope {
    host_root: std::os::fd::OwnedFd,
    host_cwd: PathBuf,
    left: bool,
}

impl ChrootScope {
    /// Enter the mounted tree as the process root.
    pub fn enter(root: &Path) -> MigrateResult<Self> {
        let host_root = open("/", OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())
            .map_err(|e| MigrateError::Guest(format!("cannot open host root: {e}")))?;
        let host_cwd = std::env::current_dir()?;

        chroot(root).map_err(|e| {
            MigrateError::Guest(format!("chroot into {} failed: {}", root.display(), e))
        })?;
        if let Err(e) = chdir("/") {
            // Half-entered: the root changed but the cwd did not. Restore
            // immediately so the caller never sees a torn state.
            let _ = fchdir(&host_root);
            let _ = chroot(".");
            return Err(MigrateError::Guest(format!(
                "chdir after chroot failed: {e}"
            )));
        }
        tracing::info!(root = %root.display(), "entered isolated root");
        Ok(Self {
            host_root,
            host_cwd,
            left: false,
        })
    }

    /// Leave the isolated root, restoring the host root and cwd.
    pub fn leave(mut self) -> MigrateResult<()> {
        self.leave_inner()
    }

    fn leave_inner(&mut self) -> MigrateResult<()> {
        if self.left {
            return Ok(());
        }
        self.left = true;
        fchdir(&self.host_root)
            .map_err(|e| MigrateError::Guest(format!("fchdir back to host root failed: {e}")))?;
        chroot(".")
            .map_err(|e| MigrateError::Guest(format!("chroot back to host root failed: {e}")))?;
        chdir(&self.host_cwd).map_err(|e| {
            MigrateError::Guest(format!(
                "cannot restore working directory {}: {}",
                self.host_cwd.display(),
                e
            ))
        })?;
        tracing::info!("left isolated root");
        Ok(())
    }
}

impl Drop for ChrootScope {
    fn drop(&mut self) {
        if !self.left {
            tracing::warn!("isolated root dropped without explicit leave, restoring");
            if let Err(err) = self.leave_inner() {
                tracing::error!(error = %err, "failed to restore process root");
            }
        }
    }
}

/// Run the family's task set inside the mounted tree.
///
/// Each task is wrapped individually: a failing task never prevents later
/// tasks from running. Essential failures disqualify the image through
/// `state`; all failures are recorded in the outcomes.
pub fn run_tasks(
    mounted_root: &Path,
    family: OsFamily,
    config: &MigrateConfig,
    state: &MigrationState,
) -> MigrateResult<Vec<TaskOutcome>> {
    let tasks = family_tasks(family);
    if tasks.is_empty() {
        tracing::info!(family = %family, "task set is empty, nothing to run");
        return Ok(Vec::new());
    }

    let context = TaskContext {
        config,
        family,
        packages_changed: Cell::new(false),
    };

    let scope = ChrootScope::enter(mounted_root).map_err(|e| e.in_stage("task execution"))?;

    let mut ordered: Vec<&OsTask> = tasks.iter().collect();
    ordered.sort_by_key(|t| t.order);

    let mut outcomes = Vec::with_capacity(ordered.len());
    for task in ordered {
        tracing::info!(task = task.name, order = task.order, "running task");
        match (task.run)(&context) {
            Ok(()) => outcomes.push(TaskOutcome {
                name: task.name,
                ok: true,
                detail: None,
            }),
            Err(err) => {
                tracing::warn!(task = task.name, error = %err, "task failed");
                if task.essential {
                    state.disqualify(format!(
                        "essential guest task '{}' failed: {}",
                        task.name, err
                    ));
                }
                outcomes.push(TaskOutcome {
                    name: task.name,
                    ok: false,
                    detail: Some(err.to_string()),
                });
            }
        }
    }

    scope.leave().map_err(|e| e.in_stage("task execution"))?;
    Ok(outcomes)
}

/// Write an executable first-boot script into the guest (guest-absolute
/// path; the caller runs inside the isolated root).
pub(crate) fn install_script(path: &str, body: &str) -> MigrateResult<()> {
    use std::os::unix::fs::PermissionsExt;

    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| MigrateError::Guest(format!("cannot create {}: {}", parent.display(), e)))?;
    }
    std::fs::write(path, body)
        .map_err(|e| MigrateError::Guest(format!("cannot write {}: {}", path.display(), e)))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| MigrateError::Guest(format!("cannot chmod {}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_selection_prefers_id_over_id_like() {
        let text = "NAME=\"Oracle Linux Server\"\nID=\"ol\"\nID_LIKE=\"fedora\"\n";
        assert_eq!(family_from_os_release(text), OsFamily::OracleLinux);

        let text = "ID=ubuntu\nID_LIKE=debian\n";
        assert_eq!(family_from_os_release(text), OsFamily::Debian);
    }

    #[test]
    fn family_selection_falls_back_to_id_like() {
        let text = "ID=neon\nID_LIKE=\"ubuntu debian\"\n";
        assert_eq!(family_from_os_release(text), OsFamily::Debian);
    }

    #[test]
    fn unknown_guests_get_the_template_family() {
        assert_eq!(family_from_os_release("ID=plan9\n"), OsFamily::Template);
        assert_eq!(family_from_os_release(""), OsFamily::Template);
    }

    #[test]
    fn detect_family_without_release_file_is_template() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_family(dir.path()), OsFamily::Template);
    }

    #[test]
    fn registries_are_strictly_ordered_and_unique() {
        for family in [OsFamily::OracleLinux, OsFamily::Debian, OsFamily::Template] {
            let tasks = family_tasks(family);
            let mut orders: Vec<u32> = tasks.iter().map(|t| t.order).collect();
            let before = orders.clone();
            orders.sort();
            orders.dedup();
            assert_eq!(before.len(), orders.len(), "duplicate order in {family}");
        }
    }

    #[test]
    fn oracle_and_debian_registries_cover_the_same_steps() {
        let names = |family| {
            let mut v: Vec<&str> = family_tasks(family).iter().map(|t| t.name).collect();
            v.sort();
            v
        };
        assert_eq!(names(OsFamily::OracleLinux), names(OsFamily::Debian));
        assert!(family_tasks(OsFamily::Template).is_empty());
    }
}
