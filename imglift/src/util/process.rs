//! External helper-process invocation.
//!
//! Every OS-level operation in the pipeline (device binding, partition
//! probing, volume-group manipulation, mounting, package installation)
//! goes through an external helper binary invoked synchronously. The exit
//! code is the sole determinant of success; stdout and stderr are captured
//! and attached to any resulting error so the operator sees the helper's
//! own explanation.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Command;

use imglift_shared::errors::{MigrateError, MigrateResult};

/// Captured output of a successful helper invocation.
#[derive(Debug)]
pub struct HelperOutput {
    pub stdout: String,
    pub stderr: String,
}

impl HelperOutput {
    /// Trimmed stdout, the common case for single-value helpers.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Run a helper with a fixed argument vector and capture its output.
///
/// A non-zero exit surfaces as `MigrateError::Helper` carrying the helper
/// name, status, and stderr text. Failure to spawn at all (binary missing,
/// permission) is a resource error.
pub fn run_helper<I, S>(program: &str, args: I) -> MigrateResult<HelperOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args
        .into_iter()
        .map(|a| a.as_ref().to_os_string())
        .collect();
    tracing::debug!(helper = program, ?args, "running helper");

    let output = Command::new(program).args(&args).output().map_err(|e| {
        MigrateError::Resource(format!("failed to spawn helper '{}': {}", program, e))
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        let status = output.status.code().unwrap_or(-1);
        tracing::debug!(helper = program, status, stderr = %stderr.trim(), "helper failed");
        return Err(MigrateError::Helper {
            helper: program.to_string(),
            status,
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(HelperOutput { stdout, stderr })
}

/// Check whether a helper binary is reachable through `PATH`.
///
/// Used during preflight to report every missing helper at once instead of
/// failing midway through a run.
pub fn helper_available(program: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| is_executable(&dir.join(program)))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_helper_captures_stdout() {
        let out = run_helper("echo", ["hello"]).expect("echo should succeed");
        assert_eq!(out.stdout_trimmed(), "hello");
    }

    #[test]
    fn run_helper_reports_nonzero_exit_with_stderr() {
        let err = run_helper("sh", ["-c", "echo boom >&2; exit 3"]).unwrap_err();
        match err {
            MigrateError::Helper {
                helper,
                status,
                stderr,
            } => {
                assert_eq!(helper, "sh");
                assert_eq!(status, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn run_helper_missing_binary_is_resource_error() {
        let err = run_helper("imglift-no-such-helper", [""; 0]).unwrap_err();
        assert!(matches!(err, MigrateError::Resource(_)));
    }

    #[test]
    fn helper_available_finds_sh() {
        assert!(helper_available("sh"));
        assert!(!helper_available("imglift-no-such-helper"));
    }
}
