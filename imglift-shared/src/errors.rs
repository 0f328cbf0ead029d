//! Error taxonomy for the migration pipeline.
//!
//! Four families of failure flow through the core:
//! - format errors: unrecognized, truncated, or unsupported images. These
//!   usually disqualify the run but let preflight finish so the operator
//!   sees every finding at once.
//! - resource errors: bind/mount/unmount and helper-process failures.
//!   Always fatal to the current run, always after symmetric cleanup.
//! - guest errors: failures while modifying the mounted guest. Fatal only
//!   when the failed task is essential to boot or network correctness.
//! - transient errors: the "device or resource busy" class, retried a
//!   bounded number of times before being reclassified as resource errors.

use thiserror::Error;

/// Result alias used across all imglift crates.
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Unified error type for the migration core.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// No registered container format matches the file's leading bytes.
    #[error("unrecognized image format (magic bytes {magic})")]
    FormatUnrecognized {
        /// Hex rendering of the leading bytes that failed to match.
        magic: String,
    },

    /// The file is shorter than the format's fixed header layout.
    #[error("truncated or corrupt header: {0}")]
    TruncatedHeader(String),

    /// Header decoded but is structurally unusable (bad field values,
    /// missing descriptor, uncomputable logical size).
    #[error("format error: {0}")]
    Format(String),

    /// Kernel-resource failure: bind, mount, unmount, partition probe,
    /// volume-group manipulation.
    #[error("resource error: {0}")]
    Resource(String),

    /// The bounded device slot pool has no free slot. Distinct from
    /// `Resource` so callers can tell "try later" from "broken".
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Transient busy-class failure. Only ever surfaced after the bounded
    /// retry budget is spent.
    #[error("transient error persisted after retries: {0}")]
    Transient(String),

    /// Guest-modification failure inside or against the mounted root.
    #[error("guest modification error: {0}")]
    Guest(String),

    /// Migration configuration could not be loaded or lacks a required key.
    #[error("config error: {0}")]
    Config(String),

    /// An external helper process exited non-zero. Carries the helper name
    /// and its captured stderr so the operator sees the real cause.
    #[error("helper '{helper}' failed with status {status}: {stderr}")]
    Helper {
        helper: String,
        status: i32,
        stderr: String,
    },

    /// Plain I/O error from the host filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// Whether this error belongs to the retryable busy class.
    ///
    /// Matches the kernel's wording for EBUSY/EAGAIN as surfaced through
    /// helper stderr, since the helpers' exit codes do not distinguish
    /// busy from broken.
    pub fn is_busy(&self) -> bool {
        let text = match self {
            MigrateError::Helper { stderr, .. } => stderr.as_str(),
            MigrateError::Resource(msg) => msg.as_str(),
            // EBUSY (16) and EAGAIN (11)
            MigrateError::Io(e) => return matches!(e.raw_os_error(), Some(16) | Some(11)),
            _ => return false,
        };
        let lowered = text.to_ascii_lowercase();
        lowered.contains("device or resource busy")
            || lowered.contains("resource temporarily unavailable")
    }

    /// Wrap this error with the pipeline stage it crossed, preserving the
    /// variant family so taxonomy-based handling still works.
    pub fn in_stage(self, stage: &str) -> MigrateError {
        match self {
            MigrateError::Resource(msg) => {
                MigrateError::Resource(format!("{stage}: {msg}"))
            }
            MigrateError::Guest(msg) => MigrateError::Guest(format!("{stage}: {msg}")),
            MigrateError::Format(msg) => MigrateError::Format(format!("{stage}: {msg}")),
            MigrateError::Transient(msg) => {
                MigrateError::Transient(format!("{stage}: {msg}"))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_detection_matches_helper_stderr() {
        let err = MigrateError::Helper {
            helper: "qemu-nbd".into(),
            status: 1,
            stderr: "Failed to open /dev/nbd0: Device or resource busy".into(),
        };
        assert!(err.is_busy());
    }

    #[test]
    fn busy_detection_rejects_other_failures() {
        let err = MigrateError::Helper {
            helper: "qemu-nbd".into(),
            status: 1,
            stderr: "No such file or directory".into(),
        };
        assert!(!err.is_busy());

        let err = MigrateError::Format("bad magic".into());
        assert!(!err.is_busy());
    }

    #[test]
    fn stage_wrapping_preserves_family() {
        let err = MigrateError::Resource("mount failed".into()).in_stage("mount");
        match err {
            MigrateError::Resource(msg) => assert!(msg.starts_with("mount: ")),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
