//! Migration decision state.
//!
//! One value created at run start and passed through the pipeline. Any
//! stage may disqualify the image and append a reason; nothing may flip
//! eligibility back. Read once at the very end to gate the upload
//! hand-off, at which point the accumulated reasons are the complete
//! operator-facing explanation.

use parking_lot::Mutex;

/// Process-wide eligibility flag plus accumulated reasons.
///
/// Interior mutability so every stage can take `&MigrationState`. The
/// mutex is defensive: the reference pipeline only mutates from the main
/// thread, but the progress thread may observe the state concurrently.
#[derive(Debug, Default)]
pub struct MigrationState {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    eligible: bool,
    reasons: Vec<String>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            eligible: true,
            reasons: Vec::new(),
        }
    }
}

impl MigrationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the image ineligible for upload and record why.
    ///
    /// Append-only: repeated calls accumulate reasons in order, and
    /// eligibility never returns to true.
    pub fn disqualify(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%reason, "image disqualified");
        let mut inner = self.inner.lock();
        inner.eligible = false;
        inner.reasons.push(reason);
    }

    /// Whether the image may still proceed to upload.
    pub fn is_eligible(&self) -> bool {
        self.inner.lock().eligible
    }

    /// The accumulated reasons, in the order they were recorded.
    pub fn reasons(&self) -> Vec<String> {
        self.inner.lock().reasons.clone()
    }
}
