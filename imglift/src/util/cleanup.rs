//! Guaranteed-cleanup-on-exit primitive.
//!
//! The pipeline owns several paired operations that must balance on every
//! exit path: bind/unbind, mount/unmount, chroot enter/leave, and the
//! host volume-group rename/restore. All of them use this one scoped
//! guard instead of scattering cleanup across call sites.

/// Runs a closure exactly once when the scope exits, unless disarmed.
pub struct Cleanup<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> Cleanup<F> {
    /// Arm a cleanup action for the current scope.
    pub fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }

    /// Cancel the cleanup; the action will never run.
    ///
    /// Used after an explicit, error-checked teardown succeeded and the
    /// drop-time fallback is no longer wanted.
    pub fn disarm(mut self) {
        self.action = None;
    }

    /// Run the cleanup now instead of at scope exit.
    pub fn run_now(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl<F: FnOnce()> Drop for Cleanup<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

/// Arm a cleanup action for the current scope.
pub fn defer<F: FnOnce()>(action: F) -> Cleanup<F> {
    Cleanup::new(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn runs_on_scope_exit() {
        let ran = Cell::new(false);
        {
            let _guard = defer(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn disarm_cancels() {
        let ran = Cell::new(false);
        {
            let guard = defer(|| ran.set(true));
            guard.disarm();
        }
        assert!(!ran.get());
    }

    #[test]
    fn run_now_runs_exactly_once() {
        let count = Cell::new(0u32);
        let guard = defer(|| count.set(count.get() + 1));
        guard.run_now();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn runs_during_unwind() {
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        let result = std::panic::catch_unwind(move || {
            let _guard = defer(move || ran2.store(true, std::sync::atomic::Ordering::SeqCst));
            panic!("boom");
        });
        assert!(result.is_err());
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
