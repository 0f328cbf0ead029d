//! Long-operation progress heartbeat.
//!
//! One auxiliary thread that periodically logs that a long-running
//! external step is still in flight. It holds no shared state beyond the
//! stop flag and is always joined, not merely signaled, before its scope
//! exits, so the terminal is clean even on error paths.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Heartbeat for one labeled long-running step.
pub struct ProgressTicker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    label: String,
}

impl ProgressTicker {
    /// Spawn the heartbeat thread, emitting every `interval`.
    pub fn start(label: &str, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_label = label.to_string();
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let mut last_tick = Instant::now();
            while !thread_stop.load(Ordering::Relaxed) {
                // Short sleeps keep join latency low without busy-waiting.
                std::thread::sleep(Duration::from_millis(100));
                if last_tick.elapsed() >= interval {
                    last_tick = Instant::now();
                    tracing::info!(
                        step = %thread_label,
                        elapsed_secs = started.elapsed().as_secs(),
                        "still running"
                    );
                }
            }
        });
        Self {
            stop,
            handle: Some(handle),
            label: label.to_string(),
        }
    }

    /// Signal and join the heartbeat thread.
    pub fn stop(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!(step = %self.label, "progress thread panicked");
            }
        }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        // Joining in drop guarantees the thread never outlives its scope.
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_joins_the_thread() {
        let ticker = ProgressTicker::start("test-step", Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(50));
        ticker.stop();
    }

    #[test]
    fn drop_also_joins() {
        let ticker = ProgressTicker::start("test-step", Duration::from_secs(60));
        drop(ticker);
    }
}
