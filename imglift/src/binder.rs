//! Network-block-device binding.
//!
//! Exposes the raw image file as a kernel block device through `qemu-nbd`
//! and tears the binding down symmetrically. Slots come from a small
//! bounded pool: the pool size caps how many migrations one host can run
//! at once, and exhaustion is a distinct error rather than a wait.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use imglift_shared::constants::binder as consts;
use imglift_shared::errors::{MigrateError, MigrateResult};

use crate::util::process::run_helper;
use crate::util::retry::RetryPolicy;

/// Bounded pool of NBD slot indices.
///
/// Tracks only in-process ownership; the binder cross-checks the kernel's
/// view (`/sys/block/nbdN/size`) before connecting, since another process
/// may hold a device this pool considers free.
#[derive(Debug, Clone)]
pub struct SlotPool {
    taken: Arc<Mutex<Vec<bool>>>,
}

impl SlotPool {
    pub fn new(size: usize) -> Self {
        Self {
            taken: Arc::new(Mutex::new(vec![false; size])),
        }
    }

    /// Claim the lowest free slot, or fail with `ResourceExhausted`.
    pub fn acquire(&self) -> MigrateResult<Slot> {
        let mut taken = self.taken.lock();
        match taken.iter().position(|t| !t) {
            Some(index) => {
                taken[index] = true;
                Ok(Slot {
                    index,
                    pool: self.taken.clone(),
                    held: true,
                })
            }
            None => Err(MigrateError::ResourceExhausted(format!(
                "all {} device slots are in use",
                taken.len()
            ))),
        }
    }

    /// Number of currently free slots.
    pub fn free(&self) -> usize {
        self.taken.lock().iter().filter(|t| !**t).count()
    }
}

/// One claimed slot. Released exactly once, at the latest on drop.
#[derive(Debug)]
pub struct Slot {
    index: usize,
    pool: Arc<Mutex<Vec<bool>>>,
    held: bool,
}

impl Slot {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Return the slot to the pool. Idempotent.
    pub fn release(&mut self) {
        if self.held {
            self.pool.lock()[self.index] = false;
            self.held = false;
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Binds image files to NBD devices.
pub struct NbdBinder {
    pool: SlotPool,
    retry: RetryPolicy,
}

impl Default for NbdBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl NbdBinder {
    pub fn new() -> Self {
        Self {
            pool: SlotPool::new(consts::NBD_POOL_SIZE),
            retry: RetryPolicy::busy(),
        }
    }

    /// Pool accessor for diagnostics and tests.
    pub fn pool(&self) -> &SlotPool {
        &self.pool
    }

    /// Bind the image to a free NBD device.
    ///
    /// Loads the nbd module (idempotent), claims a slot whose device the
    /// kernel also reports free, connects read-write, and waits for the
    /// partition nodes to appear. The returned guard must be unbound
    /// exactly once; drop performs a best-effort teardown if the caller
    /// failed somewhere downstream.
    pub fn bind(&self, image: &Path) -> MigrateResult<BoundDevice> {
        run_helper("modprobe", ["nbd", "max_part=16"])
            .map_err(|e| e.in_stage("bind"))?;

        let mut slot = self.claim_free_device()?;
        let device = nbd_device_path(slot.index());

        let connect = self.retry.run("qemu-nbd connect", || {
            run_helper(
                "qemu-nbd",
                [
                    OsStr::new("--connect"),
                    device.as_os_str(),
                    image.as_os_str(),
                ],
            )
            .map(|_| ())
        });
        if let Err(err) = connect {
            slot.release();
            return Err(err.in_stage("bind"));
        }

        // Ask the kernel to rescan; optional, the connect usually triggers
        // a scan on its own.
        if let Err(err) = run_helper("partprobe", [device.as_os_str()]) {
            tracing::debug!(error = %err, "partprobe failed (non-fatal)");
        }
        std::thread::sleep(std::time::Duration::from_millis(
            consts::PARTITION_SETTLE_MS,
        ));

        tracing::info!(
            image = %image.display(),
            device = %device.display(),
            "image bound to block device"
        );
        Ok(BoundDevice {
            device,
            slot,
            retry: self.retry,
            connected: true,
        })
    }

    /// Find a slot that is free both in-process and kernel-side.
    ///
    /// Slots another process holds kernel-side are parked until the scan
    /// finishes so the loop cannot re-acquire them, then returned to the
    /// in-process pool.
    fn claim_free_device(&self) -> MigrateResult<Slot> {
        let mut parked = Vec::new();
        let claimed = loop {
            match self.pool.acquire() {
                Ok(slot) => {
                    let device = nbd_device_path(slot.index());
                    if !device.exists() {
                        tracing::debug!(
                            device = %device.display(),
                            "device node missing, nbd module populated fewer slots"
                        );
                        parked.push(slot);
                        continue;
                    }
                    if kernel_reports_free(slot.index()) {
                        break Ok(slot);
                    }
                    tracing::debug!(
                        device = %device.display(),
                        "slot busy kernel-side, trying the next one"
                    );
                    parked.push(slot);
                }
                Err(_) => {
                    break Err(MigrateError::ResourceExhausted(format!(
                        "no free device slot among {} (in use or busy kernel-side)",
                        consts::NBD_POOL_SIZE
                    )))
                }
            }
        };
        drop(parked);
        claimed
    }
}

/// A bound NBD device. Owned for the duration of one migration run.
#[derive(Debug)]
pub struct BoundDevice {
    device: PathBuf,
    slot: Slot,
    retry: RetryPolicy,
    connected: bool,
}

impl BoundDevice {
    /// Path of the kernel block device (`/dev/nbdN`).
    pub fn path(&self) -> &Path {
        &self.device
    }

    /// The device's base name (`nbdN`), used for sysfs lookups.
    pub fn kernel_name(&self) -> String {
        format!("nbd{}", self.slot.index())
    }

    /// Disconnect the device and release its slot.
    ///
    /// Safe to call after a partial failure and idempotent: a second call
    /// is a no-op. Errors carry the helper's stderr.
    pub fn unbind(&mut self) -> MigrateResult<()> {
        if !self.connected {
            return Ok(());
        }
        let result = self.retry.run("qemu-nbd disconnect", || {
            run_helper(
                "qemu-nbd",
                [OsStr::new("--disconnect"), self.device.as_os_str()],
            )
            .map(|_| ())
        });
        // The slot goes back to the pool even if the disconnect helper
        // failed; the kernel-side check on the next bind will skip the
        // device if it is genuinely still attached.
        self.connected = false;
        self.slot.release();
        match result {
            Ok(()) => {
                tracing::info!(device = %self.device.display(), "device unbound");
                Ok(())
            }
            Err(err) => Err(err.in_stage("unbind")),
        }
    }
}

impl Drop for BoundDevice {
    fn drop(&mut self) {
        if self.connected {
            tracing::warn!(
                device = %self.device.display(),
                "bound device dropped without explicit unbind, cleaning up"
            );
            if let Err(err) = self.unbind() {
                tracing::warn!(error = %err, "implicit unbind failed");
            }
        }
    }
}

fn nbd_device_path(index: usize) -> PathBuf {
    PathBuf::from(format!("/dev/nbd{index}"))
}

/// Whether the kernel reports the device unattached (zero size).
fn kernel_reports_free(index: usize) -> bool {
    match std::fs::read_to_string(format!("/sys/block/nbd{index}/size")) {
        Ok(content) => content.trim() == "0",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_fresh_binder_has_the_full_pool_free() {
        let binder = NbdBinder::new();
        assert_eq!(binder.pool().free(), consts::NBD_POOL_SIZE);
    }

    #[test]
    fn pool_hands_out_lowest_free_slot() {
        let pool = SlotPool::new(3);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(pool.free(), 1);
    }

    #[test]
    fn exhausted_pool_is_a_distinct_error_not_a_hang() {
        let pool = SlotPool::new(1);
        let _held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, MigrateError::ResourceExhausted(_)));
    }

    #[test]
    fn release_is_idempotent_and_drop_releases() {
        let pool = SlotPool::new(2);
        {
            let mut slot = pool.acquire().unwrap();
            slot.release();
            slot.release();
            assert_eq!(pool.free(), 2);
        }
        // Acquire-and-drop N times leaves the pool unchanged.
        for _ in 0..10 {
            let _slot = pool.acquire().unwrap();
        }
        assert_eq!(pool.free(), 2);
    }

    #[test]
    fn second_claim_on_a_full_pool_fails_from_another_thread() {
        let pool = SlotPool::new(1);
        let held = pool.acquire().unwrap();

        let pool2 = pool.clone();
        let result = std::thread::spawn(move || pool2.acquire())
            .join()
            .unwrap();
        assert!(matches!(
            result.unwrap_err(),
            MigrateError::ResourceExhausted(_)
        ));

        drop(held);
        assert_eq!(pool.free(), 1);
    }
}
