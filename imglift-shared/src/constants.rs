//! Constants shared between the migration core and the CLI.
//!
//! These values are part of the operational contract: changing the pool
//! size or the essential-directory set changes what images are accepted.

/// Disk geometry constants.
pub mod geometry {
    /// Bytes per logical sector for sector-addressed formats.
    pub const SECTOR_SIZE: u64 = 512;

    /// One gibibyte (2^30 bytes), the unit used for operator-facing sizes.
    pub const GIB: u64 = 1 << 30;
}

/// Block-device binder constants.
pub mod binder {
    /// Number of NBD slots the binder may use on one host. Bounds how many
    /// concurrent migrations a single machine can run.
    pub const NBD_POOL_SIZE: usize = 8;

    /// Retry budget for the "device or resource busy" class.
    pub const BUSY_RETRY_ATTEMPTS: usize = 3;

    /// Delay between busy retries, in milliseconds.
    pub const BUSY_RETRY_DELAY_MS: u64 = 1000;

    /// Settle time after connecting a device, for partition nodes to appear.
    pub const PARTITION_SETTLE_MS: u64 = 500;
}

/// Guest filesystem contract.
pub mod guest {
    /// Top-level guest directories that must all resolve to a mounted
    /// partition before any write is attempted. Guest-native tools do not
    /// function inside the isolated root if any of these is missing.
    pub const ESSENTIAL_DIRS: &[&str] = &[
        "/bin", "/boot", "/etc", "/lib", "/opt", "/sbin", "/usr", "/var",
    ];

    /// Release-identifier file used to select the OS task family. Read
    /// from the mounted tree before entering the isolated root.
    pub const OS_RELEASE: &str = "etc/os-release";
}
