//! Container-format detection and header parsing.
//!
//! Each supported on-disk format implements [`ContainerFormat`] behind the
//! static registry: parse the fixed-layout header, describe it as an
//! ordered field list, and check the format's upload prerequisites. The
//! registry matches the file's leading bytes against each format's magic
//! with exact-prefix comparison only.

pub mod qcow2;
pub mod vmdk;

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use imglift_shared::constants::geometry::GIB;
use imglift_shared::errors::{MigrateError, MigrateResult};

/// Leading bytes sampled from a candidate image for format detection.
pub const MAGIC_PREFIX_LEN: usize = 8;

/// The on-premise disk image under migration. Immutable once opened.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub path: PathBuf,
    /// Actual byte length of the file (the physical size).
    pub size: u64,
    /// The first [`MAGIC_PREFIX_LEN`] bytes (fewer if the file is shorter).
    pub magic: Vec<u8>,
}

impl ImageFile {
    /// Open and stat the image, sampling its magic prefix.
    pub fn open(path: &Path) -> MigrateResult<Self> {
        let mut file = File::open(path).map_err(|e| {
            MigrateError::Format(format!("cannot open image {}: {}", path.display(), e))
        })?;
        let size = file
            .metadata()
            .map_err(|e| {
                MigrateError::Format(format!("cannot stat image {}: {}", path.display(), e))
            })?
            .len();
        let mut magic = vec![0u8; MAGIC_PREFIX_LEN];
        let read = file.read(&mut magic).map_err(|e| {
            MigrateError::Format(format!("cannot read image {}: {}", path.display(), e))
        })?;
        magic.truncate(read);
        Ok(Self {
            path: path.to_path_buf(),
            size,
            magic,
        })
    }
}

/// Static description of one supported container format.
#[derive(Debug)]
pub struct FormatDescriptor {
    /// Human name used in logs and reports ("VMDK", "qcow2").
    pub name: &'static str,
    /// Magic byte sequence matched exact-prefix against the file head.
    pub magic: &'static [u8],
    /// Largest logical size the cloud service accepts for this format.
    pub max_logical_size: u64,
    /// Create-subtypes accepted for upload (empty when the format has no
    /// subtype notion).
    pub accepted_subtypes: &'static [&'static str],
    /// Accepted subtypes that are known-fragile and require explicit
    /// operator confirmation before continuing.
    pub fragile_subtypes: &'static [&'static str],
}

/// One decoded header field, in on-disk declaration order.
#[derive(Debug, Clone)]
pub struct HeaderField {
    pub name: &'static str,
    pub value: HeaderValue,
}

/// Value of a decoded header field.
#[derive(Debug, Clone)]
pub enum HeaderValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Text(String),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::U8(v) => write!(f, "{v}"),
            HeaderValue::U16(v) => write!(f, "{v}"),
            HeaderValue::U32(v) => write!(f, "{v}"),
            HeaderValue::U64(v) => write!(f, "{v}"),
            HeaderValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Parsed result of a header parser.
#[derive(Debug, Clone)]
pub struct ImageHeader {
    /// The on-disk fields in declared order.
    pub fields: Vec<HeaderField>,
    /// Declared capacity converted to bytes. Always computed; a parser
    /// that cannot compute it fails instead of defaulting to zero.
    pub logical_size: u64,
    /// Byte length of the image file itself.
    pub physical_size: u64,
    /// Create-subtype, for formats that declare one.
    pub create_subtype: Option<String>,
    /// Key/value pairs from the textual descriptor window, when present.
    pub descriptor: Vec<(String, String)>,
}

impl ImageHeader {
    /// Logical size in gibibytes, for operator-facing reporting.
    pub fn logical_gib(&self) -> f64 {
        self.logical_size as f64 / GIB as f64
    }

    /// Physical size in gibibytes.
    pub fn physical_gib(&self) -> f64 {
        self.physical_size as f64 / GIB as f64
    }
}

/// Outcome of a format's prerequisite check.
///
/// Failures feed `MigrationState` at the call site rather than aborting,
/// so every preflight finding is surfaced together.
#[derive(Debug, Default)]
pub struct SupportCheck {
    /// Whether the image meets this format's upload prerequisites.
    pub supported: bool,
    /// Human-readable explanations for every failed prerequisite.
    pub failures: Vec<String>,
    /// Present when the image passes but uses a fragile variant that
    /// needs explicit operator confirmation before continuing.
    pub confirmation: Option<String>,
}

/// One supported container format: parse, describe, check prerequisites.
pub trait ContainerFormat: Send + Sync + fmt::Debug {
    /// The static descriptor this implementation registers under.
    fn descriptor(&self) -> &'static FormatDescriptor;

    /// Decode the fixed-layout header (and textual descriptor, where the
    /// format carries one). Short reads are hard "truncated" errors.
    fn parse(&self, path: &Path) -> MigrateResult<ImageHeader>;

    /// Validate format prerequisites (maximum logical size, accepted
    /// create-subtype) against a parsed header.
    fn check_prerequisites(&self, header: &ImageHeader) -> SupportCheck;
}

/// Registry of supported formats, assembled at compile time.
pub static FORMATS: &[&(dyn ContainerFormat)] = &[&vmdk::Vmdk, &qcow2::Qcow2];

/// Match the leading bytes of a file against the registry.
///
/// Exact-prefix matching only: the sampled head must start with the
/// registered magic, byte for byte.
pub fn detect_bytes(prefix: &[u8]) -> MigrateResult<&'static dyn ContainerFormat> {
    for format in FORMATS {
        if prefix.starts_with(format.descriptor().magic) {
            return Ok(*format);
        }
    }
    let shown = prefix.iter().take(MAGIC_PREFIX_LEN);
    Err(MigrateError::FormatUnrecognized {
        magic: shown.map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" "),
    })
}

/// Copy four bytes out of a header buffer at a fixed offset.
pub(crate) fn slice4(buf: &[u8], at: usize) -> [u8; 4] {
    [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]
}

/// Copy eight bytes out of a header buffer at a fixed offset.
pub(crate) fn slice8(buf: &[u8], at: usize) -> [u8; 8] {
    [
        buf[at],
        buf[at + 1],
        buf[at + 2],
        buf[at + 3],
        buf[at + 4],
        buf[at + 5],
        buf[at + 6],
        buf[at + 7],
    ]
}

/// Detect the container format of an opened image.
pub fn detect(image: &ImageFile) -> MigrateResult<&'static dyn ContainerFormat> {
    let format = detect_bytes(&image.magic)?;
    tracing::info!(
        image = %image.path.display(),
        format = format.descriptor().name,
        "detected container format"
    );
    Ok(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_matches_vmdk_magic() {
        let format = detect_bytes(b"KDMV\x01\x00\x00\x00").unwrap();
        assert_eq!(format.descriptor().name, "VMDK");
    }

    #[test]
    fn registry_matches_qcow2_magic() {
        let format = detect_bytes(b"QFI\xfb\x00\x00\x00\x03").unwrap();
        assert_eq!(format.descriptor().name, "qcow2");
    }

    #[test]
    fn registry_rejects_unknown_magic_with_hex() {
        let err = detect_bytes(b"NOTADISK").unwrap_err();
        match err {
            MigrateError::FormatUnrecognized { magic } => {
                assert!(magic.starts_with("4e 4f 54"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn matching_is_exact_prefix_not_fuzzy() {
        // One byte off the VMDK magic must not match.
        assert!(detect_bytes(b"KDMW\x01\x00\x00\x00").is_err());
        // A short head that is a prefix OF the magic must not match either.
        assert!(detect_bytes(b"KD").is_err());
    }
}
