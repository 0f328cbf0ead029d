//! qcow2 header parsing.
//!
//! The copy-on-write format opens with a 72-byte big-endian fixed header
//! (the version-3 extension area is not needed for migration decisions).
//! The declared size field is already a byte count; there is no subtype
//! notion, but encrypted images and images with a backing file cannot be
//! imported standalone.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use imglift_shared::constants::geometry::GIB;
use imglift_shared::errors::{MigrateError, MigrateResult};

use super::{
    slice4, slice8, ContainerFormat, FormatDescriptor, HeaderField, HeaderValue, ImageHeader,
    SupportCheck,
};

/// Fixed header length shared by versions 2 and 3.
const HEADER_LEN: usize = 72;

static DESCRIPTOR: FormatDescriptor = FormatDescriptor {
    name: "qcow2",
    magic: b"QFI\xfb",
    max_logical_size: 300 * GIB,
    accepted_subtypes: &[],
    fragile_subtypes: &[],
};

/// The qcow2 format implementation.
#[derive(Debug)]
pub struct Qcow2;

impl ContainerFormat for Qcow2 {
    fn descriptor(&self) -> &'static FormatDescriptor {
        &DESCRIPTOR
    }

    fn parse(&self, path: &Path) -> MigrateResult<ImageHeader> {
        let mut file = File::open(path).map_err(|e| {
            MigrateError::Format(format!("cannot open {}: {}", path.display(), e))
        })?;
        let physical_size = file
            .metadata()
            .map_err(|e| MigrateError::Format(format!("cannot stat {}: {}", path.display(), e)))?
            .len();

        let mut buf = [0u8; HEADER_LEN];
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => MigrateError::TruncatedHeader(format!(
                "{}: shorter than the {}-byte qcow2 header",
                path.display(),
                HEADER_LEN
            )),
            _ => MigrateError::Format(format!("cannot read {}: {}", path.display(), e)),
        })?;

        // qcow2 fixed header layout (big-endian):
        // 0-3:   magic "QFI\xfb"
        // 4-7:   version
        // 8-15:  backing-file offset
        // 16-19: backing-file name length
        // 20-23: cluster bits
        // 24-31: virtual size (bytes)
        // 32-35: crypt method
        // 36-39: L1 table entries
        // 40-47: L1 table offset
        // 48-55: refcount table offset
        // 56-59: refcount table clusters
        // 60-63: snapshot count
        // 64-71: snapshot table offset
        let magic = u32::from_be_bytes(slice4(&buf, 0));
        if &buf[0..4] != DESCRIPTOR.magic {
            return Err(MigrateError::Format(format!(
                "{}: qcow2 magic mismatch (0x{:08x})",
                path.display(),
                magic
            )));
        }
        let version = u32::from_be_bytes(slice4(&buf, 4));
        let backing_file_offset = u64::from_be_bytes(slice8(&buf, 8));
        let backing_file_size = u32::from_be_bytes(slice4(&buf, 16));
        let cluster_bits = u32::from_be_bytes(slice4(&buf, 20));
        let size = u64::from_be_bytes(slice8(&buf, 24));
        let crypt_method = u32::from_be_bytes(slice4(&buf, 32));
        let l1_size = u32::from_be_bytes(slice4(&buf, 36));
        let l1_table_offset = u64::from_be_bytes(slice8(&buf, 40));
        let refcount_table_offset = u64::from_be_bytes(slice8(&buf, 48));
        let refcount_table_clusters = u32::from_be_bytes(slice4(&buf, 56));
        let nb_snapshots = u32::from_be_bytes(slice4(&buf, 60));
        let snapshots_offset = u64::from_be_bytes(slice8(&buf, 64));

        if size == 0 {
            return Err(MigrateError::Format(format!(
                "{}: qcow2 header declares zero virtual size",
                path.display()
            )));
        }

        let fields = vec![
            HeaderField { name: "magic", value: HeaderValue::U32(magic) },
            HeaderField { name: "version", value: HeaderValue::U32(version) },
            HeaderField { name: "backing_file_offset", value: HeaderValue::U64(backing_file_offset) },
            HeaderField { name: "backing_file_size", value: HeaderValue::U32(backing_file_size) },
            HeaderField { name: "cluster_bits", value: HeaderValue::U32(cluster_bits) },
            HeaderField { name: "size", value: HeaderValue::U64(size) },
            HeaderField { name: "crypt_method", value: HeaderValue::U32(crypt_method) },
            HeaderField { name: "l1_size", value: HeaderValue::U32(l1_size) },
            HeaderField { name: "l1_table_offset", value: HeaderValue::U64(l1_table_offset) },
            HeaderField { name: "refcount_table_offset", value: HeaderValue::U64(refcount_table_offset) },
            HeaderField { name: "refcount_table_clusters", value: HeaderValue::U32(refcount_table_clusters) },
            HeaderField { name: "nb_snapshots", value: HeaderValue::U32(nb_snapshots) },
            HeaderField { name: "snapshots_offset", value: HeaderValue::U64(snapshots_offset) },
        ];

        Ok(ImageHeader {
            fields,
            logical_size: size,
            physical_size,
            create_subtype: None,
            descriptor: Vec::new(),
        })
    }

    fn check_prerequisites(&self, header: &ImageHeader) -> SupportCheck {
        let mut check = SupportCheck {
            supported: true,
            ..Default::default()
        };

        if header.logical_size > DESCRIPTOR.max_logical_size {
            check.supported = false;
            check.failures.push(format!(
                "logical size {:.1} GiB exceeds the {} GiB qcow2 limit",
                header.logical_gib(),
                DESCRIPTOR.max_logical_size / GIB
            ));
        }

        let version = field_u32(header, "version");
        if !matches!(version, Some(2) | Some(3)) {
            check.supported = false;
            check.failures.push(format!(
                "unsupported qcow2 version {}",
                version.map_or_else(|| "unknown".into(), |v| v.to_string())
            ));
        }

        if field_u32(header, "crypt_method").is_some_and(|m| m != 0) {
            check.supported = false;
            check
                .failures
                .push("encrypted qcow2 images cannot be imported".to_string());
        }

        if field_u64(header, "backing_file_offset").is_some_and(|o| o != 0) {
            check.supported = false;
            check.failures.push(
                "image depends on a backing file and is not standalone".to_string(),
            );
        }

        check
    }
}

fn field_u32(header: &ImageHeader, name: &str) -> Option<u32> {
    header.fields.iter().find(|f| f.name == name).and_then(|f| match f.value {
        HeaderValue::U32(v) => Some(v),
        _ => None,
    })
}

fn field_u64(header: &ImageHeader, name: &str) -> Option<u64> {
    header.fields.iter().find(|f| f.name == name).and_then(|f| match f.value {
        HeaderValue::U64(v) => Some(v),
        _ => None,
    })
}
