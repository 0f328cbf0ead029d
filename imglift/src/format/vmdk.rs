//! VMDK sparse-extent header parsing.
//!
//! The sparse-extent envelope starts with a 512-byte little-endian header
//! followed (at a declared sector offset) by a textual descriptor of
//! `key=value` lines. Capacity is declared in 512-byte sectors; the
//! create-subtype lives in the descriptor's `createType` key.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use imglift_shared::constants::geometry::{GIB, SECTOR_SIZE};
use imglift_shared::errors::{MigrateError, MigrateResult};

use super::{
    slice4, slice8, ContainerFormat, FormatDescriptor, HeaderField, HeaderValue, ImageHeader,
    SupportCheck,
};

/// Fixed sparse-extent header length.
const HEADER_LEN: usize = 512;

static DESCRIPTOR: FormatDescriptor = FormatDescriptor {
    name: "VMDK",
    magic: b"KDMV",
    max_logical_size: 300 * GIB,
    accepted_subtypes: &[
        "monolithicSparse",
        "twoGbMaxExtentSparse",
        "streamOptimized",
    ],
    fragile_subtypes: &["streamOptimized"],
};

/// The VMDK sparse-extent format implementation.
#[derive(Debug)]
pub struct Vmdk;

impl ContainerFormat for Vmdk {
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
                "{}: shorter than the {}-byte VMDK sparse header",
                path.display(),
                HEADER_LEN
            )),
            _ => MigrateError::Format(format!("cannot read {}: {}", path.display(), e)),
        })?;

        // Sparse-extent header layout (little-endian):
        // 0-3:   magic "KDMV"
        // 4-7:   version
        // 8-11:  flags
        // 12-19: capacity (512-byte sectors)
        // 20-27: grain size (sectors)
        // 28-35: descriptor offset (sectors)
        // 36-43: descriptor size (sectors)
        // 44-47: grain-table entries per grain table
        // 48-55: redundant grain-directory offset
        // 56-63: grain-directory offset
        // 64-71: metadata overhead (sectors)
        // 72:    unclean-shutdown marker
        // 73-76: line-terminator detection bytes
        // 77-78: compression algorithm
        let magic = u32::from_le_bytes(slice4(&buf, 0));
        if &buf[0..4] != DESCRIPTOR.magic {
            return Err(MigrateError::Format(format!(
                "{}: VMDK magic mismatch (0x{:08x})",
                path.display(),
                magic
            )));
        }
        let version = u32::from_le_bytes(slice4(&buf, 4));
        let flags = u32::from_le_bytes(slice4(&buf, 8));
        let capacity = u64::from_le_bytes(slice8(&buf, 12));
        let grain_size = u64::from_le_bytes(slice8(&buf, 20));
        let descriptor_offset = u64::from_le_bytes(slice8(&buf, 28));
        let descriptor_size = u64::from_le_bytes(slice8(&buf, 36));
        let num_gtes_per_gt = u32::from_le_bytes(slice4(&buf, 44));
        let rgd_offset = u64::from_le_bytes(slice8(&buf, 48));
        let gd_offset = u64::from_le_bytes(slice8(&buf, 56));
        let overhead = u64::from_le_bytes(slice8(&buf, 64));
        let unclean_shutdown = buf[72];
        let compress_algorithm = u16::from_le_bytes([buf[77], buf[78]]);

        if capacity == 0 {
            // Logical size must be computable before any mount is attempted.
            return Err(MigrateError::Format(format!(
                "{}: VMDK header declares zero capacity",
                path.display()
            )));
        }
        let logical_size = capacity.checked_mul(SECTOR_SIZE).ok_or_else(|| {
            MigrateError::Format(format!(
                "{}: VMDK capacity {} sectors overflows",
                path.display(),
                capacity
            ))
        })?;

        let descriptor =
            read_descriptor(&mut file, path, descriptor_offset, descriptor_size)?;
        let create_subtype = descriptor
            .iter()
            .find(|(key, _)| key == "createType")
            .map(|(_, value)| value.clone());

        let fields = vec![
            HeaderField { name: "magicNumber", value: HeaderValue::U32(magic) },
            HeaderField { name: "version", value: HeaderValue::U32(version) },
            HeaderField { name: "flags", value: HeaderValue::U32(flags) },
            HeaderField { name: "capacity", value: HeaderValue::U64(capacity) },
            HeaderField { name: "grainSize", value: HeaderValue::U64(grain_size) },
            HeaderField { name: "descriptorOffset", value: HeaderValue::U64(descriptor_offset) },
            HeaderField { name: "descriptorSize", value: HeaderValue::U64(descriptor_size) },
            HeaderField { name: "numGTEsPerGT", value: HeaderValue::U32(num_gtes_per_gt) },
            HeaderField { name: "rgdOffset", value: HeaderValue::U64(rgd_offset) },
            HeaderField { name: "gdOffset", value: HeaderValue::U64(gd_offset) },
            HeaderField { name: "overHead", value: HeaderValue::U64(overhead) },
            HeaderField { name: "uncleanShutdown", value: HeaderValue::U8(unclean_shutdown) },
            HeaderField { name: "compressAlgorithm", value: HeaderValue::U16(compress_algorithm) },
        ];

        Ok(ImageHeader {
            fields,
            logical_size,
            physical_size,
            create_subtype,
            descriptor,
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
                "logical size {:.1} GiB exceeds the {} GiB VMDK limit",
                header.logical_gib(),
                DESCRIPTOR.max_logical_size / GIB
            ));
        }

        match header.create_subtype.as_deref() {
            Some(subtype) if DESCRIPTOR.accepted_subtypes.contains(&subtype) => {
                if DESCRIPTOR.fragile_subtypes.contains(&subtype) {
                    check.confirmation = Some(format!(
                        "create type '{}' is supported but fragile for import; \
                         continuing requires operator confirmation",
                        subtype
                    ));
                }
            }
            Some(subtype) => {
                check.supported = false;
                check.failures.push(format!(
                    "unsupported VMDK create type '{}'",
                    subtype
                ));
            }
            None => {
                check.supported = false;
                check
                    .failures
                    .push("VMDK descriptor declares no createType".to_string());
            }
        }

        check
    }
}

/// Read and tokenize the embedded textual descriptor.
///
/// `key=value` lines with surrounding quotes stripped; comment and
/// unparseable lines are dropped silently but logged.
fn read_descriptor(
    file: &mut File,
    path: &Path,
    offset_sectors: u64,
    size_sectors: u64,
) -> MigrateResult<Vec<(String, String)>> {
    if offset_sectors == 0 || size_sectors == 0 {
        return Ok(Vec::new());
    }

    let offset = offset_sectors * SECTOR_SIZE;
    let len = (size_sectors * SECTOR_SIZE) as usize;
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(offset)).map_err(|e| {
        MigrateError::Format(format!(
            "{}: cannot seek to descriptor window: {}",
            path.display(),
            e
        ))
    })?;
    file.read_exact(&mut buf).map_err(|_| {
        MigrateError::TruncatedHeader(format!(
            "{}: descriptor window truncated",
            path.display()
        ))
    })?;

    // The window is NUL-padded to the declared sector count.
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let text = String::from_utf8_lossy(&buf[..end]);

    let mut pairs = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                let key = key.trim().to_string();
                let value = value.trim().trim_matches('"').to_string();
                pairs.push((key, value));
            }
            None => {
                tracing::debug!(line, "dropping unparseable descriptor line");
            }
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use imglift_test_utils::images::{write_truncated_file, write_vmdk, VmdkSpec};

    #[test]
    fn parses_capacity_into_exact_logical_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        // 50 GiB worth of sectors.
        let capacity = 50 * GIB / SECTOR_SIZE;
        write_vmdk(&path, &VmdkSpec::new(capacity, Some("monolithicSparse"))).unwrap();

        let header = Vmdk.parse(&path).unwrap();
        assert_eq!(header.logical_size, capacity * SECTOR_SIZE);
        assert_eq!(header.create_subtype.as_deref(), Some("monolithicSparse"));
        assert_eq!(header.fields[0].name, "magicNumber");
    }

    #[test]
    fn truncated_header_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.vmdk");
        write_truncated_file(&path, b"KDMV", 64).unwrap();

        let err = Vmdk.parse(&path).unwrap_err();
        assert!(matches!(err, MigrateError::TruncatedHeader(_)));
    }

    #[test]
    fn zero_capacity_never_defaults_logical_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.vmdk");
        write_vmdk(&path, &VmdkSpec::new(0, Some("monolithicSparse"))).unwrap();

        let err = Vmdk.parse(&path).unwrap_err();
        assert!(matches!(err, MigrateError::Format(_)));
    }

    #[test]
    fn descriptor_lines_tokenize_with_quotes_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desc.vmdk");
        let spec = VmdkSpec::new(2048, Some("monolithicSparse"))
            .with_descriptor_line("encoding=\"UTF-8\"")
            .with_descriptor_line("this line has no separator");
        write_vmdk(&path, &spec).unwrap();

        let header = Vmdk.parse(&path).unwrap();
        assert!(header
            .descriptor
            .iter()
            .any(|(k, v)| k == "encoding" && v == "UTF-8"));
        // The separator-less line is dropped, not an error.
        assert!(!header.descriptor.iter().any(|(k, _)| k.contains("separator")));
    }

    #[test]
    fn unsupported_subtype_fails_support_check_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.vmdk");
        let capacity = 50 * GIB / SECTOR_SIZE;
        write_vmdk(&path, &VmdkSpec::new(capacity, Some("monolithicFlat"))).unwrap();

        let header = Vmdk.parse(&path).unwrap();
        let check = Vmdk.check_prerequisites(&header);
        assert!(!check.supported);
        assert_eq!(check.failures.len(), 1);
        assert!(check.failures[0].contains("monolithicFlat"));
    }

    #[test]
    fn oversized_image_failure_names_limit_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.vmdk");
        let capacity = 600 * GIB / SECTOR_SIZE;
        write_vmdk(&path, &VmdkSpec::new(capacity, Some("monolithicSparse"))).unwrap();

        let header = Vmdk.parse(&path).unwrap();
        let check = Vmdk.check_prerequisites(&header);
        assert!(!check.supported);
        assert!(check.failures[0].contains("300 GiB"));
        assert!(check.failures[0].contains("600.0 GiB"));
    }

    #[test]
    fn fragile_subtype_passes_with_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.vmdk");
        write_vmdk(&path, &VmdkSpec::new(2048, Some("streamOptimized"))).unwrap();

        let header = Vmdk.parse(&path).unwrap();
        let check = Vmdk.check_prerequisites(&header);
        assert!(check.supported);
        assert!(check.confirmation.unwrap().contains("streamOptimized"));
    }
}
