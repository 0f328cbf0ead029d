//! Synthetic disk-image fixtures.
//!
//! Writes just enough of each container format for header parsing:
//! a valid fixed header plus, for VMDK, an embedded textual descriptor.
//! The data area is left sparse; these images are never mounted.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

const SECTOR: u64 = 512;

/// Spec for a synthetic VMDK sparse-extent image.
#[derive(Debug, Clone)]
pub struct VmdkSpec {
    pub capacity_sectors: u64,
    pub create_type: Option<String>,
    pub descriptor_offset_sectors: u64,
    pub descriptor_size_sectors: u64,
    pub extra_descriptor_lines: Vec<String>,
}

impl VmdkSpec {
    pub fn new(capacity_sectors: u64, create_type: Option<&str>) -> Self {
        Self {
            capacity_sectors,
            create_type: create_type.map(str::to_string),
            descriptor_offset_sectors: 1,
            descriptor_size_sectors: 20,
            extra_descriptor_lines: Vec::new(),
        }
    }

    /// Append a raw line to the descriptor window.
    pub fn with_descriptor_line(mut self, line: &str) -> Self {
        self.extra_descriptor_lines.push(line.to_string());
        self
    }
}

/// Write a VMDK sparse-extent header + descriptor to `path`.
pub fn write_vmdk(path: &Path, spec: &VmdkSpec) -> io::Result<()> {
    let mut header = [0u8; 512];
    header[0..4].copy_from_slice(b"KDMV");
    header[4..8].copy_from_slice(&1u32.to_le_bytes()); // version
    header[8..12].copy_from_slice(&3u32.to_le_bytes()); // flags
    header[12..20].copy_from_slice(&spec.capacity_sectors.to_le_bytes());
    header[20..28].copy_from_slice(&128u64.to_le_bytes()); // grain size
    header[28..36].copy_from_slice(&spec.descriptor_offset_sectors.to_le_bytes());
    header[36..44].copy_from_slice(&spec.descriptor_size_sectors.to_le_bytes());
    header[44..48].copy_from_slice(&512u32.to_le_bytes()); // GTEs per GT
    header[48..56].copy_from_slice(&0u64.to_le_bytes()); // rgdOffset
    header[56..64].copy_from_slice(&21u64.to_le_bytes()); // gdOffset
    header[64..72].copy_from_slice(&128u64.to_le_bytes()); // overhead
    header[72] = 0; // clean shutdown
    header[73] = b'\n';
    header[74] = b' ';
    header[75] = b'\r';
    header[76] = b'\n';
    header[77..79].copy_from_slice(&0u16.to_le_bytes()); // compression

    let mut descriptor = String::from("# Disk DescriptorFile\nversion=1\nCID=fffffffe\nparentCID=ffffffff\n");
    if let Some(create_type) = &spec.create_type {
        descriptor.push_str(&format!("createType=\"{create_type}\"\n"));
    }
    descriptor.push_str(&format!(
        "RW {} SPARSE \"{}\"\n",
        spec.capacity_sectors,
        path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
    ));
    for line in &spec.extra_descriptor_lines {
        descriptor.push_str(line);
        descriptor.push('\n');
    }

    let mut file = File::create(path)?;
    file.write_all(&header)?;
    file.seek(SeekFrom::Start(spec.descriptor_offset_sectors * SECTOR))?;
    file.write_all(descriptor.as_bytes())?;
    // NUL-pad the descriptor window to its declared length.
    let window_end =
        (spec.descriptor_offset_sectors + spec.descriptor_size_sectors) * SECTOR;
    file.set_len(window_end)?;
    Ok(())
}

/// Spec for a synthetic qcow2 image.
#[derive(Debug, Clone)]
pub struct Qcow2Spec {
    pub size: u64,
    pub version: u32,
    pub crypt_method: u32,
    pub backing_file_offset: u64,
    pub cluster_bits: u32,
}

impl Qcow2Spec {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            version: 3,
            crypt_method: 0,
            backing_file_offset: 0,
            cluster_bits: 16,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_crypt_method(mut self, method: u32) -> Self {
        self.crypt_method = method;
        self
    }

    pub fn with_backing_file_offset(mut self, offset: u64) -> Self {
        self.backing_file_offset = offset;
        self
    }
}

/// Write a qcow2 fixed header to `path`.
pub fn write_qcow2(path: &Path, spec: &Qcow2Spec) -> io::Result<()> {
    let mut header = [0u8; 512];
    header[0..4].copy_from_slice(b"QFI\xfb");
    header[4..8].copy_from_slice(&spec.version.to_be_bytes());
    header[8..16].copy_from_slice(&spec.backing_file_offset.to_be_bytes());
    header[16..20].copy_from_slice(&0u32.to_be_bytes()); // backing name length
    header[20..24].copy_from_slice(&spec.cluster_bits.to_be_bytes());
    header[24..32].copy_from_slice(&spec.size.to_be_bytes());
    header[32..36].copy_from_slice(&spec.crypt_method.to_be_bytes());
    header[36..40].copy_from_slice(&1u32.to_be_bytes()); // l1 entries
    header[40..48].copy_from_slice(&(1u64 << spec.cluster_bits).to_be_bytes());
    header[48..56].copy_from_slice(&(2u64 << spec.cluster_bits).to_be_bytes());
    header[56..60].copy_from_slice(&1u32.to_be_bytes()); // refcount clusters
    header[60..64].copy_from_slice(&0u32.to_be_bytes()); // snapshots
    header[64..72].copy_from_slice(&0u64.to_be_bytes()); // snapshot offset

    let mut file = File::create(path)?;
    file.write_all(&header)?;
    Ok(())
}

/// Write `total_len` bytes: the given magic followed by zero padding.
///
/// Used to build files that match a registered magic but are shorter than
/// the format's fixed header.
pub fn write_truncated_file(path: &Path, magic: &[u8], total_len: usize) -> io::Result<()> {
    let mut data = vec![0u8; total_len.max(magic.len())];
    data[..magic.len()].copy_from_slice(magic);
    let mut file = File::create(path)?;
    file.write_all(&data)?;
    Ok(())
}
