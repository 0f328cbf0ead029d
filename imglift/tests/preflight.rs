//! Integration tests for the preflight path: format detection, header
//! parsing, prerequisite checks, and eligibility bookkeeping, end to end
//! through the public pipeline API.

use imglift::format::{self, ImageFile};
use imglift::report::MigrationReport;
use imglift::{pipeline, MigrationState};
use imglift_shared::constants::geometry::{GIB, SECTOR_SIZE};
use imglift_test_utils::images::{write_qcow2, write_vmdk, Qcow2Spec, VmdkSpec};
use tempfile::TempDir;

struct TestImages {
    dir: TempDir,
}

impl TestImages {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn vmdk(&self, name: &str, gib: u64, create_type: &str) -> std::path::PathBuf {
        let path = self.dir.path().join(name);
        let spec = VmdkSpec::new(gib * GIB / SECTOR_SIZE, Some(create_type));
        write_vmdk(&path, &spec).expect("failed to write vmdk fixture");
        path
    }

    fn qcow2(&self, name: &str, gib: u64) -> std::path::PathBuf {
        let path = self.dir.path().join(name);
        write_qcow2(&path, &Qcow2Spec::new(gib * GIB)).expect("failed to write qcow2 fixture");
        path
    }
}

#[test]
fn supported_vmdk_passes_preflight_with_exact_sizes() {
    let images = TestImages::new();
    let path = images.vmdk("good.vmdk", 50, "monolithicSparse");

    let state = MigrationState::new();
    let info = pipeline::preflight(&path, &state, false)
        .expect("preflight failed")
        .expect("image should parse");

    assert!(state.is_eligible());
    assert_eq!(info.header.logical_size, 50 * GIB);
    assert_eq!(info.format.descriptor().name, "VMDK");

    // Physical size is the fixture file's actual length, not the
    // declared capacity.
    let file_len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(info.header.physical_size, file_len);
}

#[test]
fn both_formats_reject_a_600_gib_image_with_numeric_reasons() {
    let images = TestImages::new();

    for path in [
        images.vmdk("big.vmdk", 600, "monolithicSparse"),
        images.qcow2("big.qcow2", 600),
    ] {
        let state = MigrationState::new();
        pipeline::preflight(&path, &state, false)
            .expect("preflight failed")
            .expect("header should parse");
        assert!(!state.is_eligible(), "{} should be too big", path.display());
        let reasons = state.reasons();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains("300 GiB"), "limit missing: {}", reasons[0]);
        assert!(reasons[0].contains("600.0 GiB"), "size missing: {}", reasons[0]);
    }
}

#[test]
fn format_detection_is_shared_between_inspect_and_pipeline() {
    let images = TestImages::new();
    let path = images.qcow2("disk.qcow2", 10);

    let image = ImageFile::open(&path).unwrap();
    let format = format::detect(&image).unwrap();
    assert_eq!(format.descriptor().name, "qcow2");

    let header = format.parse(&path).unwrap();
    assert_eq!(header.logical_size, 10 * GIB);
}

#[test]
fn disqualified_run_still_produces_a_complete_report() {
    let images = TestImages::new();
    let path = images.vmdk("fragile.vmdk", 10, "monolithicFlat");

    let state = MigrationState::new();
    let info = pipeline::preflight(&path, &state, false)
        .expect("preflight failed")
        .expect("image should parse");

    let mut report = MigrationReport::new(&path);
    report.set_header(info.format.descriptor().name, &info.header);
    report.finalize(&state);

    assert!(!report.eligible);
    assert_eq!(report.format.as_deref(), Some("VMDK"));
    assert!(!report.header_fields.is_empty());
    assert_eq!(report.reasons.len(), 1);
    assert!(report.reasons[0].contains("monolithicFlat"));

    let out = images.dir.path().join("report.json");
    report.write_json(&out).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(json["eligible"], false);
    assert_eq!(json["format"], "VMDK");
}

#[test]
fn preflight_accumulates_every_failure_not_just_the_first() {
    let images = TestImages::new();
    // Oversized AND an unsupported subtype: both reasons must surface.
    let path = images.vmdk("bad.vmdk", 600, "monolithicFlat");

    let state = MigrationState::new();
    pipeline::preflight(&path, &state, false)
        .expect("preflight failed")
        .expect("image should parse");

    let reasons = state.reasons();
    assert_eq!(reasons.len(), 2);
    assert!(reasons.iter().any(|r| r.contains("300 GiB")));
    assert!(reasons.iter().any(|r| r.contains("monolithicFlat")));
}
