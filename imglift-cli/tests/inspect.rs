//! CLI integration tests for `imglift inspect`.

use assert_cmd::Command;
use imglift_test_utils::images::{write_qcow2, write_vmdk, Qcow2Spec, VmdkSpec};
use predicates::prelude::*;
use tempfile::TempDir;

const GIB: u64 = 1 << 30;

#[test]
fn inspect_prints_format_and_sizes_for_a_valid_vmdk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.vmdk");
    write_vmdk(
        &path,
        &VmdkSpec::new(20 * GIB / 512, Some("monolithicSparse")),
    )
    .unwrap();

    Command::cargo_bin("imglift")
        .unwrap()
        .arg("inspect")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("format:   VMDK"))
        .stdout(predicate::str::contains("20.0 GiB logical"))
        .stdout(predicate::str::contains("subtype:  monolithicSparse"))
        .stdout(predicate::str::contains("verdict:  supported"));
}

#[test]
fn inspect_fails_with_reasons_for_an_oversized_qcow2() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("big.qcow2");
    write_qcow2(&path, &Qcow2Spec::new(600 * GIB)).unwrap();

    Command::cargo_bin("imglift")
        .unwrap()
        .arg("inspect")
        .arg(&path)
        .assert()
        .failure()
        .stdout(predicate::str::contains("verdict:  not supported"))
        .stdout(predicate::str::contains("300 GiB"));
}

#[test]
fn inspect_rejects_an_unrecognized_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("not-an-image.bin");
    std::fs::write(&path, vec![0xAAu8; 4096]).unwrap();

    Command::cargo_bin("imglift")
        .unwrap()
        .arg("inspect")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized image format"));
}
