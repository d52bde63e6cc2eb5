//! End-to-end round trips over a single volume: write a tree, decrypt
//! the volume with the sector oracle, extract the tar and compare.

mod common;

use std::fs;
use std::io::Read;

use flate2::read::GzDecoder;
use tempfile::TempDir;

use common::{PASSPHRASE, TestVolumes, decrypt_volume, scan_queue, tar_members};
use cryptar_core::backup::{BackupDriver, BackupOptions};
use cryptar_core::catalog::Catalog;
use cryptar_core::crypto::SECTOR_SIZE;
use cryptar_core::medium::CappedMedium;
use cryptar_core::Compression;

#[test]
fn single_file_no_compression() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("f1"), vec![0xAA; 512]).unwrap();

    let (medium, contents) = CappedMedium::unbounded();
    let mut driver = BackupDriver::new(
        scan_queue(dir.path()),
        TestVolumes::new(vec![medium]),
        Catalog::open_in_memory().unwrap(),
        BackupOptions::new(dir.path(), PASSPHRASE.to_vec()).with_buffer_size(2048),
    )
    .unwrap();
    let report = driver.run().unwrap();

    assert_eq!(report.files, 1);
    assert_eq!(contents.len() % SECTOR_SIZE, 0);

    let members = tar_members(&decrypt_volume(&contents.bytes(), PASSPHRASE));
    assert_eq!(members.len(), 1);
    assert!(members[0].0.ends_with("f1"));
    assert_eq!(members[0].1, vec![0xAA; 512]);
}

#[test]
fn directory_round_trip_boundary_sizes() {
    let dir = TempDir::new().unwrap();
    let sizes: &[usize] = &[0, 1, 511, 512, 513, 10_240];
    for &size in sizes {
        let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join(format!("size_{size:05}")), body).unwrap();
    }
    fs::create_dir(dir.path().join("sub")).unwrap();
    fs::write(dir.path().join("sub/nested"), b"nested content").unwrap();

    let (medium, contents) = CappedMedium::unbounded();
    let mut driver = BackupDriver::new(
        scan_queue(dir.path()),
        TestVolumes::new(vec![medium]),
        Catalog::open_in_memory().unwrap(),
        BackupOptions::new(dir.path(), PASSPHRASE.to_vec()).with_buffer_size(2048),
    )
    .unwrap();
    let report = driver.run().unwrap();

    // Six files, one directory, one nested file.
    assert_eq!(report.files, 8);

    let members = tar_members(&decrypt_volume(&contents.bytes(), PASSPHRASE));
    assert_eq!(members.len(), 8);
    for &size in sizes {
        let expected: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let (_, data) = members
            .iter()
            .find(|(name, _)| name.ends_with(&format!("size_{size:05}")))
            .unwrap_or_else(|| panic!("member for size {size} missing"));
        assert_eq!(data, &expected, "contents differ for size {size}");
    }
    let (_, nested) = members
        .iter()
        .find(|(name, _)| name.ends_with("sub/nested"))
        .unwrap();
    assert_eq!(nested, b"nested content");
}

#[test]
fn gzip_small_files_commit_by_close() {
    let dir = TempDir::new().unwrap();
    for i in 0..40 {
        fs::write(
            dir.path().join(format!("tiny-{i:02}")),
            format!("tiny file {i}"),
        )
        .unwrap();
    }

    let (medium, contents) = CappedMedium::unbounded();
    let mut driver = BackupDriver::new(
        scan_queue(dir.path()),
        TestVolumes::new(vec![medium]),
        Catalog::open_in_memory().unwrap(),
        BackupOptions::new(dir.path(), PASSPHRASE.to_vec())
            .with_buffer_size(2048)
            .with_compression(Compression::Gz),
    )
    .unwrap();
    let report = driver.run().unwrap();

    // Tiny members sit inside the compressor for a while; every one of
    // them must still be committed once the archive is closed.
    assert_eq!(report.files, 40);

    let plain = decrypt_volume(&contents.bytes(), PASSPHRASE);
    let mut tar_bytes = Vec::new();
    GzDecoder::new(&plain[..]).read_to_end(&mut tar_bytes).unwrap();
    let members = tar_members(&tar_bytes);
    assert_eq!(members.len(), 40);
    assert!(members[7].1.starts_with(b"tiny file"));
}

#[test]
fn short_passphrase_round_trips() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("data"), vec![0x42; 777]).unwrap();

    let short_passphrase = b"abcdefghij"; // 10 bytes: warned about, accepted
    let (medium, contents) = CappedMedium::unbounded();
    let mut driver = BackupDriver::new(
        scan_queue(dir.path()),
        TestVolumes::new(vec![medium]),
        Catalog::open_in_memory().unwrap(),
        BackupOptions::new(dir.path(), short_passphrase.to_vec()).with_buffer_size(2048),
    )
    .unwrap();
    driver.run().unwrap();

    let members = tar_members(&decrypt_volume(&contents.bytes(), short_passphrase));
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].1, vec![0x42; 777]);
}

#[test]
fn trailing_padding_decrypts_to_zeros() {
    // The stream is terminated by the tar trailer and zero padding to
    // the staging buffer size, all of it decryptable.
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("one"), b"x").unwrap();

    let (medium, contents) = CappedMedium::unbounded();
    let mut driver = BackupDriver::new(
        scan_queue(dir.path()),
        TestVolumes::new(vec![medium]),
        Catalog::open_in_memory().unwrap(),
        BackupOptions::new(dir.path(), PASSPHRASE.to_vec()).with_buffer_size(2048),
    )
    .unwrap();
    driver.run().unwrap();

    let plain = decrypt_volume(&contents.bytes(), PASSPHRASE);
    assert_eq!(plain.len() % 2048, 0);
    // Header block + data block + trailer, then zeros to the block end.
    assert!(plain[1536..].iter().all(|&b| b == 0));
}
