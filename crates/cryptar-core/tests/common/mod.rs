//! Shared helpers for the integration suites.
//!
//! The sector oracle here does exactly what `aespipe -d -P pwfile`
//! would do to a volume, so round-trip assertions hold against the
//! real tool as well.

use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::path::Path;

use crossbeam_channel::bounded;

use cryptar_core::changer::{ChangerError, Volume, VolumeSource};
use cryptar_core::crypto::{SECTOR_SIZE, SectorCipher};
use cryptar_core::medium::{CappedMedium, MediumFile};
use cryptar_core::queue::RestartableQueue;
use cryptar_core::scan::{ScanItem, Scanner};

pub const PASSPHRASE: &[u8] = b"passphraseABCDEFGHIJ";

/// Decrypt a whole volume the way `aespipe -d` would.
pub fn decrypt_volume(ciphertext: &[u8], passphrase: &[u8]) -> Vec<u8> {
    assert_eq!(
        ciphertext.len() % SECTOR_SIZE,
        0,
        "volume is not sector aligned"
    );
    let cipher = SectorCipher::new(passphrase);
    let mut plain = ciphertext.to_vec();
    for (index, sector) in plain.chunks_exact_mut(SECTOR_SIZE).enumerate() {
        cipher.decrypt_sector(index as u64, sector);
    }
    plain
}

/// Member names and contents of a plaintext tar stream, in order.
pub fn tar_members(tar_bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
    let mut members = Vec::new();
    for entry in archive.entries().expect("tar entries") {
        let mut entry = entry.expect("tar entry");
        let name = entry.path().expect("member path").display().to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).expect("member data");
        members.push((name, data));
    }
    members
}

/// Walk `root` on a background thread and wrap the channel in a
/// restartable queue, exactly the way the CLI wires things up.
pub fn scan_queue(root: &Path) -> RestartableQueue<ScanItem> {
    let (tx, rx) = bounded(64);
    Scanner::new(root).spawn(tx).expect("spawn scanner");
    RestartableQueue::new(rx)
}

/// Volume source handing out pre-built in-memory media in order.
pub struct TestVolumes {
    media: VecDeque<CappedMedium>,
    handed_out: usize,
}

impl TestVolumes {
    pub fn new(media: Vec<CappedMedium>) -> Self {
        Self {
            media: media.into(),
            handed_out: 0,
        }
    }
}

impl VolumeSource for TestVolumes {
    fn next_volume(&mut self) -> Result<Volume, ChangerError> {
        let medium = self.media.pop_front().expect("test ran out of volumes");
        self.handed_out += 1;
        Ok(Volume {
            voltag: format!("TEST{:03}", self.handed_out),
            medium: MediumFile::wrap(medium),
        })
    }
}
