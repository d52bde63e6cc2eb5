//! aespipe single-key sector cipher.
//!
//! `aespipe` in single-key mode treats the stream as independent 512-byte
//! sectors. Sector *n* is encrypted with AES-128-CBC under an IV that is
//! the 16-byte little-endian encoding of *n*; the CBC state is discarded
//! at every sector boundary. The key is the first 16 bytes of
//! SHA-256(passphrase), with no salt and no iteration count — which is why
//! aespipe insists on passphrases of at least 20 characters.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};
use tracing::warn;
use zeroize::Zeroizing;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES operates on 16-byte blocks; sector sizes must be a multiple of this.
pub const AES_BLOCK_SIZE: usize = 16;

/// The sector size `aespipe` single-key mode is defined over.
pub const SECTOR_SIZE: usize = 512;

/// `aespipe` refuses passphrases shorter than this.
pub const MIN_PASSPHRASE_LEN: usize = 20;

/// Per-sector AES-128-CBC cipher keyed by passphrase.
///
/// The cipher is stateless across sectors: each call rebuilds the CBC
/// state from the sector index, so encrypting a stream sector-by-sector
/// and encrypting the sectors in any other order produce the same bytes.
pub struct SectorCipher {
    key: Zeroizing<[u8; 16]>,
}

impl SectorCipher {
    /// Derive the cipher from a passphrase.
    ///
    /// The passphrase must not carry a trailing newline — `aespipe` reads
    /// its passphrase file without one, and a stray `\n` derives a
    /// different key. Passphrases shorter than [`MIN_PASSPHRASE_LEN`]
    /// produce a stream `aespipe` itself would have refused to create;
    /// we warn but proceed, matching the original tool.
    pub fn new(passphrase: &[u8]) -> Self {
        if passphrase.len() < MIN_PASSPHRASE_LEN {
            warn!(
                len = passphrase.len(),
                "passphrase shorter than {MIN_PASSPHRASE_LEN} bytes is incompatible with aespipe"
            );
        }
        let digest = Sha256::digest(passphrase);
        let mut key = Zeroizing::new([0u8; 16]);
        key.copy_from_slice(&digest[..16]);
        Self { key }
    }

    /// The IV for sector `index`: the index as 16 little-endian bytes.
    fn iv(index: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..8].copy_from_slice(&index.to_le_bytes());
        iv
    }

    /// Encrypt one sector in place.
    ///
    /// `sector` must be a multiple of the AES block size; the caller
    /// (the sink) is responsible for slicing the stream into sectors and
    /// zero-padding the tail.
    pub fn encrypt_sector(&self, index: u64, sector: &mut [u8]) {
        debug_assert_eq!(sector.len() % AES_BLOCK_SIZE, 0);
        let iv = Self::iv(index);
        let mut cbc = Aes128CbcEnc::new(
            GenericArray::from_slice(&self.key[..]),
            GenericArray::from_slice(&iv),
        );
        for block in sector.chunks_exact_mut(AES_BLOCK_SIZE) {
            cbc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    /// Decrypt one sector in place. The inverse of [`encrypt_sector`];
    /// equivalent to what `aespipe -d` does to sector `index`.
    ///
    /// [`encrypt_sector`]: SectorCipher::encrypt_sector
    pub fn decrypt_sector(&self, index: u64, sector: &mut [u8]) {
        debug_assert_eq!(sector.len() % AES_BLOCK_SIZE, 0);
        let iv = Self::iv(index);
        let mut cbc = Aes128CbcDec::new(
            GenericArray::from_slice(&self.key[..]),
            GenericArray::from_slice(&iv),
        );
        for block in sector.chunks_exact_mut(AES_BLOCK_SIZE) {
            cbc.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}
