//! Sector-level cryptographic primitives.
//!
//! Everything here exists to satisfy one contract: a volume written by this
//! crate must decrypt to a byte-identical plaintext stream when piped
//! through `aespipe -d -P <passphrase_file>` in single-key mode. The
//! contract pins five things: 512-byte sectors, AES-128-CBC, a per-sector
//! IV equal to the little-endian sector index starting at 0, no CBC
//! chaining across sector boundaries, and no header or envelope bytes.
//! Deviating from any of them silently produces volumes that only this
//! program can read, which defeats the point of the format.

pub mod sector;

pub use sector::{AES_BLOCK_SIZE, MIN_PASSPHRASE_LEN, SECTOR_SIZE, SectorCipher};
