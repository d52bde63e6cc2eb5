//! Byte-oriented encrypting sink over a [`MediumFile`].
//!
//! Accepts plaintext, slices it into sectors, encrypts each with the
//! sector cipher, and pushes ciphertext through the medium in
//! buffer-size chunks. The sector index starts at 0 for every sink,
//! i.e. for every volume. Lives for exactly one volume.

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, trace};
use zeroize::Zeroizing;

use crate::crypto::{AES_BLOCK_SIZE, SECTOR_SIZE, SectorCipher};
use crate::medium::{MediumError, MediumFile};

/// Default output buffer: one tape block.
pub const DEFAULT_BUFFER_SIZE: usize = 131_072;

/// Errors raised by the encrypting sink.
#[derive(Error, Debug)]
pub enum SinkError {
    /// Sector size not a positive multiple of the AES block size.
    #[error("sector size must be a positive multiple of {AES_BLOCK_SIZE} bytes, not {0}")]
    InvalidSectorSize(usize),

    /// Buffer size not a positive multiple of the sector size.
    #[error("buffer size must be a positive multiple of {sector_size} bytes, not {buffer_size}")]
    InvalidBufferSize {
        buffer_size: usize,
        sector_size: usize,
    },

    /// Unaligned write with padding disabled. A programming error in the
    /// caller, not a device condition.
    #[error("write of {len} bytes is not a multiple of the {sector_size}-byte sector size")]
    UnalignedWrite { len: usize, sector_size: usize },

    /// The medium refused or failed the write.
    #[error(transparent)]
    Medium(#[from] MediumError),
}

impl SinkError {
    pub fn is_end_of_medium(&self) -> bool {
        matches!(self, SinkError::Medium(MediumError::EndOfMedium))
    }

    /// Lower into an `io::Error` for `Write`-trait plumbing, keeping
    /// end-of-medium distinguishable via `ErrorKind::StorageFull`.
    pub(crate) fn into_io(self) -> io::Error {
        if self.is_end_of_medium() {
            io::Error::new(io::ErrorKind::StorageFull, self)
        } else {
            io::Error::other(self)
        }
    }
}

/// Construction-time knobs for [`EncryptedSink`].
#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Output buffer size; ciphertext is pushed to the medium in chunks
    /// of this many bytes. Must be a multiple of `sector_size`.
    pub buffer_size: usize,
    /// Unit of independent encryption. 512 for aespipe compatibility.
    pub sector_size: usize,
    /// Zero-pad unaligned writes to the next sector boundary. Only the
    /// final write of a stream should ever need this; padding anywhere
    /// else injects zero runs into the plaintext.
    pub pad: bool,
    /// fsync the medium after every write.
    pub sync: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            sector_size: SECTOR_SIZE,
            pad: true,
            sync: false,
        }
    }
}

/// Encrypting write sink, aespipe single-key compatible.
pub struct EncryptedSink {
    cipher: SectorCipher,
    medium: MediumFile,
    sector: u64,
    /// Plaintext bytes accepted from callers, pre-padding.
    accepted: u64,
    sector_size: usize,
    buffer_size: usize,
    pad: bool,
    sync: bool,
    /// Ciphertext staging for buffer-size chunked medium writes.
    out: Vec<u8>,
}

impl std::fmt::Debug for EncryptedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedSink").finish_non_exhaustive()
    }
}

impl EncryptedSink {
    /// Open `path` as a fresh volume and encrypt onto it.
    pub fn create(
        path: &Path,
        passphrase: &[u8],
        options: SinkOptions,
    ) -> Result<Self, SinkError> {
        let medium = MediumFile::create(path)?;
        Self::wrap(medium, passphrase, options)
    }

    /// Encrypt onto an already-open medium.
    pub fn wrap(
        medium: MediumFile,
        passphrase: &[u8],
        options: SinkOptions,
    ) -> Result<Self, SinkError> {
        let SinkOptions {
            buffer_size,
            sector_size,
            pad,
            sync,
        } = options;
        if sector_size == 0 || sector_size % AES_BLOCK_SIZE != 0 {
            return Err(SinkError::InvalidSectorSize(sector_size));
        }
        if buffer_size == 0 || buffer_size % sector_size != 0 {
            return Err(SinkError::InvalidBufferSize {
                buffer_size,
                sector_size,
            });
        }
        debug!(buffer_size, sector_size, pad, sync, "encrypted sink ready");
        Ok(Self {
            cipher: SectorCipher::new(passphrase),
            medium,
            sector: 0,
            accepted: 0,
            sector_size,
            buffer_size,
            pad,
            sync,
            out: Vec::with_capacity(buffer_size),
        })
    }

    /// Encrypt and write `buf`, returning the number of plaintext bytes
    /// accepted (the pre-padding length).
    ///
    /// Unaligned input is zero-padded to the next sector boundary when
    /// `pad` is set and rejected otherwise. The medium is flushed after
    /// every call so write errors surface as early as possible.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, SinkError> {
        if buf.len() % self.sector_size != 0 && !self.pad {
            return Err(SinkError::UnalignedWrite {
                len: buf.len(),
                sector_size: self.sector_size,
            });
        }

        let mut sector_buf = Zeroizing::new(vec![0u8; self.sector_size]);
        for chunk in buf.chunks(self.sector_size) {
            sector_buf[..chunk.len()].copy_from_slice(chunk);
            sector_buf[chunk.len()..].fill(0);
            self.cipher.encrypt_sector(self.sector, &mut sector_buf);
            self.sector += 1;
            self.out.extend_from_slice(&sector_buf);
            if self.out.len() >= self.buffer_size {
                let result = self.medium.write_all(&self.out);
                self.out.clear();
                result?;
            }
        }
        if !self.out.is_empty() {
            let result = self.medium.write_all(&self.out);
            self.out.clear();
            result?;
        }
        self.medium.flush()?;
        if self.sync {
            self.medium.sync_data()?;
        }

        self.accepted += buf.len() as u64;
        trace!(
            bytes = buf.len(),
            total = self.accepted,
            sector = self.sector,
            "sink write"
        );
        Ok(buf.len())
    }

    /// Total plaintext bytes accepted.
    ///
    /// Equals the bytes durably written EXCEPT when the final write was
    /// padded, in which case the medium holds up to one sector more.
    /// Treat this as "bytes the caller asked us to write".
    pub fn tell(&self) -> u64 {
        self.accepted
    }

    /// Current sector index, i.e. sectors emitted so far.
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Close the underlying medium. No trailer of any kind is written;
    /// archive-level framing is the archive layer's business.
    pub fn close(self) -> Result<(), SinkError> {
        self.medium.close()?;
        Ok(())
    }
}
