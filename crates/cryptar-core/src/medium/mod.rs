//! Thin abstraction over the physical medium.
//!
//! A [`MediumFile`] wraps either a real file/device or any byte sink.
//! Its one job beyond plumbing is the end-of-medium policy: many tape
//! drivers report a full tape not with an errno but by *accepting zero
//! bytes* when the last block straddled the physical end. A completed
//! write of zero bytes is therefore translated into
//! [`MediumError::EndOfMedium`], as is an `ENOSPC` from the kernel.
//! Short writes other than zero are re-driven until the buffer drains.

pub mod capped;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, trace};

pub use capped::{CappedMedium, FailureMode, MediumContents};

/// Errors surfaced by the medium layer.
#[derive(Error, Debug)]
pub enum MediumError {
    /// The device accepted no further bytes. Recoverable by volume change.
    #[error("end of medium: device accepted no further bytes")]
    EndOfMedium,

    /// Any other I/O failure. The medium is in an unknown state.
    #[error("medium I/O error: {0}")]
    Io(#[source] io::Error),
}

impl MediumError {
    /// Classify a raw I/O error: "no space left" means the medium is full,
    /// everything else is a real fault.
    fn from_io(err: io::Error) -> Self {
        if is_no_space(&err) {
            MediumError::EndOfMedium
        } else {
            MediumError::Io(err)
        }
    }

    pub fn is_end_of_medium(&self) -> bool {
        matches!(self, MediumError::EndOfMedium)
    }
}

fn is_no_space(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::ENOSPC) {
        return true;
    }
    err.kind() == io::ErrorKind::StorageFull
}

enum Backing {
    File(File),
    Stream(Box<dyn Write + Send>),
}

impl Backing {
    fn as_write(&mut self) -> &mut dyn Write {
        match self {
            Backing::File(f) => f,
            Backing::Stream(s) => s,
        }
    }
}

/// A write-only handle onto one volume of sequential storage.
pub struct MediumFile {
    backing: Backing,
}

impl std::fmt::Debug for MediumFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediumFile").finish_non_exhaustive()
    }
}

impl MediumFile {
    /// Open (and truncate) a file or device node for writing.
    pub fn create(path: &Path) -> Result<Self, MediumError> {
        debug!(path = %path.display(), "opening medium");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(MediumError::from_io)?;
        Ok(Self {
            backing: Backing::File(file),
        })
    }

    /// Wrap an arbitrary byte sink (a pipe, a test double).
    pub fn wrap<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            backing: Backing::Stream(Box::new(writer)),
        }
    }

    /// Write the whole buffer, re-driving short writes.
    ///
    /// A completed write of zero bytes is the end-of-medium signal and is
    /// never retried.
    pub fn write_all(&mut self, mut buf: &[u8]) -> Result<(), MediumError> {
        while !buf.is_empty() {
            match self.backing.as_write().write(buf) {
                Ok(0) => {
                    trace!("zero-byte write: end of medium");
                    return Err(MediumError::EndOfMedium);
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(MediumError::from_io(e)),
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), MediumError> {
        self.backing.as_write().flush().map_err(MediumError::from_io)
    }

    /// Force the OS to commit buffered data to the device. A no-op for
    /// wrapped streams, which have no kernel-side buffer we control.
    pub fn sync_data(&mut self) -> Result<(), MediumError> {
        match &self.backing {
            Backing::File(f) => f.sync_data().map_err(MediumError::from_io),
            Backing::Stream(_) => Ok(()),
        }
    }

    /// Close the handle without any further flushing.
    pub fn close(self) -> Result<(), MediumError> {
        // Dropping the File closes the descriptor; buffered state was
        // already flushed by the callers that care.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A writer that accepts at most `chunk` bytes per call.
    struct Dribbler {
        chunk: usize,
        out: Vec<u8>,
    }

    impl Write for Dribbler {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn short_writes_are_redriven() {
        let mut medium = MediumFile::wrap(Dribbler {
            chunk: 3,
            out: Vec::new(),
        });
        medium.write_all(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        // The dribbler is owned by the medium now; a second write proves
        // the loop drained everything without error.
        medium.write_all(&[8]).unwrap();
    }

    #[test]
    fn zero_byte_write_is_end_of_medium() {
        let (capped, _contents) = CappedMedium::with_capacity(4, FailureMode::WriteZero);
        let mut medium = MediumFile::wrap(capped);
        medium.write_all(&[0u8; 4]).unwrap();
        let err = medium.write_all(&[0u8; 1]).unwrap_err();
        assert!(err.is_end_of_medium());
    }

    #[test]
    fn enospc_is_end_of_medium() {
        let (capped, _contents) = CappedMedium::with_capacity(4, FailureMode::Enospc);
        let mut medium = MediumFile::wrap(capped);
        let err = medium.write_all(&[0u8; 5]).unwrap_err();
        assert!(err.is_end_of_medium());
    }

    #[test]
    fn file_medium_writes_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("volume.aes");
        let mut medium = MediumFile::create(&path).unwrap();
        medium.write_all(b"sectors").unwrap();
        medium.flush().unwrap();
        medium.sync_data().unwrap();
        medium.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"sectors");
    }
}
