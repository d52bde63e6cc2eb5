//! Tar archive emission over the encrypting sink.
//!
//! An [`ArchiveWriter`] streams POSIX tar records, optionally through a
//! streaming compressor, into a fixed staging buffer that feeds the
//! [`EncryptedSink`] in tape-block units. It lives for exactly one
//! volume. Alongside the stream it keeps the per-member durability
//! ledger: a member counts as committed only once enough later writes
//! have pushed its final byte out of every buffer and onto the medium.

mod pending;
mod staging;

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};
use xz2::write::XzEncoder;

use crate::medium::MediumFile;
use crate::sink::{DEFAULT_BUFFER_SIZE, EncryptedSink, SinkError, SinkOptions};

pub use pending::{PendingRecord, PendingTracker};
use staging::{StagingStats, StagingWriter};

/// Streaming compressor applied inside the encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gz,
    Bz2,
    Xz,
}

/// Errors raised by the archive layer.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// The medium filled up mid-archive. The writer closed itself early
    /// and is dead; recover by switching volumes and replaying.
    #[error("end of medium while writing archive")]
    MediumFull,

    /// The writer was already closed (normally or early).
    #[error("archive writer is closed")]
    Closed,

    /// Non-recoverable I/O failure; the writer is dead.
    #[error("archive I/O error: {0}")]
    Io(#[source] io::Error),

    /// Sink construction or teardown failure.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// `close()` finished with members still unaccounted for. Indicates
    /// a bug in the durability accounting, not a device condition.
    #[error("commit accounting mismatch: {committed} committed of {added} added members")]
    CommitMismatch { committed: u64, added: u64 },
}

impl ArchiveError {
    fn from_io(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::StorageFull {
            ArchiveError::MediumFull
        } else {
            ArchiveError::Io(err)
        }
    }
}

/// Construction-time knobs for [`ArchiveWriter`].
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    pub compression: Compression,
    /// Staging buffer size; also the sink's output buffer size.
    pub buffer_size: usize,
    /// fsync the medium after every sink write.
    pub sync: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sync: false,
        }
    }
}

enum Compressor {
    Plain(StagingWriter),
    Gz(GzEncoder<StagingWriter>),
    Bz2(BzEncoder<StagingWriter>),
    Xz(XzEncoder<StagingWriter>),
}

impl Compressor {
    fn new(staging: StagingWriter, compression: Compression) -> Self {
        match compression {
            Compression::None => Compressor::Plain(staging),
            Compression::Gz => {
                Compressor::Gz(GzEncoder::new(staging, flate2::Compression::default()))
            }
            Compression::Bz2 => {
                Compressor::Bz2(BzEncoder::new(staging, bzip2::Compression::default()))
            }
            Compression::Xz => Compressor::Xz(XzEncoder::new(staging, 6)),
        }
    }

    /// Flush the compressor tail and hand back the staging writer.
    fn finish(self) -> io::Result<StagingWriter> {
        match self {
            Compressor::Plain(staging) => Ok(staging),
            Compressor::Gz(encoder) => encoder.finish(),
            Compressor::Bz2(encoder) => encoder.finish(),
            Compressor::Xz(encoder) => encoder.finish(),
        }
    }
}

impl Write for Compressor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Compressor::Plain(w) => w.write(buf),
            Compressor::Gz(w) => w.write(buf),
            Compressor::Bz2(w) => w.write(buf),
            Compressor::Xz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Compressor::Plain(w) => w.flush(),
            Compressor::Gz(w) => w.flush(),
            Compressor::Bz2(w) => w.flush(),
            Compressor::Xz(w) => w.flush(),
        }
    }
}

/// The writer the tar builder sees: compressor stack plus the
/// uncompressed-offset counter.
struct ArchiveStream {
    inner: Compressor,
    stats: Arc<StagingStats>,
}

impl Write for ArchiveStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.stats.add_tar_bytes(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming tar writer over one volume.
pub struct ArchiveWriter {
    builder: Option<tar::Builder<ArchiveStream>>,
    pending: PendingTracker,
    stats: Arc<StagingStats>,
}

impl ArchiveWriter {
    /// Build the full pipeline — tar, optional compressor, staging
    /// buffer, encrypting sink — on top of a fresh medium.
    pub fn new(
        medium: MediumFile,
        passphrase: &[u8],
        options: ArchiveOptions,
    ) -> Result<Self, ArchiveError> {
        let sink = EncryptedSink::wrap(
            medium,
            passphrase,
            SinkOptions {
                buffer_size: options.buffer_size,
                sync: options.sync,
                ..SinkOptions::default()
            },
        )?;
        let stats = Arc::new(StagingStats::default());
        let staging = StagingWriter::new(sink, options.buffer_size, Arc::clone(&stats));
        let stream = ArchiveStream {
            inner: Compressor::new(staging, options.compression),
            stats: Arc::clone(&stats),
        };
        let mut builder = tar::Builder::new(stream);
        builder.follow_symlinks(false);
        debug!(
            compression = ?options.compression,
            buffer_size = options.buffer_size,
            "archive writer ready"
        );
        Ok(Self {
            builder: Some(builder),
            pending: PendingTracker::new(),
            stats,
        })
    }

    /// Append one filesystem entry (file, directory or symlink) as the
    /// archive member `arcname`, without recursing into directories.
    ///
    /// Returns the member's 1-based sequence number. On end-of-medium
    /// the writer acknowledges whatever became durable, closes itself
    /// early and returns [`ArchiveError::MediumFull`]; it must not be
    /// used again.
    #[instrument(level = "debug", skip(self, path, arcname), fields(path = %path.display()))]
    pub fn add(&mut self, path: &Path, arcname: &Path) -> Result<u64, ArchiveError> {
        // A member is pending from the moment it is appended, even if
        // appending it exactly fills the staging buffer: purge before,
        // not after.
        self.purge_pending();
        let Some(builder) = self.builder.as_mut() else {
            return Err(ArchiveError::Closed);
        };
        trace!(pending = self.pending.len(), "appending member");
        match builder.append_path_with_name(path, arcname) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::StorageFull => {
                // The device may have accepted sectors before refusing;
                // acknowledge the new high-water mark before going dead.
                self.pending.purge(self.stats.tell());
                warn!(
                    committed = self.pending.num_committed(),
                    "end of medium while appending"
                );
                self.close_early();
                return Err(ArchiveError::MediumFull);
            }
            Err(e) => return Err(ArchiveError::Io(e)),
        }
        let record = self.pending.record(
            self.stats.fill(),
            self.stats.tell(),
            self.stats.tar_offset(),
        );
        trace!(seq = record.seq, staging_fill = record.staging_fill, "member appended");
        Ok(record.seq)
    }

    /// Promote pending members whose bytes have since reached the medium.
    pub fn purge_pending(&mut self) {
        self.pending.purge(self.stats.tell());
    }

    /// Members appended so far, durable or not.
    pub fn num_files(&self) -> u64 {
        self.pending.total_added()
    }

    /// Members known durable on this volume. Monotonic within the
    /// writer's lifetime, never exceeds [`num_files`].
    ///
    /// [`num_files`]: ArchiveWriter::num_files
    pub fn num_committed(&self) -> u64 {
        self.pending.num_committed()
    }

    /// Current fill of the tar staging buffer.
    pub fn current_staging_fill(&self) -> usize {
        self.stats.fill()
    }

    /// Uncompressed tar stream offset.
    pub fn tar_offset(&self) -> u64 {
        self.stats.tar_offset()
    }

    pub fn is_closed(&self) -> bool {
        self.builder.is_none()
    }

    /// Finish the archive: tar trailer, compressor tail, final staging
    /// flush zero-padded to the staging buffer size, sink close, final
    /// purge. Every member must come out committed; anything else means
    /// the durability accounting is broken.
    #[instrument(level = "debug", skip(self))]
    pub fn close(&mut self) -> Result<(), ArchiveError> {
        let builder = self.builder.take().ok_or(ArchiveError::Closed)?;
        let stream = builder.into_inner().map_err(ArchiveError::from_io)?;
        let staging = stream.inner.finish().map_err(ArchiveError::from_io)?;
        let final_tell = staging.finish()?;
        self.pending.purge(final_tell);
        let committed = self.pending.num_committed();
        let added = self.pending.total_added();
        debug!(committed, added, final_tell, "archive closed");
        if committed != added {
            return Err(ArchiveError::CommitMismatch { committed, added });
        }
        Ok(())
    }

    /// Abandon the archive without flushing: no tar trailer, no staged
    /// bytes, nothing further reaches the medium. The correct response
    /// to end-of-medium — the device keeps what it already accepted and
    /// no more. The writer is dead afterwards.
    pub fn close_early(&mut self) {
        if let Some(builder) = self.builder.take() {
            debug!(
                staged = self.stats.fill(),
                "closing archive early, staged bytes abandoned"
            );
            self.stats.cancel();
            // The builder's drop writes its trailer into the cancelled,
            // discarding stream; the medium is closed when the sink drops.
            drop(builder);
        }
    }
}
