//! Fixed-size staging buffer between the tar stream and the sink.
//!
//! Tar bytes (compressed bytes when a compressor sits in front)
//! accumulate here and are pushed to the encrypting sink one whole
//! buffer at a time, so the medium only ever sees tape-block-sized
//! writes. The fill level and sink position are published through
//! [`StagingStats`] because the writer itself ends up buried under a
//! compressor and the tar builder, while the pending tracker needs to
//! read both after every member.

use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tracing::debug;

use crate::sink::{EncryptedSink, SinkError};

/// Shared view of the staging pipeline, readable from outside the
/// builder/compressor stack that owns the writer.
#[derive(Debug, Default)]
pub(crate) struct StagingStats {
    fill: AtomicUsize,
    tell: AtomicU64,
    tar_offset: AtomicU64,
    cancelled: AtomicBool,
}

impl StagingStats {
    /// Bytes currently staged and not yet handed to the sink.
    pub(crate) fn fill(&self) -> usize {
        self.fill.load(Ordering::Relaxed)
    }

    /// The sink's plaintext counter, surviving close.
    pub(crate) fn tell(&self) -> u64 {
        self.tell.load(Ordering::Relaxed)
    }

    /// Uncompressed tar stream offset.
    pub(crate) fn tar_offset(&self) -> u64 {
        self.tar_offset.load(Ordering::Relaxed)
    }

    pub(crate) fn add_tar_bytes(&self, n: u64) {
        self.tar_offset.fetch_add(n, Ordering::Relaxed);
    }

    /// Turn the staging writer into a discarding no-op. Set on the
    /// end-of-medium path so the tar trailer and compressor tail wind
    /// down without touching a medium that already refused bytes.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

pub(crate) struct StagingWriter {
    sink: Option<EncryptedSink>,
    buf: Vec<u8>,
    capacity: usize,
    stats: Arc<StagingStats>,
}

impl StagingWriter {
    pub(crate) fn new(sink: EncryptedSink, capacity: usize, stats: Arc<StagingStats>) -> Self {
        stats.tell.store(sink.tell(), Ordering::Relaxed);
        Self {
            sink: Some(sink),
            buf: Vec::with_capacity(capacity),
            capacity,
            stats,
        }
    }

    fn publish(&self) {
        self.stats.fill.store(self.buf.len(), Ordering::Relaxed);
        if let Some(sink) = &self.sink {
            self.stats.tell.store(sink.tell(), Ordering::Relaxed);
        }
    }

    /// Flush the final partial buffer zero-padded to the full staging
    /// size, then close the sink. Returns the sink's final position.
    pub(crate) fn finish(mut self) -> Result<u64, SinkError> {
        let Some(mut sink) = self.sink.take() else {
            return Ok(self.stats.tell());
        };
        if self.stats.is_cancelled() {
            debug!(discarded = self.buf.len(), "staged bytes abandoned");
            sink.close()?;
            return Ok(self.stats.tell());
        }
        if !self.buf.is_empty() {
            self.buf.resize(self.capacity, 0);
            let result = sink.write(&self.buf);
            self.buf.clear();
            self.stats.fill.store(0, Ordering::Relaxed);
            self.stats.tell.store(sink.tell(), Ordering::Relaxed);
            result?;
        }
        self.stats.tell.store(sink.tell(), Ordering::Relaxed);
        sink.close()?;
        Ok(self.stats.tell())
    }
}

impl Write for StagingWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.stats.is_cancelled() {
            // Dead writer: swallow everything.
            return Ok(data.len());
        }
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.capacity {
            let sink = self
                .sink
                .as_mut()
                .ok_or_else(|| io::Error::other("staging writer already finished"))?;
            let result = sink.write(&self.buf[..self.capacity]);
            if result.is_ok() {
                self.buf.drain(..self.capacity);
            }
            self.publish();
            result.map_err(SinkError::into_io)?;
        }
        self.publish();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Partial buffers stay staged until `finish`; flushing them early
        // would break the tape-block alignment of medium writes.
        Ok(())
    }
}
