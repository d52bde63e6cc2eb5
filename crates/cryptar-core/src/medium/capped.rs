//! In-memory medium with a byte capacity.
//!
//! Stands in for a tape drive in tests: it either raises `ENOSPC` or
//! accepts zero bytes once a write would push it past its capacity,
//! which are the two ways real drivers signal end-of-tape. A write that
//! would overflow is rejected wholesale; nothing is partially accepted,
//! matching drives that fail the block that straddles the physical end.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// How the medium signals that it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Fail the write with an `ENOSPC`-equivalent error.
    Enospc,
    /// Complete the write having accepted zero bytes.
    WriteZero,
}

/// Read-side handle onto a [`CappedMedium`]'s accepted bytes.
///
/// Stays valid after the medium itself has been closed and dropped, so
/// tests can inspect what actually landed "on tape".
#[derive(Clone)]
pub struct MediumContents(Arc<Mutex<Vec<u8>>>);

impl MediumContents {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory capacity-limited write sink.
pub struct CappedMedium {
    data: Arc<Mutex<Vec<u8>>>,
    capacity: Option<usize>,
    mode: FailureMode,
}

impl CappedMedium {
    /// A medium that never fills up.
    pub fn unbounded() -> (Self, MediumContents) {
        let data = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                data: Arc::clone(&data),
                capacity: None,
                mode: FailureMode::Enospc,
            },
            MediumContents(data),
        )
    }

    /// A medium holding at most `capacity` bytes, failing per `mode`.
    pub fn with_capacity(capacity: usize, mode: FailureMode) -> (Self, MediumContents) {
        let data = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                data: Arc::clone(&data),
                capacity: Some(capacity),
                mode,
            },
            MediumContents(data),
        )
    }
}

impl Write for CappedMedium {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(capacity) = self.capacity
            && data.len() + buf.len() > capacity
        {
            return match self.mode {
                FailureMode::Enospc => Err(io::Error::new(
                    io::ErrorKind::StorageFull,
                    "capped medium is full",
                )),
                FailureMode::WriteZero => Ok(0),
            };
        }
        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
