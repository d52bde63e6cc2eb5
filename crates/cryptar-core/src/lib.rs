//! aespipe-compatible encrypted tar streaming onto sequential media.
//!
//! The write path couples three concerns: sector-indexed AES-128-CBC
//! encryption that `aespipe -d` can undo in single-key mode, buffered tar
//! emission over a medium that may fill up mid-archive, and a restartable
//! work queue so that a backup spans volumes without re-walking the
//! filesystem. A sqlite catalogue records exactly the members that are
//! durable on each volume.
//!
//! Recovery needs nothing but stock tools:
//!
//! ```text
//! aespipe -d -P passphrase.txt < volume.aes | tar -x
//! ```

pub mod archive;
pub mod backup;
pub mod catalog;
pub mod changer;
pub mod crypto;
pub mod error;
pub mod medium;
pub mod queue;
pub mod scan;
pub mod sink;

pub use archive::{ArchiveOptions, ArchiveWriter, Compression};
pub use backup::{BackupDriver, BackupOptions, BackupReport};
pub use queue::RestartableQueue;
pub use sink::{EncryptedSink, SinkOptions};
