//! Error types for the cryptar-core crate
//!
//! Each error type lives next to the code that raises it; this module
//! re-exports them all for callers that want a single import path.

pub use crate::archive::ArchiveError;
pub use crate::backup::BackupError;
pub use crate::catalog::CatalogError;
pub use crate::changer::ChangerError;
pub use crate::medium::MediumError;
pub use crate::scan::ScanError;
pub use crate::sink::SinkError;
