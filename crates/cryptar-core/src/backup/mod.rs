//! Backup orchestration.
//!
//! One [`BackupDriver`] runs one logical backup: it drains the
//! restartable queue into an archive writer, and when the medium fills
//! up mid-archive it closes the writer early, asks the volume source
//! for the next volume and replays the unconfirmed tail against a
//! fresh archive. The catalogue learns about a member only once its
//! bytes are known durable, so the index never promises more than the
//! tape holds.
//!
//! The flow is an explicit three-state machine — streaming members,
//! awaiting a volume, done — with transitions driven by the add result
//! and the queue's end-of-input.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};
use zeroize::Zeroizing;

use crate::archive::{ArchiveError, ArchiveOptions, ArchiveWriter, Compression};
use crate::catalog::{Catalog, CatalogError};
use crate::changer::{ChangerError, VolumeSource};
use crate::queue::{RestartableQueue, WouldBlock};
use crate::scan::{ScanError, ScanItem};
use crate::sink::DEFAULT_BUFFER_SIZE;

/// How often the blocking queue read wakes up to check for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(200);

/// A backup run failed.
#[derive(Error, Debug)]
pub enum BackupError {
    /// The fresh volume filled up while the previous volume's
    /// unconfirmed tail was still being replayed. A volume must always
    /// be able to absorb the whole replay window; this is unrecoverable.
    #[error("end of medium while replaying the previous volume's unconfirmed tail")]
    MediumFullDuringReplay,

    /// Cancellation was requested. The queue is left restorable.
    #[error("backup cancelled")]
    Cancelled,

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Changer(#[from] ChangerError),
}

/// Configuration of one backup run.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Root directory being backed up; recorded in the catalogue.
    pub root: PathBuf,
    /// Backup level label, e.g. `full`.
    pub level: String,
    /// Passphrase bytes, no trailing newline.
    pub passphrase: Vec<u8>,
    pub compression: Compression,
    pub buffer_size: usize,
    /// fsync the medium after every tape block.
    pub sync: bool,
}

impl BackupOptions {
    pub fn new(root: impl Into<PathBuf>, passphrase: Vec<u8>) -> Self {
        Self {
            root: root.into(),
            level: "full".into(),
            passphrase,
            compression: Compression::None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sync: false,
        }
    }

    #[must_use]
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Default)]
pub struct BackupReport {
    pub backup_id: i64,
    /// Voltags in the order they were written.
    pub volumes: Vec<String>,
    /// Members confirmed durable and recorded in the catalogue.
    pub files: u64,
    /// Source bytes of successfully added members.
    pub bytes: u64,
}

enum State {
    AwaitingVolume,
    Streaming(ArchiveWriter),
    Done,
}

/// Drives one logical backup across as many volumes as it takes.
pub struct BackupDriver<V: VolumeSource> {
    queue: RestartableQueue<ScanItem>,
    volumes: V,
    catalog: Catalog,
    passphrase: Zeroizing<Vec<u8>>,
    archive_options: ArchiveOptions,
    backup_id: i64,
    partial_backup_id: i64,
    /// Catalogue row ids of dispensed-but-unconfirmed members, oldest
    /// first; mirrors the queue's unconfirmed window.
    pending_file_ids: VecDeque<i64>,
    cancel: Arc<AtomicBool>,
    report: BackupReport,
}

impl<V: VolumeSource> BackupDriver<V> {
    /// Register the backup in the catalogue and prepare to run.
    pub fn new(
        queue: RestartableQueue<ScanItem>,
        volumes: V,
        mut catalog: Catalog,
        options: BackupOptions,
    ) -> Result<Self, BackupError> {
        let backup_id = catalog.create_backup(&options.root, &options.level)?;
        info!(backup_id, root = %options.root.display(), level = %options.level, "backup registered");
        Ok(Self {
            queue,
            volumes,
            catalog,
            passphrase: Zeroizing::new(options.passphrase),
            archive_options: ArchiveOptions {
                compression: options.compression,
                buffer_size: options.buffer_size,
                sync: options.sync,
            },
            backup_id,
            partial_backup_id: 0,
            pending_file_ids: VecDeque::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            report: BackupReport {
                backup_id,
                ..BackupReport::default()
            },
        })
    }

    /// Shared flag that aborts the run at the next suspension point.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run the backup to completion, changing volumes as media fill up.
    #[instrument(skip(self), fields(backup_id = self.backup_id))]
    pub fn run(&mut self) -> Result<BackupReport, BackupError> {
        let mut state = State::AwaitingVolume;
        loop {
            state = match state {
                State::AwaitingVolume => State::Streaming(self.open_volume()?),
                State::Streaming(archive) => self.stream(archive)?,
                State::Done => {
                    self.catalog.commit()?;
                    info!(
                        files = self.report.files,
                        volumes = self.report.volumes.len(),
                        "backup complete"
                    );
                    return Ok(std::mem::take(&mut self.report));
                }
            };
        }
    }

    /// Provision the next volume and commit its partial-backup row
    /// before the first member lands on it.
    fn open_volume(&mut self) -> Result<ArchiveWriter, BackupError> {
        let volume = self.volumes.next_volume()?;
        info!(voltag = %volume.voltag, "opening volume");
        self.catalog.import_volume(&volume.voltag)?;
        self.partial_backup_id = self
            .catalog
            .create_partial_backup(self.backup_id, &volume.voltag)?;
        self.catalog.commit()?;
        self.report.volumes.push(volume.voltag);
        let archive = ArchiveWriter::new(
            volume.medium,
            &self.passphrase,
            self.archive_options.clone(),
        )?;
        Ok(archive)
    }

    /// Drain the queue into one archive. Ends in `AwaitingVolume` on
    /// end-of-medium, `Done` when the producer is exhausted.
    fn stream(&mut self, mut archive: ArchiveWriter) -> Result<State, BackupError> {
        let mut confirmed_so_far = archive.num_committed();
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                warn!("cancellation requested, abandoning current volume");
                return Err(self.abort(&mut archive, BackupError::Cancelled));
            }
            // Whether the item about to be dispensed is a replay of the
            // previous volume's tail; the flag itself clears once the
            // last replayed item goes out.
            let was_restoring = self.queue.restoring();
            let item = match self.queue.get_timeout(CANCEL_POLL) {
                Err(WouldBlock) => continue,
                Ok(None) => break,
                Ok(Some(item)) => item,
            };
            let info = match item {
                Ok(info) => info,
                Err(scan_error) => {
                    return Err(self.abort(&mut archive, scan_error.into()));
                }
            };

            // Pre-add hook: the file row exists before its member does.
            let file_id = match self.catalog.insert_file(&info) {
                Ok(id) => id,
                Err(e) => return Err(self.abort(&mut archive, e.into())),
            };
            self.pending_file_ids.push_back(file_id);
            trace!(
                file_id,
                path = %info.path.display(),
                unconfirmed = self.queue.unconfirmed(),
                "adding member"
            );

            let add_result = archive.add(&info.path, info.arcname());

            // Commit hook, regardless of how the add went: whatever the
            // add (or its failure-path purge) made durable is confirmed
            // now, against the volume it actually landed on.
            let newly = archive.num_committed() - confirmed_so_far;
            confirmed_so_far = archive.num_committed();
            self.commit_confirmed(newly as usize)?;

            match add_result {
                Ok(_) => {
                    self.report.bytes += info.size;
                }
                Err(ArchiveError::MediumFull) => {
                    if was_restoring {
                        return Err(BackupError::MediumFullDuringReplay);
                    }
                    debug!(
                        committed = confirmed_so_far,
                        unconfirmed = self.queue.unconfirmed(),
                        "volume full, replaying tail on the next one"
                    );
                    self.queue.begin_restore();
                    // Unconfirmed members will be re-inserted on replay.
                    self.pending_file_ids.clear();
                    return Ok(State::AwaitingVolume);
                }
                Err(e) => {
                    return Err(self.abort(&mut archive, e.into()));
                }
            }
        }

        // Producer exhausted: the trailer flush commits the rest.
        if let Err(e) = archive.close() {
            self.queue.begin_restore();
            self.pending_file_ids.clear();
            return Err(e.into());
        }
        let newly = archive.num_committed() - confirmed_so_far;
        self.commit_confirmed(newly as usize)?;
        Ok(State::Done)
    }

    /// Common non-recoverable exit: leave the queue restorable so a
    /// retry can replay, and make sure nothing further is forced onto
    /// the medium.
    fn abort(&mut self, archive: &mut ArchiveWriter, error: BackupError) -> BackupError {
        self.queue.begin_restore();
        self.pending_file_ids.clear();
        archive.close_early();
        error
    }

    /// Confirm the `newly` oldest unconfirmed members and record them
    /// against the current partial backup.
    fn commit_confirmed(&mut self, newly: usize) -> Result<(), BackupError> {
        for item in self.queue.confirm(newly) {
            let Some(file_id) = self.pending_file_ids.pop_front() else {
                // Every confirmed item went through the pre-add hook, so
                // an id must be queued; anything else is a bug upstream.
                debug_assert!(false, "confirmed member without a file id");
                continue;
            };
            if let Ok(info) = &item {
                trace!(file_id, path = %info.path.display(), "member durable");
            }
            self.catalog.record_backed_up(file_id, self.partial_backup_id)?;
            self.report.files += 1;
        }
        Ok(())
    }
}
