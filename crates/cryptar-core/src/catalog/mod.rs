//! The backup catalogue.
//!
//! A sqlite database recording which files are durably present on which
//! volume. The connection runs inside an always-open transaction:
//! inserts accumulate and become durable only at [`Catalog::commit`],
//! which the driver calls strictly after the corresponding member bytes
//! are on the medium. A crash loses uncommitted rows, never invents
//! them — catalogue truth may lag tape truth but never runs ahead of it.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info};

use crate::scan::FileInfo;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS files (
    id      INTEGER,
    path    TEXT NOT NULL,
    st_ino  INTEGER NOT NULL,
    sha1    BLOB,
    is_dir  INTEGER,
    st_mode INTEGER,
    st_dev  INTEGER,
    st_nlink INTEGER,
    st_uid  INTEGER,
    st_gid  INTEGER,
    st_size INTEGER,
    st_atime INTEGER,
    st_mtime INTEGER,
    st_ctime INTEGER,
    PRIMARY KEY(id),
    UNIQUE(path, st_ino, sha1)
);
CREATE INDEX IF NOT EXISTS file_index ON files (sha1, path, st_ino);
CREATE TABLE IF NOT EXISTS volumes (
    voltag  TEXT,
    full    INTEGER DEFAULT 0,
    error   INTEGER DEFAULT 0,
    access  INTEGER DEFAULT 1,
    vol_bytes   INTEGER DEFAULT 0,
    num_tape_files  INTEGER DEFAULT 0,
    PRIMARY KEY(voltag)
);
CREATE TABLE IF NOT EXISTS backup (
    id  INTEGER PRIMARY KEY,
    path    TEXT NOT NULL,
    absolute_path   TEXT,
    level   TEXT,
    timestamp   INTEGER
);
CREATE TABLE IF NOT EXISTS partial_backup (
    id  INTEGER PRIMARY KEY,
    parent_id   INTEGER NOT NULL,
    volume  TEXT NOT NULL,
    tape_file_index INTEGER,
    num_files   INTEGER,
    num_bytes   INTEGER,
    timestamp   INTEGER,
    timestamp_completed INTEGER,
    FOREIGN KEY(parent_id) REFERENCES backup(id)
);
CREATE TABLE IF NOT EXISTS backed_up_files (
    file_id INTEGER NOT NULL,
    partial_backup_id   INTEGER NOT NULL,
    FOREIGN KEY(partial_backup_id) REFERENCES partial_backup(id),
    FOREIGN KEY(file_id) REFERENCES files(id),
    PRIMARY KEY(file_id, partial_backup_id)
);
";

/// Catalogue access failure.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalogue error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A file row that was just inserted-or-ignored cannot be found.
    /// Indicates concurrent mutation of the catalogue, which this
    /// single-writer design does not support.
    #[error("file row vanished for {path}")]
    MissingFileRow { path: String },
}

/// Transactional index of backups, volumes and backed-up files.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Open (creating tables as needed) and begin the first transaction.
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        info!(path = %path.display(), "opening catalogue");
        Self::from_connection(Connection::open(path)?)
    }

    /// In-memory catalogue; used by tests.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, CatalogError> {
        conn.execute_batch(SCHEMA)?;
        conn.execute_batch("BEGIN")?;
        Ok(Self { conn })
    }

    /// Make everything since the last commit durable and start the next
    /// transaction.
    pub fn commit(&mut self) -> Result<(), CatalogError> {
        debug!("committing catalogue transaction");
        self.conn.execute_batch("COMMIT; BEGIN")?;
        Ok(())
    }

    /// Insert the file if its `(path, st_ino, sha1)` identity is new,
    /// and return the surviving row's id either way.
    ///
    /// Metadata-only changes (an atime bump, say) do not create a new
    /// row: the identity triple is what ties catalogue rows to archive
    /// members.
    pub fn insert_file(&mut self, info: &FileInfo) -> Result<i64, CatalogError> {
        let path = info.path.to_string_lossy().into_owned();
        let sha1 = info.sha1.as_ref().map(|d| d.to_vec());
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO files
             (path, st_ino, sha1, is_dir, st_mode, st_dev, st_nlink, st_uid, st_gid,
              st_size, st_atime, st_mtime, st_ctime)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                path,
                info.ino as i64,
                sha1,
                info.is_dir,
                info.mode,
                info.dev as i64,
                info.nlink as i64,
                info.uid,
                info.gid,
                info.size as i64,
                info.atime,
                info.mtime,
                info.ctime,
            ],
        )?;
        if inserted > 0 {
            return Ok(self.conn.last_insert_rowid());
        }
        self.conn
            .query_row(
                "SELECT id FROM files WHERE path = ?1 AND st_ino = ?2 AND sha1 IS ?3",
                params![path, info.ino as i64, sha1],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(CatalogError::MissingFileRow { path })
    }

    /// Start a new backup run over `root`.
    pub fn create_backup(&mut self, root: &Path, level: &str) -> Result<i64, CatalogError> {
        let root = root.to_string_lossy().into_owned();
        self.conn.execute(
            "INSERT INTO backup (path, absolute_path, level, timestamp)
             VALUES (?1, ?2, ?3, strftime('%s', 'now'))",
            params![root, root, level],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Start the partial backup that lands on `voltag`.
    pub fn create_partial_backup(
        &mut self,
        backup_id: i64,
        voltag: &str,
    ) -> Result<i64, CatalogError> {
        self.conn.execute(
            "INSERT INTO partial_backup (parent_id, volume, timestamp)
             VALUES (?1, ?2, strftime('%s', 'now'))",
            params![backup_id, voltag],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Record that `file_id` is durable within `partial_backup_id`.
    pub fn record_backed_up(
        &mut self,
        file_id: i64,
        partial_backup_id: i64,
    ) -> Result<(), CatalogError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO backed_up_files (file_id, partial_backup_id)
             VALUES (?1, ?2)",
            params![file_id, partial_backup_id],
        )?;
        Ok(())
    }

    /// Register a volume discovered in the changer.
    pub fn import_volume(&mut self, voltag: &str) -> Result<(), CatalogError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO volumes (voltag) VALUES (?1)",
            params![voltag],
        )?;
        Ok(())
    }

    /// File ids recorded durable for one partial backup, in insertion
    /// order.
    pub fn backed_up_files(&self, partial_backup_id: i64) -> Result<Vec<i64>, CatalogError> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id FROM backed_up_files WHERE partial_backup_id = ?1 ORDER BY rowid",
        )?;
        let ids = stmt
            .query_map(params![partial_backup_id], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Total distinct files recorded durable for one backup run.
    pub fn backed_up_count(&self, backup_id: i64) -> Result<i64, CatalogError> {
        let count = self.conn.query_row(
            "SELECT COUNT(DISTINCT b.file_id)
             FROM backed_up_files b
             JOIN partial_backup p ON p.id = b.partial_backup_id
             WHERE p.parent_id = ?1",
            params![backup_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl Drop for Catalog {
    fn drop(&mut self) {
        // Uncommitted work is deliberately rolled back: the catalogue
        // must never claim more than the tape holds.
        let _ = self.conn.execute_batch("ROLLBACK");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn info(path: &str, ino: u64) -> FileInfo {
        FileInfo {
            path: PathBuf::from(path),
            ino,
            mode: 0o100644,
            dev: 1,
            nlink: 1,
            uid: 1000,
            gid: 1000,
            size: 42,
            atime: 1_700_000_000,
            mtime: 1_700_000_000,
            ctime: 1_700_000_000,
            sha1: Some([7u8; 20]),
            is_dir: false,
        }
    }

    #[test]
    fn insert_file_is_idempotent_on_identity() {
        let mut catalog = Catalog::open_in_memory().unwrap();
        let first = catalog.insert_file(&info("/data/a", 10)).unwrap();
        // Same identity, changed metadata: same row.
        let mut changed = info("/data/a", 10);
        changed.atime += 5;
        let second = catalog.insert_file(&changed).unwrap();
        assert_eq!(first, second);
        // Different inode: new row.
        let third = catalog.insert_file(&info("/data/a", 11)).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn directories_have_null_sha1() {
        let mut catalog = Catalog::open_in_memory().unwrap();
        let mut dir = info("/data/dir", 20);
        dir.sha1 = None;
        dir.is_dir = true;
        let first = catalog.insert_file(&dir).unwrap();
        let second = catalog.insert_file(&dir).unwrap();
        // NULL-safe identity comparison: still the same row.
        assert_eq!(first, second);
    }

    #[test]
    fn backup_hierarchy_round_trip() {
        let mut catalog = Catalog::open_in_memory().unwrap();
        let backup = catalog.create_backup(Path::new("/data"), "full").unwrap();
        let partial = catalog.create_partial_backup(backup, "VOL001").unwrap();
        let file = catalog.insert_file(&info("/data/a", 1)).unwrap();
        catalog.record_backed_up(file, partial).unwrap();
        catalog.record_backed_up(file, partial).unwrap(); // replace, not duplicate
        catalog.commit().unwrap();

        assert_eq!(catalog.backed_up_files(partial).unwrap(), vec![file]);
        assert_eq!(catalog.backed_up_count(backup).unwrap(), 1);
    }

    #[test]
    fn uncommitted_rows_roll_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("catalogue.sqlite");
        let backup;
        {
            let mut catalog = Catalog::open(&path).unwrap();
            backup = catalog.create_backup(Path::new("/data"), "full").unwrap();
            catalog.commit().unwrap();
            let partial = catalog.create_partial_backup(backup, "VOL001").unwrap();
            let file = catalog.insert_file(&info("/data/a", 1)).unwrap();
            catalog.record_backed_up(file, partial).unwrap();
            // No commit: dropped on the floor.
        }
        let catalog = Catalog::open(&path).unwrap();
        assert_eq!(catalog.backed_up_count(backup).unwrap(), 0);
    }

    #[test]
    fn import_volume_is_idempotent() {
        let mut catalog = Catalog::open_in_memory().unwrap();
        catalog.import_volume("VOL001").unwrap();
        catalog.import_volume("VOL001").unwrap();
        let count: i64 = catalog
            .conn
            .query_row("SELECT COUNT(*) FROM volumes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
