//! Filesystem walking and per-file metadata capture.
//!
//! The scanner is the producer side of the backup: it walks the root on
//! its own thread and feeds [`FileInfo`] items into the bounded channel
//! the [`RestartableQueue`](crate::queue::RestartableQueue) wraps. Walk
//! errors travel through the channel as values so the consumer decides
//! what aborts the backup; dropping the sender is the end-of-walk
//! sentinel.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// Read granularity for checksumming: 4096 hash blocks at a time.
const CHECKSUM_CHUNK: usize = 4096 * 64;

/// A filesystem entry could not be captured.
///
/// Clonable (via `Arc`) because scan items live in the restartable
/// queue and may be dispensed more than once.
#[derive(Error, Debug, Clone)]
#[error("failed to scan {path}: {source}")]
pub struct ScanError {
    pub path: PathBuf,
    #[source]
    pub source: Arc<io::Error>,
}

impl ScanError {
    fn new(path: &Path, source: io::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }
}

/// What the walker emits: a captured entry or the error that prevented
/// capturing it.
pub type ScanItem = Result<FileInfo, ScanError>;

/// Stat snapshot of one filesystem entry, as recorded in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: PathBuf,
    pub ino: u64,
    pub mode: u32,
    pub dev: u64,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// SHA-1 of the contents; regular files only.
    pub sha1: Option<[u8; 20]>,
    pub is_dir: bool,
}

impl FileInfo {
    /// Capture `path` without following symlinks. Regular files are
    /// checksummed in streaming fashion.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        use std::os::unix::fs::MetadataExt;

        let meta = fs::symlink_metadata(path)?;
        let sha1 = if meta.is_file() {
            let digest = checksum(path)?;
            trace!(path = %path.display(), sha1 = %hex::encode(digest), "checksummed");
            Some(digest)
        } else {
            None
        };
        Ok(Self {
            path: path.to_path_buf(),
            ino: meta.ino(),
            mode: meta.mode(),
            dev: meta.dev(),
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.size(),
            atime: meta.atime(),
            mtime: meta.mtime(),
            ctime: meta.ctime(),
            sha1,
            is_dir: meta.is_dir(),
        })
    }

    /// The name this entry gets inside the archive: the path with any
    /// leading `/` stripped, the way GNU tar stores absolute paths.
    pub fn arcname(&self) -> &Path {
        self.path.strip_prefix("/").unwrap_or(&self.path)
    }
}

/// Streaming SHA-1 of a file's contents.
pub fn checksum(path: &Path) -> io::Result<[u8; 20]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; CHECKSUM_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

type FilterFn = Box<dyn FnMut(&FileInfo) -> bool + Send>;

/// Producer that walks a directory tree and feeds the work channel.
pub struct Scanner {
    root: PathBuf,
    filter: Option<FilterFn>,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            filter: None,
        }
    }

    /// Drop entries the predicate rejects before they reach the queue.
    #[must_use]
    pub fn with_filter(mut self, filter: impl FnMut(&FileInfo) -> bool + Send + 'static) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Walk on a background thread, sending each entry (or the error it
    /// produced) into `tx`. The walk is depth-first in file-name order,
    /// the root itself excluded, so archive layout is deterministic.
    /// The sender is dropped when the walk ends; that disconnect is the
    /// consumer's end-of-input sentinel.
    pub fn spawn(self, tx: Sender<ScanItem>) -> io::Result<JoinHandle<()>> {
        let Scanner { root, mut filter } = self;
        thread::Builder::new()
            .name("cryptar-scan".into())
            .spawn(move || {
                debug!(root = %root.display(), "scan started");
                let mut sent = 0u64;
                for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
                    let item = match entry {
                        Ok(entry) => FileInfo::from_path(entry.path())
                            .map_err(|e| ScanError::new(entry.path(), e)),
                        Err(e) => {
                            let path = e
                                .path()
                                .map_or_else(|| root.clone(), Path::to_path_buf);
                            warn!(path = %path.display(), error = %e, "walk error");
                            Err(ScanError::new(&path, e.into()))
                        }
                    };
                    if let (Ok(info), Some(filter)) = (&item, filter.as_mut())
                        && !filter(info)
                    {
                        trace!(path = %info.path.display(), "filtered out");
                        continue;
                    }
                    if tx.send(item).is_err() {
                        // Consumer hung up; stop walking.
                        return;
                    }
                    sent += 1;
                }
                debug!(sent, "scan finished");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use tempfile::TempDir;

    fn drain(rx: crossbeam_channel::Receiver<ScanItem>) -> Vec<FileInfo> {
        rx.iter().map(|item| item.unwrap()).collect()
    }

    #[test]
    fn walks_in_sorted_order_without_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        fs::write(dir.path().join("a.txt"), b"aa").unwrap();
        fs::write(dir.path().join("sub/c.txt"), b"cc").unwrap();

        let (tx, rx) = bounded(16);
        let handle = Scanner::new(dir.path()).spawn(tx).unwrap();
        let infos = drain(rx);
        handle.join().unwrap();

        let names: Vec<_> = infos
            .iter()
            .map(|i| i.path.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("a.txt"),
                PathBuf::from("b.txt"),
                PathBuf::from("sub"),
                PathBuf::from("sub/c.txt"),
            ]
        );
        assert!(infos[2].is_dir);
        assert!(infos[2].sha1.is_none());
    }

    #[test]
    fn regular_files_carry_a_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"abc").unwrap();
        let info = FileInfo::from_path(&path).unwrap();
        // SHA-1("abc"), the classic FIPS 180 vector.
        assert_eq!(
            info.sha1.unwrap()[..],
            hex_literal::hex!("a9993e364706816aba3e25717850c26c9cd0d89d")[..]
        );
        assert_eq!(info.size, 3);
        assert!(!info.is_dir);
    }

    #[test]
    fn filter_drops_entries() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep"), b"k").unwrap();
        fs::write(dir.path().join("skip"), b"s").unwrap();

        let (tx, rx) = bounded(16);
        Scanner::new(dir.path())
            .with_filter(|info| !info.path.ends_with("skip"))
            .spawn(tx)
            .unwrap();
        let infos = drain(rx);
        assert_eq!(infos.len(), 1);
        assert!(infos[0].path.ends_with("keep"));
    }

    #[test]
    fn arcname_strips_leading_slash() {
        let info = FileInfo {
            path: PathBuf::from("/data/file"),
            ino: 0,
            mode: 0,
            dev: 0,
            nlink: 0,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            sha1: None,
            is_dir: false,
        };
        assert_eq!(info.arcname(), Path::new("data/file"));
    }
}
