#![deny(unsafe_code)]

//! `cryptar` — unattended encrypted tar backups onto sequential media.
//!
//! Walks a directory tree, streams it as an aespipe-compatible
//! encrypted tar archive onto the target file or device, and records
//! durable members in a sqlite catalogue. When the medium fills up the
//! backup continues on the next volume.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use crossbeam_channel::bounded;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use cryptar_core::backup::{BackupDriver, BackupOptions};
use cryptar_core::catalog::Catalog;
use cryptar_core::changer::FileVolumes;
use cryptar_core::queue::RestartableQueue;
use cryptar_core::scan::Scanner;
use cryptar_core::Compression;

/// Items buffered between the filesystem walker and the write pipeline.
const QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum CompressionArg {
    /// No compression.
    #[default]
    None,
    /// gzip.
    Gz,
    /// bzip2.
    Bz2,
    /// xz.
    Xz,
}

impl From<CompressionArg> for Compression {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::None => Compression::None,
            CompressionArg::Gz => Compression::Gz,
            CompressionArg::Bz2 => Compression::Bz2,
            CompressionArg::Xz => Compression::Xz,
        }
    }
}

/// Encrypted tar backups for tape and tape-like media
#[derive(Parser)]
#[command(name = "cryptar")]
#[command(author, version)]
#[command(after_help = "EXAMPLES:
    # Back up /srv/data onto a tape drive
    cryptar /srv/data -f /dev/nst0 -P /etc/cryptar/passphrase

    # Back up into a plain file, gzip-compressed, with a log
    cryptar /srv/data -f backup.tar.aes -P pw.txt -z gz -vv --logfile backup.log

    # Restore needs nothing but stock tools
    aespipe -d -P pw.txt < backup.tar.aes | tar -x
")]
struct Cli {
    /// Directory to back up (absolute path)
    directory: PathBuf,

    /// Output archive file or device path
    #[arg(short, long)]
    file: PathBuf,

    /// File whose first line is the passphrase (no trailing newline is
    /// used; aespipe wants at least 20 characters)
    #[arg(short = 'P', long)]
    passphrase_file: PathBuf,

    /// sqlite catalogue recording what landed on which volume
    #[arg(long, default_value = "catalogue.sqlite")]
    database_file: PathBuf,

    /// Streaming compression applied inside the encryption
    #[arg(short = 'z', long, value_enum, default_value_t = CompressionArg::None)]
    compression: CompressionArg,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    logfile: Option<PathBuf>,
}

fn init_tracing(cli: &Cli) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &cli.logfile {
        Some(path) => {
            let directory = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .context("--logfile needs a file name")?;
            let appender = tracing_appender::rolling::never(
                directory.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            builder.with_writer(writer).with_ansi(false).init();
            Ok(Some(guard))
        }
        None => {
            builder.with_writer(std::io::stderr).init();
            Ok(None)
        }
    }
}

/// First line of the passphrase file, trailing whitespace stripped.
fn read_passphrase(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let raw = Zeroizing::new(
        fs::read(path).with_context(|| format!("reading passphrase file {}", path.display()))?,
    );
    let first_line = raw.split(|&b| b == b'\n').next().unwrap_or(&[]);
    let trimmed = first_line
        .strip_suffix(b"\r")
        .unwrap_or(first_line)
        .to_vec();
    if trimmed.is_empty() {
        bail!("passphrase file {} is empty", path.display());
    }
    Ok(Zeroizing::new(trimmed))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli)?;

    if !cli.directory.is_absolute() {
        bail!(
            "backup directory {} has to be given as an absolute path",
            cli.directory.display()
        );
    }
    if !cli.directory.is_dir() {
        bail!("backup directory {} does not exist", cli.directory.display());
    }

    let passphrase = read_passphrase(&cli.passphrase_file)?;
    info!(directory = %cli.directory.display(), file = %cli.file.display(), "backing up");

    let catalog = Catalog::open(&cli.database_file).context("opening catalogue")?;

    let (tx, rx) = bounded(QUEUE_DEPTH);
    let scanner = Scanner::new(&cli.directory)
        .spawn(tx)
        .context("starting filesystem scan")?;
    let queue = RestartableQueue::new(rx);

    let options = BackupOptions::new(&cli.directory, passphrase.to_vec())
        .with_compression(cli.compression.into());
    let mut driver = BackupDriver::new(queue, FileVolumes::new(&cli.file), catalog, options)
        .context("registering backup")?;

    let cancel = driver.cancel_token();
    ctrlc::set_handler(move || {
        cancel.store(true, Ordering::Relaxed);
    })
    .context("installing signal handler")?;

    let report = driver.run().context("backup failed")?;
    debug!("waiting for the scanner thread");
    let _ = scanner.join();

    println!(
        "Done: {} files ({} bytes) on {} volume(s), backup #{}",
        report.files,
        report.bytes,
        report.volumes.len(),
        report.backup_id
    );
    Ok(())
}
