//! Media changer control and volume provisioning.
//!
//! Talks to a SCSI media changer through the `chio(8)` utility: parses
//! `chio status -a` output into a slot map, decides which cartridges
//! are importable, and moves media between slots and drives. The
//! [`VolumeSource`] trait is what the backup driver actually consumes —
//! "give me a fresh volume" — with a changer-backed implementation for
//! real libraries and a single-file implementation matching the
//! original tool's behavior on plain files.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::medium::{MediumError, MediumFile};

/// Changer interaction failure.
#[derive(Error, Debug)]
pub enum ChangerError {
    #[error("failed to run chio: {0}")]
    Spawn(#[source] io::Error),

    #[error("chio exited with {status}: {stderr}")]
    ChioFailed { status: String, stderr: String },

    #[error("line {line:?} is not a valid chio status line")]
    BadStatusLine { line: String },

    /// A voltag was reported in a slot the changer does not mark FULL.
    #[error("volume {voltag:?} reported in {slot}, but slot is not marked FULL")]
    GhostVolume { voltag: String, slot: String },

    #[error(transparent)]
    Medium(#[from] MediumError),
}

/// One element ("slot 4", "drive 0") of the changer's status report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotStatus {
    /// Status flags as reported, e.g. `FULL`, `ACCESS`.
    pub status: Vec<String>,
    /// Barcode label of the cartridge, if one is present.
    pub voltag: Option<String>,
    pub source: Option<String>,
}

impl SlotStatus {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.status.iter().any(|s| s == flag)
    }
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?P<name>[a-zA-Z]+\s[0-9]+):(\s+<(?P<status>\S+)>)?").expect("valid regex"))
}

fn voltag_re() -> &'static Regex {
    // The explicit \s keeps this from matching the avoltag field.
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\svoltag:\s<(?P<voltag>\S+):\S*?>").expect("valid regex"))
}

fn source_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"source:\s<(?P<source>[^>]+)>").expect("valid regex"))
}

/// Parse one line of `chio status -a` output.
fn parse_status_line(line: &str) -> Result<(String, SlotStatus), ChangerError> {
    let caps = name_re()
        .captures(line)
        .ok_or_else(|| ChangerError::BadStatusLine { line: line.into() })?;
    let name = caps["name"].to_string();
    let mut slot = SlotStatus::default();
    if let Some(status) = caps.name("status") {
        slot.status = status.as_str().split(',').map(str::to_string).collect();
    }
    if let Some(caps) = voltag_re().captures(line) {
        slot.voltag = Some(caps["voltag"].to_string());
    }
    if let Some(caps) = source_re().captures(line) {
        slot.source = Some(caps["source"].to_string());
    }
    Ok((name, slot))
}

/// Parse full `chio status -a` output into an element map.
pub fn parse_status(output: &str) -> Result<BTreeMap<String, SlotStatus>, ChangerError> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_status_line)
        .collect()
}

fn run_chio(device: Option<&str>, args: &[&str]) -> Result<String, ChangerError> {
    let mut command = Command::new("chio");
    if let Some(device) = device {
        command.args(["-f", device]);
    }
    command.args(args);
    debug!(?command, "running chio");
    let output = command.output().map_err(ChangerError::Spawn)?;
    if !output.status.success() {
        return Err(ChangerError::ChioFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Query the changer's element status.
pub fn status(device: Option<&str>) -> Result<BTreeMap<String, SlotStatus>, ChangerError> {
    let stdout = run_chio(device, &["status", "-a"])?;
    parse_status(&stdout)
}

/// Move the cartridge in `slot` into `drive`.
pub fn load(device: Option<&str>, slot: &str, drive: &str) -> Result<(), ChangerError> {
    info!(slot, drive, "loading volume");
    run_chio(device, &["move", slot, drive]).map(|_| ())
}

/// Move the cartridge in `drive` back to `slot`.
pub fn unload(device: Option<&str>, drive: &str, slot: &str) -> Result<(), ChangerError> {
    info!(drive, slot, "unloading volume");
    run_chio(device, &["move", drive, slot]).map(|_| ())
}

/// Cleaning cartridges carry this voltag prefix and are never backup
/// targets.
pub const CLEANING_PREFIX: &str = "CLN";

/// Voltags of cartridges that are present, accessible and not cleaning
/// media, keyed off a parsed status map. A voltag in a slot not marked
/// FULL is an inconsistency worth failing loudly over.
pub fn importable_volumes(
    status: &BTreeMap<String, SlotStatus>,
    exclude_prefix: &str,
) -> Result<Vec<String>, ChangerError> {
    let mut voltags = Vec::new();
    for (slot, info) in status {
        let Some(voltag) = &info.voltag else { continue };
        if !info.has_flag("FULL") {
            return Err(ChangerError::GhostVolume {
                voltag: voltag.clone(),
                slot: slot.clone(),
            });
        }
        if info.has_flag("ACCESS") && !voltag.starts_with(exclude_prefix) {
            voltags.push(voltag.clone());
        }
    }
    Ok(voltags)
}

/// A freshly provisioned volume: its label plus an open medium handle.
pub struct Volume {
    pub voltag: String,
    pub medium: MediumFile,
}

/// Source of fresh volumes for the backup driver. Implementations block
/// as long as it takes to make the next volume writable (tape load,
/// operator intervention); the driver has no timeout of its own.
pub trait VolumeSource {
    fn next_volume(&mut self) -> Result<Volume, ChangerError>;
}

/// Volume source for plain files: every "volume" reopens (and
/// truncates) the same output path under a fresh generated label.
pub struct FileVolumes {
    path: PathBuf,
}

impl FileVolumes {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VolumeSource for FileVolumes {
    fn next_volume(&mut self) -> Result<Volume, ChangerError> {
        let voltag = Uuid::new_v4().simple().to_string();
        info!(voltag = %voltag, path = %self.path.display(), "using file volume");
        Ok(Volume {
            voltag,
            medium: MediumFile::create(&self.path)?,
        })
    }
}

/// Volume source backed by a real changer: picks the next importable
/// cartridge, loads it into the drive and opens the drive's device node.
pub struct ChangerVolumes {
    device: Option<String>,
    drive: String,
    drive_path: PathBuf,
    used: Vec<String>,
    loaded_slot: Option<String>,
}

impl ChangerVolumes {
    pub fn new(device: Option<String>, drive: impl Into<String>, drive_path: impl Into<PathBuf>) -> Self {
        Self {
            device,
            drive: drive.into(),
            drive_path: drive_path.into(),
            used: Vec::new(),
            loaded_slot: None,
        }
    }
}

impl VolumeSource for ChangerVolumes {
    fn next_volume(&mut self) -> Result<Volume, ChangerError> {
        let status = status(self.device.as_deref())?;
        if let Some(slot) = self.loaded_slot.take() {
            unload(self.device.as_deref(), &self.drive, &slot)?;
        }
        let (slot, voltag) = status
            .iter()
            .find_map(|(slot, info)| {
                let voltag = info.voltag.as_ref()?;
                (info.has_flag("FULL")
                    && info.has_flag("ACCESS")
                    && !voltag.starts_with(CLEANING_PREFIX)
                    && !self.used.contains(voltag))
                .then(|| (slot.clone(), voltag.clone()))
            })
            .ok_or_else(|| ChangerError::ChioFailed {
                status: "no importable volume left".into(),
                stderr: String::new(),
            })?;
        load(self.device.as_deref(), &slot, &self.drive)?;
        self.loaded_slot = Some(slot);
        self.used.push(voltag.clone());
        Ok(Volume {
            voltag,
            medium: MediumFile::create(&self.drive_path)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_OUTPUT: &str = "\
picker 0:
slot 0: <ACCESS,FULL> voltag: <VOL001:0> avoltag: <AVOL:1>
slot 1: <ACCESS,FULL> voltag: <CLN001:0>
slot 2: <ACCESS>
drive 0: <ACCESS,FULL> voltag: <VOL002:0> source: <slot 5>
";

    #[test]
    fn parses_elements_flags_and_voltags() {
        let status = parse_status(STATUS_OUTPUT).unwrap();
        assert_eq!(status.len(), 5);

        let slot0 = &status["slot 0"];
        assert_eq!(slot0.status, vec!["ACCESS", "FULL"]);
        assert_eq!(slot0.voltag.as_deref(), Some("VOL001"));
        assert_eq!(slot0.source, None);

        let picker = &status["picker 0"];
        assert!(picker.status.is_empty());
        assert_eq!(picker.voltag, None);

        let drive = &status["drive 0"];
        assert_eq!(drive.source.as_deref(), Some("slot 5"));
    }

    #[test]
    fn voltag_regex_ignores_avoltag() {
        let line = "slot 3: <ACCESS,FULL> avoltag: <SHADOW:1>";
        let (_, slot) = parse_status_line(line).unwrap();
        assert_eq!(slot.voltag, None);
    }

    #[test]
    fn invalid_line_is_rejected() {
        assert!(matches!(
            parse_status("not a status line").unwrap_err(),
            ChangerError::BadStatusLine { .. }
        ));
    }

    #[test]
    fn importable_excludes_cleaning_and_inaccessible() {
        let status = parse_status(STATUS_OUTPUT).unwrap();
        let volumes = importable_volumes(&status, CLEANING_PREFIX).unwrap();
        assert_eq!(volumes, vec!["VOL002", "VOL001"]);
    }

    #[test]
    fn voltag_in_non_full_slot_is_an_error() {
        let status = parse_status("slot 0: <ACCESS> voltag: <VOL001:0>\n").unwrap();
        assert!(matches!(
            importable_volumes(&status, CLEANING_PREFIX).unwrap_err(),
            ChangerError::GhostVolume { .. }
        ));
    }

    #[test]
    fn file_volumes_generate_fresh_voltags() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut source = FileVolumes::new(dir.path().join("volume.aes"));
        let first = source.next_volume().unwrap();
        let second = source.next_volume().unwrap();
        assert_ne!(first.voltag, second.voltag);
        assert_eq!(first.voltag.len(), 32);
    }
}
