//! Calibration file persistence.
//!
//! The calibration document is kept next to the settings in the config
//! directory unless `--calibration` points somewhere else:
//!
//! `~/.config/armctl/calibration.json`
//!
//! Files written by the earlier Python controller
//! (`{"<name>": {"motor_id": 1, "min_position": .., "max_position": ..}}`)
//! load transparently; they are rewritten in the current layout on the next save.

use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use armctl_core::{ArmError, CalibrationStore, LoadReport};

use crate::config::get_project_dirs;

/// Errors reading or writing files
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Not found: {0}")]
    NotFound(PathBuf),

    #[error("Already exists: {0}")]
    Exists(PathBuf),

    #[error("Invalid file name: {0}")]
    InvalidName(String),

    #[error("No home directory to keep configuration and data in")]
    NoProjectDirs,

    #[error(transparent)]
    Arm(#[from] ArmError),
}

impl StorageError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn json(path: &Path, source: serde_json::Error) -> Self {
        StorageError::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Default calibration file location
pub fn default_calibration_path() -> Result<PathBuf, StorageError> {
    let mut path = get_project_dirs()?.config_dir().to_owned();
    path.push("calibration.json");
    Ok(path)
}

/// The calibration document on disk
#[derive(Debug, Clone)]
pub struct CalibrationFile {
    path: PathBuf,
}

impl CalibrationFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge the file into `store`. A missing file is not an error: the
    /// store simply stays uncalibrated.
    pub fn load_into(&self, store: &mut CalibrationStore) -> Result<LoadReport, StorageError> {
        if !self.path.exists() {
            info!(
                "No calibration file at {}, starting uncalibrated",
                self.path.display()
            );
            return Ok(LoadReport::default());
        }
        let text = fs::read_to_string(&self.path).map_err(|e| StorageError::io(&self.path, e))?;
        // Syntax errors are reported against the file, shape errors by the store
        if let Err(e) = serde_json::from_str::<serde_json::Value>(&text) {
            return Err(StorageError::json(&self.path, e));
        }
        let report = store.load_json(&text)?;

        if !report.unknown.is_empty() {
            warn!(
                "{}: ignoring unknown actuators {:?}",
                self.path.display(),
                report.unknown
            );
        }
        info!(
            "Loaded calibration for {} actuator(s) from {}",
            report.loaded.len(),
            self.path.display()
        );
        Ok(report)
    }

    /// Write every non-empty profile, pretty printed with a trailing newline
    pub fn save(&self, store: &CalibrationStore) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let json = store.to_json()?;

        let file = File::create(&self.path).map_err(|e| StorageError::io(&self.path, e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(json.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush())
            .map_err(|e| StorageError::io(&self.path, e))?;

        debug!("Stored calibration -> {}", self.path.display());
        Ok(())
    }
}
