//! Scan numbers.
//!
//! Every activated scan, except plain moves, is handed the next number of
//! one engine-wide counter. With a backing file the counter survives engine
//! restarts: the file holds the last number handed out, as decimal text.

use beamline_core::{ScanError, ScanResult};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Engine-wide, monotonically increasing scan counter.
#[derive(Debug, Default)]
pub struct ScanNumbers {
    last: Mutex<u64>,
    file: Option<PathBuf>,
}

impl ScanNumbers {
    /// Counter starting at zero, persisted to `file` if given.
    ///
    /// Nothing is read until [`ScanNumbers::load`].
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            last: Mutex::new(0),
            file,
        }
    }

    /// Continue from the number stored in the backing file.
    ///
    /// A missing file starts the count at zero.
    ///
    /// # Errors
    /// `InvalidConfig` if the file cannot be read or does not hold a number.
    pub fn load(&self) -> ScanResult<u64> {
        let Some(path) = &self.file else {
            return Ok(self.last());
        };
        let stored = match std::fs::read_to_string(path) {
            Ok(text) => parse_stored(path, &text)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(file_error(path, err.to_string())),
        };
        let mut last = self.last.lock();
        *last = (*last).max(stored);
        debug!(path = %path.display(), last = *last, "scan numbers loaded");
        Ok(*last)
    }

    /// Last number handed out; zero before the first scan.
    pub fn last(&self) -> u64 {
        *self.last.lock()
    }

    /// Hand out the next number.
    ///
    /// A failed write of the backing file is logged; counting goes on.
    pub fn assign(&self) -> u64 {
        let mut last = self.last.lock();
        *last += 1;
        if let Some(path) = &self.file {
            if let Err(err) = std::fs::write(path, format!("{}\n", *last)) {
                warn!(path = %path.display(), error = %err, "scan number not persisted");
            }
        }
        *last
    }
}

fn parse_stored(path: &Path, text: &str) -> ScanResult<u64> {
    text.trim()
        .parse()
        .map_err(|_| file_error(path, format!("'{}' is not a scan number", text.trim())))
}

fn file_error(path: &Path, message: String) -> ScanError {
    ScanError::InvalidConfig {
        target: path.display().to_string(),
        message,
    }
}
