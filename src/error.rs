//! Domain status channel (`ErrorHandler`) and the `thiserror` error enums
//! used at the fallible boundaries of [`crate::projector`], [`crate::geometry`],
//! [`crate::store`] and [`crate::query`].
//!
//! `ErrorHandler` is deliberately not a `Result`-based API: it models the
//! single-producer, sticky-until-reset status object that the query engine
//! and averager share with their subordinates (spec §4.7), not a single
//! function's outcome.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Name used for the log sink when logging is disabled.
pub const NULL_DEVICE: &str = "/dev/null";

/// Overall status of an [`ErrorHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    Ok,
    Warning,
    Error,
}

/// Single-producer status object with an optional append-only log sink.
///
/// `warning()` never downgrades an existing `ERROR` status; only
/// `reset_status()` can clear it. This mirrors the reference query engine's
/// `ErrorHandler`, where a single instance is shared by a top-level
/// component (creator, averager, or query) and all of its subordinates.
pub struct ErrorHandler {
    status: Status,
    message: String,
    log_filename: PathBuf,
    log_file: Option<File>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        ErrorHandler {
            status: Status::Ok,
            message: String::new(),
            log_filename: PathBuf::from(NULL_DEVICE),
            log_file: None,
        }
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Sets the status to `ERROR` and records `msg`, unless the status is
    /// already `ERROR` (errors are terminal until [`Self::reset_status`]).
    pub fn error(&mut self, msg: impl Into<String>) {
        if self.status != Status::Error {
            self.status = Status::Error;
        }
        self.message = msg.into();
    }

    /// Sets the status to `WARNING` and records `msg`, unless the status is
    /// already `ERROR` (a warning never overwrites an error).
    pub fn warning(&mut self, msg: impl Into<String>) {
        if self.status != Status::Error {
            self.status = Status::Warning;
        }
        self.message = msg.into();
    }

    /// Clears the status to `OK` and empties the message.
    pub fn reset_status(&mut self) {
        self.status = Status::Ok;
        self.message.clear();
    }

    /// Sets the log sink filename and opens it for appending.
    pub fn set_log_filename(&mut self, filename: impl AsRef<Path>) -> std::io::Result<()> {
        let filename = filename.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)?;
        self.log_filename = filename;
        self.log_file = Some(file);
        Ok(())
    }

    /// Turns logging on or off. Re-enabling after a disable reopens the
    /// current log filename in append mode (no truncation).
    pub fn set_logging_on(&mut self, on: bool) -> std::io::Result<()> {
        if on {
            if self.log_file.is_none() {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.log_filename)?;
                self.log_file = Some(file);
            }
        } else {
            self.log_file = None;
        }
        Ok(())
    }

    pub fn is_logging_on(&self) -> bool {
        self.log_file.is_some()
    }

    /// Appends `msg` to the log sink, if logging is enabled. A no-op
    /// otherwise (the sink defaults to a null device).
    pub fn log(&mut self, msg: &str) {
        if let Some(file) = self.log_file.as_mut() {
            let _ = file.write_all(msg.as_bytes());
        }
    }
}

/// Errors from [`crate::projector`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProjectorError {
    #[error("coordinate is outside the domain of the projection")]
    OutOfDomain,
}

/// Errors from [`crate::geometry`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error(transparent)]
    Projector(#[from] ProjectorError),
    #[error("requested octree level {0} exceeds the maximum supported level 31")]
    LevelTooDeep(u8),
    #[error("edge length {0} does not correspond to an exact octree level")]
    NotAPowerOfTwoLevel(f64),
    #[error("address ticks are not aligned to the grid of level {level}")]
    Misaligned { level: u8 },
}

/// Errors from [`crate::store`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("on-disk schema does not match the payload schema of this build")]
    SchemaMismatch,
    #[error("store is read-only (opened for query, not for insertion)")]
    ReadOnly,
    #[error(
        "cannot insert at {new:?}: an ancestor or descendant node already exists at {existing:?}"
    )]
    NotDisjoint {
        new: crate::geometry::Address,
        existing: crate::geometry::Address,
    },
    #[error("address is not canonical: ticks are not aligned to level {level}")]
    NonCanonicalAddress { level: u8 },
    #[error("directory is corrupt: {0}")]
    CorruptDirectory(String),
}

/// Errors from [`crate::query`].
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("unrecognized value name: {0}")]
    UnknownValueName(String),
    #[error("query resolution must be positive, got {0}")]
    InvalidArgument(f64),
    #[error("database filename was not set before open()")]
    FilenameNotSet,
    #[error("operation is not valid in the current state ({0})")]
    InvalidState(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_is_ok() {
        let h = ErrorHandler::new();
        assert_eq!(h.status(), Status::Ok);
        assert_eq!(h.message(), "");
        assert!(!h.is_logging_on());
    }

    #[test]
    fn reset_status_clears_error() {
        let mut h = ErrorHandler::new();
        h.error("Error");
        h.reset_status();
        assert_eq!(h.status(), Status::Ok);
        assert_eq!(h.message(), "");
    }

    #[test]
    fn error_sets_message_and_status() {
        let mut h = ErrorHandler::new();
        h.error("Error message.");
        assert_eq!(h.status(), Status::Error);
        assert_eq!(h.message(), "Error message.");
    }

    #[test]
    fn warning_sets_message_and_status() {
        let mut h = ErrorHandler::new();
        h.warning("Warning message.");
        assert_eq!(h.status(), Status::Warning);
        assert_eq!(h.message(), "Warning message.");
    }

    #[test]
    fn warning_never_overwrites_error() {
        let mut h = ErrorHandler::new();
        h.error("boom");
        h.warning("just a warning");
        assert_eq!(h.status(), Status::Error);
    }

    #[test]
    fn log_goes_to_black_hole_until_filename_set() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("test.log");

        let mut h = ErrorHandler::new();
        h.log("This stuff should go into a black hole.\n");

        h.set_log_filename(&log_path).unwrap();
        h.log("This stuff should go into the log file.\n");

        h.set_logging_on(false).unwrap();
        h.log("This stuff should also go into a black hole.\n");

        h.set_logging_on(true).unwrap();
        h.log("This stuff should also go into the log file.\n");

        h.set_logging_on(false).unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next(),
            Some("This stuff should go into the log file.")
        );
        assert_eq!(
            lines.next(),
            Some("This stuff should also go into the log file.")
        );
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn reenabling_logging_appends_not_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("test.log");

        let mut h = ErrorHandler::new();
        h.set_log_filename(&log_path).unwrap();
        h.log("first\n");
        h.set_logging_on(false).unwrap();
        h.set_logging_on(true).unwrap();
        h.log("second\n");

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }
}
