use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::types::CategoryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    PermissionDenied,
    PathMissing,
    MountPoint,
    Io,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            WarningKind::PermissionDenied => "permission denied",
            WarningKind::PathMissing => "path missing",
            WarningKind::MountPoint => "mount point not traversed",
            WarningKind::Io => "i/o error",
        };
        f.write_str(text)
    }
}

/// Non-fatal scan condition; the subtree at `path` was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} at {}: {message}", path.display())]
pub struct ScanWarning {
    pub path: PathBuf,
    pub kind: WarningKind,
    pub message: String,
}

impl ScanWarning {
    pub fn new(path: impl Into<PathBuf>, kind: WarningKind, message: impl Into<String>) -> Self {
        ScanWarning {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn from_io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => WarningKind::PermissionDenied,
            io::ErrorKind::NotFound => WarningKind::PathMissing,
            _ => WarningKind::Io,
        };
        ScanWarning::new(path, kind, err.to_string())
    }

    pub(crate) fn from_walk(root: &std::path::Path, err: &walkdir::Error) -> Self {
        let path = err.path().unwrap_or(root).to_path_buf();
        match err.io_error() {
            Some(io_err) => ScanWarning::from_io(path, io_err),
            None => ScanWarning::new(path, WarningKind::Io, err.to_string()),
        }
    }
}

/// Fatal for one category: the category is skipped, the others are not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum CategoryScanError {
    #[error("root {} resolves outside the allowed base directories", root.display())]
    RootOutsideAllowedBases { root: PathBuf },
    #[error("inventory command `{command}` failed: {message}")]
    Inventory { command: String, message: String },
    #[error("scan worker stopped unexpectedly: {message}")]
    Interrupted { message: String },
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("process table unavailable: {0}")]
    Unavailable(String),
    #[error("usage probe i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Raised while classifying one entry; the entry falls back to `ConfirmRequired`.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("usage probe failed for {}: {source}", path.display())]
    Probe {
        path: PathBuf,
        #[source]
        source: ProbeError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PermissionDenied,
    Busy,
    Io,
}

/// Removal of a single entry failed; cleanup of the category continued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("failed to remove {}: {message}", path.display())]
pub struct EntryCleanupFailure {
    pub path: PathBuf,
    pub kind: FailureKind,
    pub message: String,
}

impl EntryCleanupFailure {
    pub(crate) fn from_io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        let kind = if err.kind() == io::ErrorKind::PermissionDenied {
            FailureKind::PermissionDenied
        } else if err.raw_os_error() == Some(libc::EBUSY) {
            FailureKind::Busy
        } else {
            FailureKind::Io
        };
        EntryCleanupFailure {
            path: path.into(),
            kind,
            message: err.to_string(),
        }
    }
}

/// External tool failure; reported for the whole category, never per entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum CategoryCleanupFailure {
    #[error("`{command}` exited with status {code:?}: {stderr}")]
    ToolFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("`{command}` did not finish within {timeout_secs}s")]
    ToolTimedOut { command: String, timeout_secs: u64 },
    #[error("`{command}` could not be started: {message}")]
    ToolUnavailable { command: String, message: String },
}

impl From<ToolError> for CategoryCleanupFailure {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Spawn { command, source } => CategoryCleanupFailure::ToolUnavailable {
                command,
                message: source.to_string(),
            },
            ToolError::TimedOut { command, timeout } => CategoryCleanupFailure::ToolTimedOut {
                command,
                timeout_secs: timeout.as_secs(),
            },
            ToolError::Failed {
                command,
                code,
                stderr,
            } => CategoryCleanupFailure::ToolFailed {
                command,
                code,
                stderr,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
    #[error("`{command}` exited with status {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Caller bug: the selection does not describe entries this engine produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreconditionViolation {
    #[error("selection refers to unknown or expired scan {scan_id}")]
    UnknownScan { scan_id: Uuid },
    #[error("{} belongs to unknown category `{category}`", path.display())]
    UnknownCategory { category: CategoryId, path: PathBuf },
    #[error("{} was never produced by scan {scan_id}", path.display())]
    EntryNotFromScan { scan_id: Uuid, path: PathBuf },
    #[error("{} lies outside the roots of category `{category}`", path.display())]
    OutsideCategory { category: CategoryId, path: PathBuf },
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("could not determine the home directory")]
    NoHomeDirectory,
}
