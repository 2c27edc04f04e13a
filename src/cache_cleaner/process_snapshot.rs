use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::debug;
use sysinfo::System;

use super::errors::ProbeError;
use super::types::EntryKind;

/// Answers "is some running process using this path?". Advisory only:
/// an error never makes an entry more deletable.
pub trait UsageProbe: Send + Sync {
    /// Called once per scan, before classification.
    fn refresh(&self) -> Result<(), ProbeError> {
        Ok(())
    }

    fn is_in_use(&self, path: &Path, kind: EntryKind) -> Result<bool, ProbeError>;
}

/// Open file descriptors, working directories and path-like command
/// arguments of every readable process at one instant.
#[derive(Clone, Default)]
pub struct OpenFileSnapshot {
    open_paths: Arc<HashSet<PathBuf>>,
    working_dirs: Arc<Vec<PathBuf>>,
    command_paths: Arc<HashSet<PathBuf>>,
}

impl OpenFileSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_paths<I, P>(open: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        OpenFileSnapshot {
            open_paths: Arc::new(open.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        Arc::make_mut(&mut self.working_dirs).push(dir.into());
        self
    }

    /// Walks `/proc`; processes whose fds we may not read are skipped.
    pub fn capture() -> Result<Self, ProbeError> {
        let mut system = System::new();
        system.refresh_processes();
        if system.processes().is_empty() {
            return Err(ProbeError::Unavailable("no processes visible".into()));
        }

        let own_pid = std::process::id();
        let mut open_paths = HashSet::new();
        let mut working_dirs = Vec::new();
        let mut command_paths = HashSet::new();

        for (pid, process) in system.processes() {
            let pid = pid.as_u32();
            if pid == own_pid {
                continue;
            }
            let proc_dir = PathBuf::from(format!("/proc/{}", pid));
            if let Ok(fds) = fs::read_dir(proc_dir.join("fd")) {
                for fd in fds.flatten() {
                    if let Ok(target) = fs::read_link(fd.path()) {
                        if target.is_absolute() {
                            open_paths.insert(target);
                        }
                    }
                }
            }
            if let Ok(cwd) = fs::read_link(proc_dir.join("cwd")) {
                working_dirs.push(cwd);
            }
            for arg in process.cmd() {
                if arg.starts_with('/') {
                    command_paths.insert(PathBuf::from(arg));
                }
            }
        }

        debug!(
            "usage snapshot: {} open paths, {} working dirs",
            open_paths.len(),
            working_dirs.len()
        );
        Ok(OpenFileSnapshot {
            open_paths: Arc::new(open_paths),
            working_dirs: Arc::new(working_dirs),
            command_paths: Arc::new(command_paths),
        })
    }

    pub fn uses(&self, path: &Path, kind: EntryKind) -> bool {
        if kind == EntryKind::Directory {
            self.open_paths.iter().any(|open| open.starts_with(path))
                || self.working_dirs.iter().any(|cwd| cwd.starts_with(path))
                || self.command_paths.iter().any(|arg| arg.starts_with(path))
        } else {
            self.open_paths.contains(path) || self.command_paths.contains(path)
        }
    }
}

impl UsageProbe for OpenFileSnapshot {
    fn is_in_use(&self, path: &Path, kind: EntryKind) -> Result<bool, ProbeError> {
        Ok(self.uses(path, kind))
    }
}

/// Live probe: recaptures the process table on every `refresh`.
#[derive(Default)]
pub struct ProcUsageProbe {
    snapshot: RwLock<Option<Arc<OpenFileSnapshot>>>,
}

impl ProcUsageProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UsageProbe for ProcUsageProbe {
    fn refresh(&self) -> Result<(), ProbeError> {
        let captured = OpenFileSnapshot::capture();
        let mut slot = self
            .snapshot
            .write()
            .map_err(|_| ProbeError::Unavailable("snapshot lock poisoned".into()))?;
        match captured {
            Ok(snapshot) => {
                *slot = Some(Arc::new(snapshot));
                Ok(())
            }
            Err(err) => {
                // A stale snapshot would under-report usage.
                *slot = None;
                Err(err)
            }
        }
    }

    fn is_in_use(&self, path: &Path, kind: EntryKind) -> Result<bool, ProbeError> {
        let slot = self
            .snapshot
            .read()
            .map_err(|_| ProbeError::Unavailable("snapshot lock poisoned".into()))?;
        match slot.as_ref() {
            Some(snapshot) => Ok(snapshot.uses(path, kind)),
            None => Err(ProbeError::Unavailable("process table not captured".into())),
        }
    }
}
