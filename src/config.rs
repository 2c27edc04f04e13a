// src/config.rs

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache_cleaner::BaseDirs;

pub const DEFAULT_CLEAN_WORKERS: usize = 4;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_LEDGER_CAPACITY: usize = 8;

/// System locations a category root may live under, besides the user's home.
pub const SYSTEM_CACHE_BASES: &[&str] = &[
    "/var/cache",
    "/var/log",
    "/var/tmp",
    "/tmp",
    "/var/lib/flatpak",
    "/var/lib/dpkg/info",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    // Parallelism
    pub scan_workers: usize,  // Default: num_cpus::get()
    pub clean_workers: usize, // Default: 4

    // External tools
    pub tool_timeout: Duration, // Default: 10 minutes
    pub allow_elevation: bool,  // Default: true (pkexec for system-scope commands)

    // Safety
    pub allowed_bases: Vec<PathBuf>,   // Category roots must resolve under one of these
    pub protected_paths: Vec<PathBuf>, // Never offered for deletion, nor any ancestor

    // Bookkeeping
    pub ledger_capacity: usize, // Default: 8 recent scans accepted by clean()
}

impl EngineConfig {
    /// Configuration with no base directories; callers add what they need.
    pub fn bare() -> Self {
        EngineConfig {
            scan_workers: num_cpus::get().max(1),
            clean_workers: DEFAULT_CLEAN_WORKERS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            allow_elevation: true,
            allowed_bases: Vec::new(),
            protected_paths: Vec::new(),
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }

    pub fn for_dirs(dirs: &BaseDirs) -> Self {
        let mut config = Self::bare();
        config.allowed_bases.push(dirs.home.clone());
        config
            .allowed_bases
            .extend(SYSTEM_CACHE_BASES.iter().map(PathBuf::from));
        config.protected_paths = vec![dirs.home.clone(), dirs.cache.clone(), dirs.data.clone()];
        config
    }

    pub fn with_allowed_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.allowed_bases.push(base.into());
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// `Default` plus `SPRUCE_*` environment overrides.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(workers) = env_usize("SPRUCE_SCAN_WORKERS") {
            self.scan_workers = workers.max(1);
        }
        if let Some(workers) = env_usize("SPRUCE_CLEAN_WORKERS") {
            self.clean_workers = workers.max(1);
        }
        if let Some(secs) = env_usize("SPRUCE_TOOL_TIMEOUT_SECS") {
            self.tool_timeout = Duration::from_secs(secs as u64);
        }
        if env_flag("SPRUCE_DISABLE_ELEVATION") {
            self.allow_elevation = false;
        }
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        match BaseDirs::detect() {
            Ok(dirs) => Self::for_dirs(&dirs),
            Err(err) => {
                log::warn!("{}; only system cache locations are allowed", err);
                let mut config = Self::bare();
                config
                    .allowed_bases
                    .extend(SYSTEM_CACHE_BASES.iter().map(PathBuf::from));
                config
            }
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a number", name, raw);
            None
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| {
            let lowercase = value.trim().to_ascii_lowercase();
            lowercase == "1" || lowercase == "true" || lowercase == "yes"
        })
        .unwrap_or(false)
}
