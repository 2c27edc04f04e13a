mod cache_cleaner;
pub mod config;
mod ops;

pub use cache_cleaner::errors::{
    CategoryCleanupFailure, CategoryScanError, ClassificationError, EntryCleanupFailure,
    FailureKind, PreconditionViolation, ProbeError, ScanWarning, SetupError, ToolError,
    WarningKind,
};
pub use cache_cleaner::inventory::{
    parse_apt_autoremove, parse_flatpak_refs, AptPackage, FlatpakKind, FlatpakRef,
};
pub use cache_cleaner::*;
pub use config::EngineConfig;
