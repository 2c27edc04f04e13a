mod cleaner;
mod engine;
pub mod errors;
pub mod external;
pub mod inventory;
pub mod preview;
pub mod process_snapshot;
mod registry;
mod safety;
mod scanner;
pub mod selection;
pub mod types;


pub use cleaner::{
    CategoryCleanup, Cleaner, CleanupReport, RemovedEntry, SkipReason, SkippedEntry,
};
pub use engine::CleanupEngine;
pub use external::{
    ExternalToolInvoker, HostEnvironment, SystemToolRunner, ToolCommand, ToolInvocation,
    ToolOutput, ToolRunner,
};
pub use preview::{CategoryPreview, PreviewEngine, PreviewReport, TierSum, TierTotals};
pub use process_snapshot::{OpenFileSnapshot, ProcUsageProbe, UsageProbe};
pub use registry::{BaseDirs, CacheLocationRegistry};
pub use safety::{Classification, SafetyClassifier, SafetyRule, DEFAULT_RULES};
pub use scanner::Scanner;
pub use selection::{SelectedEntry, Selection};
pub use types::{
    CacheCategory, CacheEntry, CategoryId, CategoryScan, EntryKind, EntrySource, Footprint,
    Granularity, InclusionRule, InventoryFormat, InventorySource, RemovalStrategy, SafetyTag, ScanResult,
    TagReason,
};
