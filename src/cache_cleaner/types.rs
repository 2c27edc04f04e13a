use std::fmt;
use std::fs::FileType;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{CategoryScanError, ScanWarning};
use super::external::ToolCommand;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(String);

impl CategoryId {
    pub fn new(id: impl Into<String>) -> Self {
        CategoryId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CategoryId {
    fn from(value: &str) -> Self {
        CategoryId::new(value)
    }
}

impl PartialEq<str> for CategoryId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for CategoryId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SafetyTag {
    AutoSafe,
    ConfirmRequired,
    Protected,
}

/// Which classification rule produced an entry's tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagReason {
    Unclassified,
    ProtectedPath,
    NotRemovable,
    InUse,
    Fresh,
    CategoryDefault,
    Unclassifiable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    pub(crate) fn of(file_type: &FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    /// For directories: newest modification time found in the subtree.
    pub last_modified: DateTime<Utc>,
    pub category: CategoryId,
    pub tag: SafetyTag,
    pub reason: TagReason,
}

impl CacheEntry {
    pub(crate) fn unclassified(
        path: PathBuf,
        kind: EntryKind,
        size: u64,
        last_modified: DateTime<Utc>,
        category: &CategoryId,
    ) -> Self {
        CacheEntry {
            path,
            kind,
            size,
            last_modified,
            category: category.clone(),
            tag: SafetyTag::ConfirmRequired,
            reason: TagReason::Unclassified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Recurse and emit every matching file or symlink.
    Files,
    /// Emit each direct child of the root as a single entry.
    TopLevel,
}

/// Which filesystem objects under a category root become entries.
#[derive(Debug, Clone)]
pub struct InclusionRule {
    pub granularity: Granularity,
    pub max_depth: usize,
    pub name_pattern: Option<Regex>,
    pub extensions: Vec<String>,
    /// Exact names, or prefixes when ending in `*`. Excluded directories are not descended.
    pub excludes: Vec<String>,
    pub min_size: u64,
}

impl InclusionRule {
    pub fn files() -> Self {
        InclusionRule {
            granularity: Granularity::Files,
            max_depth: 16,
            name_pattern: None,
            extensions: Vec::new(),
            excludes: Vec::new(),
            min_size: 0,
        }
    }

    pub fn top_level() -> Self {
        InclusionRule {
            granularity: Granularity::TopLevel,
            max_depth: 1,
            ..InclusionRule::files()
        }
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.max(1);
        self
    }

    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.name_pattern = Some(pattern);
        self
    }

    pub fn extensions(mut self, exts: &[&str]) -> Self {
        self.extensions = exts.iter().map(|e| e.to_lowercase()).collect();
        self
    }

    pub fn exclude(mut self, names: &[&str]) -> Self {
        self.excludes.extend(names.iter().map(|name| name.to_string()));
        self
    }

    pub fn min_size(mut self, bytes: u64) -> Self {
        self.min_size = bytes;
        self
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.excludes.iter().any(|ex| match ex.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == ex,
        })
    }

    /// Name filters applied to candidate entries (not to traversed directories).
    pub fn matches_name(&self, name: &str, kind: EntryKind) -> bool {
        if self.is_excluded(name) {
            return false;
        }
        if kind != EntryKind::Directory && !self.extensions.is_empty() {
            let ext = Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase());
            match ext {
                Some(ext) if self.extensions.iter().any(|allowed| allowed == &ext) => {}
                _ => return false,
            }
        }
        match &self.name_pattern {
            Some(pattern) => pattern.is_match(name),
            None => true,
        }
    }
}

/// A command whose output lists items, each installed under `root`.
#[derive(Debug, Clone)]
pub struct InventorySource {
    pub command: ToolCommand,
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InventoryFormat {
    /// `flatpak uninstall --unused --dry-run --columns=ref` output.
    FlatpakRefs,
    /// `apt-get --dry-run autoremove` output; entries are dpkg file lists.
    AptAutoremove,
}

impl InventoryFormat {
    pub fn footprint(self) -> Footprint {
        match self {
            InventoryFormat::FlatpakRefs => Footprint::Path,
            InventoryFormat::AptAutoremove => Footprint::PackageFiles,
        }
    }
}

/// What an entry's size stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Footprint {
    /// The bytes under the entry path itself.
    #[default]
    Path,
    /// The entry is a dpkg `.list` file; its size is the package's installed files.
    PackageFiles,
}

#[derive(Debug, Clone)]
pub enum EntrySource {
    Filesystem(InclusionRule),
    Inventory {
        format: InventoryFormat,
        sources: Vec<InventorySource>,
    },
}

#[derive(Debug, Clone)]
pub enum RemovalStrategy {
    FileDelete,
    DirectoryPrune,
    /// Run once per category, in order.
    ExternalCommand(Vec<ToolCommand>),
}

#[derive(Debug, Clone)]
pub struct CacheCategory {
    pub id: CategoryId,
    pub label: String,
    pub roots: Vec<PathBuf>,
    pub source: EntrySource,
    pub removal: RemovalStrategy,
    pub default_tier: SafetyTag,
    /// Entries modified more recently than this need confirmation.
    pub freshness: Duration,
}

impl CacheCategory {
    pub fn new(id: &str, label: &str, source: EntrySource, removal: RemovalStrategy) -> Self {
        CacheCategory {
            id: CategoryId::new(id),
            label: label.to_string(),
            roots: Vec::new(),
            source,
            removal,
            default_tier: SafetyTag::ConfirmRequired,
            freshness: Duration::ZERO,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.roots.push(root.into());
        self
    }

    pub fn with_tier(mut self, tier: SafetyTag) -> Self {
        self.default_tier = tier;
        self
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    /// Root that strictly contains `path`, if any.
    pub fn root_for(&self, path: &Path) -> Option<&Path> {
        self.roots
            .iter()
            .map(PathBuf::as_path)
            .find(|root| path != *root && path.starts_with(root))
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.root_for(path).is_some()
    }

    pub fn is_command_driven(&self) -> bool {
        matches!(self.removal, RemovalStrategy::ExternalCommand(_))
    }

    pub fn footprint(&self) -> Footprint {
        match &self.source {
            EntrySource::Inventory { format, .. } => format.footprint(),
            EntrySource::Filesystem(_) => Footprint::Path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryScan {
    pub category: CategoryId,
    pub label: String,
    pub entries: Vec<CacheEntry>,
    pub warnings: Vec<ScanWarning>,
    pub error: Option<CategoryScanError>,
    pub cancelled: bool,
}

impl CategoryScan {
    pub(crate) fn empty(category: &CacheCategory) -> Self {
        CategoryScan {
            category: category.id.clone(),
            label: category.label.clone(),
            entries: Vec::new(),
            warnings: Vec::new(),
            error: None,
            cancelled: false,
        }
    }

    pub(crate) fn failed(category: &CacheCategory, error: CategoryScanError) -> Self {
        CategoryScan {
            error: Some(error),
            ..CategoryScan::empty(category)
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub id: Uuid,
    pub scanned_at: DateTime<Utc>,
    /// One slot per registered category, in registry order.
    pub categories: Vec<CategoryScan>,
    pub cancelled: bool,
}

impl ScanResult {
    pub fn category(&self, id: &str) -> Option<&CategoryScan> {
        self.categories.iter().find(|c| c.category == id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.categories.iter().flat_map(|c| c.entries.iter())
    }

    pub fn find_entry(&self, path: &Path) -> Option<&CacheEntry> {
        self.entries().find(|e| e.path == path)
    }

    pub fn total_bytes(&self) -> u64 {
        self.categories.iter().map(CategoryScan::total_bytes).sum()
    }
}
