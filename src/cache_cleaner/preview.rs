use std::fmt;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{CacheEntry, CategoryId, CategoryScan, SafetyTag, ScanResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSum {
    pub bytes: u64,
    pub count: usize,
}

impl TierSum {
    fn add(&mut self, bytes: u64) {
        self.bytes += bytes;
        self.count += 1;
    }

    fn merge(&mut self, other: TierSum) {
        self.bytes += other.bytes;
        self.count += other.count;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTotals {
    pub auto_safe: TierSum,
    pub confirm_required: TierSum,
    pub protected: TierSum,
}

impl TierTotals {
    pub fn add(&mut self, entry: &CacheEntry) {
        match entry.tag {
            SafetyTag::AutoSafe => self.auto_safe.add(entry.size),
            SafetyTag::ConfirmRequired => self.confirm_required.add(entry.size),
            SafetyTag::Protected => self.protected.add(entry.size),
        }
    }

    fn merge(&mut self, other: &TierTotals) {
        self.auto_safe.merge(other.auto_safe);
        self.confirm_required.merge(other.confirm_required);
        self.protected.merge(other.protected);
    }

    pub fn total_bytes(&self) -> u64 {
        self.auto_safe.bytes + self.confirm_required.bytes + self.protected.bytes
    }

    /// Protected entries are never reclaimable.
    pub fn reclaimable_bytes(&self) -> u64 {
        self.auto_safe.bytes + self.confirm_required.bytes
    }

    pub fn entry_count(&self) -> usize {
        self.auto_safe.count + self.confirm_required.count + self.protected.count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPreview {
    pub category: CategoryId,
    pub label: String,
    pub totals: TierTotals,
    pub warnings: usize,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl CategoryPreview {
    fn of(scan: &CategoryScan) -> Self {
        let mut totals = TierTotals::default();
        scan.entries.iter().for_each(|entry| totals.add(entry));
        CategoryPreview {
            category: scan.category.clone(),
            label: scan.label.clone(),
            totals,
            warnings: scan.warnings.len(),
            error: scan.error.as_ref().map(ToString::to_string),
            cancelled: scan.cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewReport {
    pub scan_id: Uuid,
    pub categories: Vec<CategoryPreview>,
    pub totals: TierTotals,
    pub cancelled: bool,
}

impl PreviewReport {
    pub fn category(&self, id: &str) -> Option<&CategoryPreview> {
        self.categories.iter().find(|c| c.category == id)
    }

    pub fn total_bytes(&self) -> u64 {
        self.totals.total_bytes()
    }

    pub fn reclaimable_bytes(&self) -> u64 {
        self.totals.reclaimable_bytes()
    }
}

impl fmt::Display for PreviewReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in &self.categories {
            write!(
                f,
                "{:<28} {:>10} reclaimable ({} safe, {} to confirm)",
                c.label,
                ByteSize::b(c.totals.reclaimable_bytes()).to_string(),
                ByteSize::b(c.totals.auto_safe.bytes),
                ByteSize::b(c.totals.confirm_required.bytes),
            )?;
            if c.totals.protected.count > 0 {
                write!(f, ", {} protected", c.totals.protected.count)?;
            }
            if c.warnings > 0 {
                write!(f, ", {} warnings", c.warnings)?;
            }
            if let Some(error) = &c.error {
                write!(f, " [skipped: {}]", error)?;
            }
            writeln!(f)?;
        }
        write!(
            f,
            "Total: {} reclaimable of {} in {} entries",
            ByteSize::b(self.reclaimable_bytes()),
            ByteSize::b(self.total_bytes()),
            self.totals.entry_count()
        )?;
        if self.cancelled {
            write!(f, " (scan cancelled)")?;
        }
        Ok(())
    }
}

/// Pure aggregation over a classified scan.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreviewEngine;

impl PreviewEngine {
    pub fn preview(scan: &ScanResult) -> PreviewReport {
        let categories: Vec<CategoryPreview> =
            scan.categories.iter().map(CategoryPreview::of).collect();
        let mut totals = TierTotals::default();
        categories.iter().for_each(|c| totals.merge(&c.totals));
        PreviewReport {
            scan_id: scan.id,
            categories,
            totals,
            cancelled: scan.cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_cleaner::errors::CategoryScanError;
    use crate::cache_cleaner::types::{
        CacheCategory, EntryKind, EntrySource, InclusionRule, RemovalStrategy, TagReason,
    };
    use chrono::Utc;
    use std::path::PathBuf;

    fn category(id: &str) -> CacheCategory {
        CacheCategory::new(
            id,
            id,
            EntrySource::Filesystem(InclusionRule::files()),
            RemovalStrategy::FileDelete,
        )
    }

    fn entry(name: &str, size: u64, tag: SafetyTag) -> CacheEntry {
        let mut entry = CacheEntry::unclassified(
            PathBuf::from("/c").join(name),
            EntryKind::File,
            size,
            Utc::now(),
            &"c".into(),
        );
        entry.tag = tag;
        entry.reason = TagReason::CategoryDefault;
        entry
    }

    fn scan() -> ScanResult {
        let mut first = CategoryScan::empty(&category("c"));
        first.entries = vec![
            entry("a", 2000, SafetyTag::AutoSafe),
            entry("b", 500, SafetyTag::ConfirmRequired),
            entry("p", 700, SafetyTag::Protected),
        ];
        let broken = CategoryScan::failed(
            &category("d"),
            CategoryScanError::RootOutsideAllowedBases {
                root: PathBuf::from("/etc"),
            },
        );
        ScanResult {
            id: Uuid::new_v4(),
            scanned_at: Utc::now(),
            categories: vec![first, broken],
            cancelled: false,
        }
    }

    #[test]
    fn protected_bytes_are_never_reclaimable() {
        let report = PreviewEngine::preview(&scan());
        assert_eq!(report.totals.auto_safe.bytes, 2000);
        assert_eq!(report.reclaimable_bytes(), 2500);
        assert_eq!(report.total_bytes(), 3200);
        assert_eq!(report.totals.protected.count, 1);
    }

    #[test]
    fn preview_is_idempotent_and_keeps_errors() {
        let scan = scan();
        let first = PreviewEngine::preview(&scan);
        let second = PreviewEngine::preview(&scan);
        assert_eq!(first, second);
        assert!(first.category("d").and_then(|c| c.error.as_ref()).is_some());
        assert_eq!(first.category("d").map(|c| c.totals.entry_count()), Some(0));
    }

    #[test]
    fn display_mentions_totals() {
        let text = PreviewEngine::preview(&scan()).to_string();
        assert!(text.contains("Total:"));
        assert!(text.contains("skipped"));
    }
}
