use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{CacheEntry, SafetyTag, ScanResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedEntry {
    pub entry: CacheEntry,
    /// Explicit per-item confirmation; required for `ConfirmRequired` entries.
    pub confirmed: bool,
}

/// The subset of one scan the caller wants removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Selection {
    pub scan_id: Uuid,
    items: Vec<SelectedEntry>,
}

impl Selection {
    pub fn for_scan_id(scan_id: Uuid) -> Self {
        Selection {
            scan_id,
            items: Vec::new(),
        }
    }

    pub fn empty(scan: &ScanResult) -> Self {
        Self::for_scan_id(scan.id)
    }

    /// Every auto-safe entry of `scan`, unconfirmed.
    pub fn auto_safe(scan: &ScanResult) -> Self {
        let items = scan
            .entries()
            .filter(|entry| entry.tag == SafetyTag::AutoSafe)
            .map(|entry| SelectedEntry {
                entry: entry.clone(),
                confirmed: false,
            })
            .collect();
        Selection {
            scan_id: scan.id,
            items,
        }
    }

    /// Adds `entry` as explicitly confirmed.
    pub fn include(&mut self, entry: &CacheEntry) -> &mut Self {
        match self.items.iter_mut().find(|item| item.entry.path == entry.path) {
            Some(item) => item.confirmed = true,
            None => self.items.push(SelectedEntry {
                entry: entry.clone(),
                confirmed: true,
            }),
        }
        self
    }

    /// Confirms the entry of `scan` at `path`; false when the scan has none.
    pub fn include_path(&mut self, scan: &ScanResult, path: &Path) -> bool {
        match scan.find_entry(path) {
            Some(entry) => {
                self.include(entry);
                true
            }
            None => false,
        }
    }

    /// Confirms every non-protected entry of one category.
    pub fn include_category(&mut self, scan: &ScanResult, category: &str) -> usize {
        let Some(found) = scan.category(category) else {
            return 0;
        };
        let mut added = 0;
        for entry in found.entries.iter().filter(|e| e.tag != SafetyTag::Protected) {
            self.include(entry);
            added += 1;
        }
        added
    }

    pub fn items(&self) -> &[SelectedEntry] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|item| item.entry.size).sum()
    }
}
