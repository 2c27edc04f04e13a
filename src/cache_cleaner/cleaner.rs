use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;

use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::errors::{CategoryCleanupFailure, EntryCleanupFailure, FailureKind};
use super::external::{ExternalToolInvoker, ToolCommand, ToolExit};
use super::scanner::measure_tree_on;
use super::types::{CacheCategory, CacheEntry, CategoryId, EntryKind, RemovalStrategy};
use crate::ops::WorkerPermits;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Protected,
    NotConfirmed,
    /// The object on disk no longer matches what the scan recorded.
    Changed { detail: String },
    /// Another filesystem is mounted at or below the entry.
    MountPoint { path: PathBuf },
    Cancelled,
    /// The category command removes everything it lists; only a selection of
    /// all its non-protected entries may trigger it.
    IncompleteCommandSelection,
    /// The command succeeded but kept this entry.
    RetainedByTool,
    /// The command failed before removing this entry.
    CommandFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedEntry {
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub path: PathBuf,
    #[serde(flatten)]
    pub reason: SkipReason,
}

impl SkippedEntry {
    pub(crate) fn new(path: impl Into<PathBuf>, reason: SkipReason) -> Self {
        SkippedEntry {
            path: path.into(),
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryCleanup {
    pub category: CategoryId,
    pub label: String,
    pub bytes_reclaimed: u64,
    pub removed: Vec<RemovedEntry>,
    pub already_absent: Vec<PathBuf>,
    pub skipped: Vec<SkippedEntry>,
    pub failed: Vec<EntryCleanupFailure>,
    pub failure: Option<CategoryCleanupFailure>,
    pub tool_exits: Vec<ToolExit>,
}

impl CategoryCleanup {
    fn new(category: &CacheCategory) -> Self {
        CategoryCleanup {
            category: category.id.clone(),
            label: category.label.clone(),
            bytes_reclaimed: 0,
            removed: Vec::new(),
            already_absent: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            failure: None,
            tool_exits: Vec::new(),
        }
    }

    fn record_removed(&mut self, path: PathBuf, bytes: u64) {
        self.bytes_reclaimed += bytes;
        self.removed.push(RemovedEntry { path, bytes });
    }

    pub fn was_cancelled(&self) -> bool {
        self.skipped
            .iter()
            .any(|s| s.reason == SkipReason::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupReport {
    pub scan_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub categories: Vec<CategoryCleanup>,
    pub cancelled: bool,
}

impl CleanupReport {
    pub fn category(&self, id: &str) -> Option<&CategoryCleanup> {
        self.categories.iter().find(|c| c.category == id)
    }

    pub fn bytes_reclaimed(&self) -> u64 {
        self.categories.iter().map(|c| c.bytes_reclaimed).sum()
    }

    pub fn removed_count(&self) -> usize {
        self.categories.iter().map(|c| c.removed.len()).sum()
    }

    pub fn already_absent_count(&self) -> usize {
        self.categories.iter().map(|c| c.already_absent.len()).sum()
    }

    pub fn skipped_count(&self) -> usize {
        self.categories.iter().map(|c| c.skipped.len()).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.categories.iter().map(|c| c.failed.len()).sum()
    }

    pub fn category_failures(&self) -> impl Iterator<Item = &CategoryCleanupFailure> {
        self.categories.iter().filter_map(|c| c.failure.as_ref())
    }
}

/// Validated work for one category: entries to remove and entries already
/// ruled out.
#[derive(Debug, Clone)]
pub(crate) struct CategoryPlan {
    pub(crate) category: CacheCategory,
    pub(crate) remove: Vec<CacheEntry>,
    pub(crate) skipped: Vec<SkippedEntry>,
}

enum EntryOutcome {
    Removed(u64),
    AlreadyAbsent,
    Skipped(SkipReason),
    Failed(EntryCleanupFailure),
}

pub struct Cleaner {
    invoker: Arc<ExternalToolInvoker>,
    permits: WorkerPermits,
}

impl Cleaner {
    pub fn new(invoker: Arc<ExternalToolInvoker>, clean_workers: usize) -> Self {
        Cleaner {
            invoker,
            permits: WorkerPermits::new(clean_workers),
        }
    }

    /// Categories run concurrently; entries within one category run in order.
    pub(crate) async fn execute(
        &self,
        scan_id: Uuid,
        plans: Vec<CategoryPlan>,
        cancel: &CancellationToken,
    ) -> CleanupReport {
        let started_at = Utc::now();
        let tasks = plans.into_iter().map(|plan| async move {
            let _permit = self.permits.acquire().await;
            let commands = match &plan.category.removal {
                RemovalStrategy::ExternalCommand(commands) => Some(commands.clone()),
                RemovalStrategy::FileDelete | RemovalStrategy::DirectoryPrune => None,
            };
            let outcome = match commands {
                Some(commands) => self.run_commands(plan, &commands, cancel).await,
                None => remove_in_background(plan, cancel.clone()).await,
            };
            log::info!(
                "cleaned {}: {} removed ({}), {} absent, {} skipped, {} failed{}",
                outcome.category,
                outcome.removed.len(),
                ByteSize::b(outcome.bytes_reclaimed),
                outcome.already_absent.len(),
                outcome.skipped.len(),
                outcome.failed.len(),
                if outcome.failure.is_some() { ", command failed" } else { "" }
            );
            outcome
        });
        let categories = join_all(tasks).await;
        let cancelled = cancel.is_cancelled() || categories.iter().any(|c| c.was_cancelled());
        CleanupReport {
            scan_id,
            started_at,
            finished_at: Utc::now(),
            categories,
            cancelled,
        }
    }

    async fn run_commands(
        &self,
        plan: CategoryPlan,
        commands: &[ToolCommand],
        cancel: &CancellationToken,
    ) -> CategoryCleanup {
        let mut report = CategoryCleanup::new(&plan.category);
        report.skipped = plan.skipped;
        if plan.remove.is_empty() {
            return report;
        }
        if cancel.is_cancelled() {
            report.skipped.extend(
                plan.remove
                    .into_iter()
                    .map(|e| SkippedEntry::new(e.path, SkipReason::Cancelled)),
            );
            return report;
        }

        let probe: Vec<PathBuf> = plan.remove.iter().map(|e| e.path.clone()).collect();
        let present = tokio::task::spawn_blocking(move || {
            probe
                .iter()
                .map(|p| fs::symlink_metadata(p).is_ok())
                .collect::<Vec<bool>>()
        })
        .await
        .unwrap_or_else(|_| vec![true; plan.remove.len()]);
        if !present.iter().any(|p| *p) {
            // Nothing left to do; running the tool again would be a no-op.
            report
                .already_absent
                .extend(plan.remove.into_iter().map(|e| e.path));
            return report;
        }

        let footprint = plan.category.footprint();
        let invocation = self
            .invoker
            .invoke_all(commands, &plan.remove, footprint)
            .await;
        report.tool_exits = invocation.exits;
        report.failure = invocation.failure;
        let failed = report.failure.is_some();
        for ((entry, residual), was_present) in plan
            .remove
            .into_iter()
            .zip(invocation.residuals)
            .zip(present)
        {
            let reclaimed = residual.reclaimed.min(entry.size);
            if !was_present {
                report.already_absent.push(entry.path);
            } else if !residual.still_present {
                report.record_removed(entry.path, reclaimed);
            } else {
                // Shrunk entries still count what they lost.
                report.bytes_reclaimed += reclaimed;
                let reason = if failed {
                    SkipReason::CommandFailed
                } else {
                    SkipReason::RetainedByTool
                };
                report.skipped.push(SkippedEntry::new(entry.path, reason));
            }
        }
        report
    }
}

async fn remove_in_background(plan: CategoryPlan, cancel: CancellationToken) -> CategoryCleanup {
    let category = plan.category.clone();
    let paths: Vec<PathBuf> = plan.remove.iter().map(|e| e.path.clone()).collect();
    match tokio::task::spawn_blocking(move || remove_entries(plan, &cancel)).await {
        Ok(report) => report,
        Err(err) => {
            log::warn!("cleanup worker for {} stopped: {}", category.id, err);
            let mut report = CategoryCleanup::new(&category);
            report.failed = paths
                .into_iter()
                .map(|path| EntryCleanupFailure {
                    path,
                    kind: FailureKind::Io,
                    message: format!("cleanup worker stopped: {}", err),
                })
                .collect();
            report
        }
    }
}

fn remove_entries(plan: CategoryPlan, cancel: &CancellationToken) -> CategoryCleanup {
    let mut report = CategoryCleanup::new(&plan.category);
    report.skipped = plan.skipped;
    let mut entries = plan.remove.into_iter();
    for entry in entries.by_ref() {
        if cancel.is_cancelled() {
            report
                .skipped
                .push(SkippedEntry::new(entry.path, SkipReason::Cancelled));
            break;
        }
        match remove_entry(&plan.category, &entry) {
            EntryOutcome::Removed(bytes) => report.record_removed(entry.path, bytes),
            EntryOutcome::AlreadyAbsent => report.already_absent.push(entry.path),
            EntryOutcome::Skipped(reason) => {
                report.skipped.push(SkippedEntry::new(entry.path, reason))
            }
            EntryOutcome::Failed(failure) => {
                log::warn!("{}", failure);
                report.failed.push(failure);
            }
        }
    }
    report.skipped.extend(
        entries.map(|e| SkippedEntry::new(e.path, SkipReason::Cancelled)),
    );
    report
}

/// Re-verifies one entry against the disk, then removes it.
fn remove_entry(category: &CacheCategory, entry: &CacheEntry) -> EntryOutcome {
    let changed = |detail: &str| {
        EntryOutcome::Skipped(SkipReason::Changed {
            detail: detail.to_string(),
        })
    };
    let Some(root) = category.root_for(&entry.path) else {
        return changed("outside category roots");
    };

    let md = match fs::symlink_metadata(&entry.path) {
        Ok(md) => md,
        Err(err) if err.kind() == ErrorKind::NotFound => return EntryOutcome::AlreadyAbsent,
        Err(err) => return EntryOutcome::Failed(EntryCleanupFailure::from_io(&entry.path, &err)),
    };
    let kind = EntryKind::of(&md.file_type());
    if kind != entry.kind {
        return EntryOutcome::Skipped(SkipReason::Changed {
            detail: format!("was {:?}, now {:?}", entry.kind, kind),
        });
    }

    // A parent swapped for a symlink must not redirect the removal.
    let parent_inside = match (
        entry.path.parent().map(fs::canonicalize),
        fs::canonicalize(root),
    ) {
        (Some(Ok(parent)), Ok(root)) => parent.starts_with(&root),
        _ => false,
    };
    if !parent_inside {
        return changed("parent no longer inside category root");
    }

    let current = match kind {
        EntryKind::Directory => {
            // remove_dir_all would descend into mounts the scan never measured.
            let device = fs::metadata(root).map(|r| r.dev()).unwrap_or(md.dev());
            let measure = measure_tree_on(&entry.path, device);
            if let Some(mount) = measure.mount_point() {
                return EntryOutcome::Skipped(SkipReason::MountPoint {
                    path: mount.to_path_buf(),
                });
            }
            measure.size
        }
        EntryKind::File | EntryKind::Symlink => md.len(),
    };
    let result = match kind {
        EntryKind::Directory => fs::remove_dir_all(&entry.path),
        EntryKind::File | EntryKind::Symlink => fs::remove_file(&entry.path),
    };
    match result {
        Ok(()) => EntryOutcome::Removed(current.min(entry.size)),
        Err(err) if err.kind() == ErrorKind::NotFound => EntryOutcome::AlreadyAbsent,
        Err(err) => EntryOutcome::Failed(EntryCleanupFailure::from_io(&entry.path, &err)),
    }
}
