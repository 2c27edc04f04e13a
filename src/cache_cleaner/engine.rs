use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use bytesize::ByteSize;
use chrono::Utc;
use futures::future::join_all;
use lru::LruCache;
#[cfg(feature = "parallel-scan")]
use rayon::prelude::*;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::cleaner::{CategoryPlan, Cleaner, CleanupReport, SkipReason, SkippedEntry};
use super::errors::{CategoryScanError, PreconditionViolation, SetupError};
use super::external::{ExternalToolInvoker, HostEnvironment, SystemToolRunner, ToolRunner};
use super::inventory::scan_inventory;
use super::preview::{PreviewEngine, PreviewReport};
use super::process_snapshot::{ProcUsageProbe, UsageProbe};
use super::registry::{BaseDirs, CacheLocationRegistry};
use super::safety::SafetyClassifier;
use super::scanner::Scanner;
use super::selection::Selection;
use super::types::{
    CacheCategory, CacheEntry, CategoryId, CategoryScan, EntrySource, SafetyTag, ScanResult,
};
use crate::config::EngineConfig;

/// Entry point for a presentation layer: scan, preview, clean.
pub struct CleanupEngine {
    registry: Arc<CacheLocationRegistry>,
    config: EngineConfig,
    scanner: Scanner,
    classifier: Arc<SafetyClassifier>,
    invoker: Arc<ExternalToolInvoker>,
    cleaner: Cleaner,
    scan_pool: Option<Arc<rayon::ThreadPool>>,
    // Recent scans clean() accepts selections from.
    ledger: Mutex<LruCache<Uuid, Arc<ScanResult>>>,
}

impl CleanupEngine {
    pub fn new(registry: CacheLocationRegistry, config: EngineConfig) -> Self {
        Self::with_capabilities(
            registry,
            config,
            Arc::new(ProcUsageProbe::new()),
            Arc::new(SystemToolRunner),
        )
    }

    /// Engine with injected usage probe and tool runner.
    pub fn with_capabilities(
        registry: CacheLocationRegistry,
        config: EngineConfig,
        probe: Arc<dyn UsageProbe>,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        let classifier = Arc::new(SafetyClassifier::new(&registry, &config, probe));
        let invoker = Arc::new(ExternalToolInvoker::new(runner, config.tool_timeout));
        let capacity = NonZeroUsize::new(config.ledger_capacity).unwrap_or(NonZeroUsize::MIN);
        CleanupEngine {
            scanner: Scanner::new(&config.allowed_bases),
            cleaner: Cleaner::new(invoker.clone(), config.clean_workers),
            scan_pool: build_scan_pool(config.scan_workers),
            registry: Arc::new(registry),
            classifier,
            invoker,
            ledger: Mutex::new(LruCache::new(capacity)),
            config,
        }
    }

    /// Compiled-in Linux catalog for the current user, with environment overrides.
    pub fn for_current_user() -> Result<Self, SetupError> {
        let dirs = BaseDirs::detect()?;
        let config = EngineConfig::for_dirs(&dirs).with_env_overrides();
        let host = HostEnvironment::detect(&config);
        let registry = CacheLocationRegistry::linux(&dirs, host);
        Ok(Self::new(registry, config))
    }

    pub fn registry(&self) -> &CacheLocationRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn classifier(&self) -> &SafetyClassifier {
        &self.classifier
    }

    /// Scans and classifies every registered category. The result is kept in
    /// the ledger so a selection built from it can be cleaned.
    pub async fn scan(&self, cancel: &CancellationToken) -> ScanResult {
        let id = Uuid::new_v4();
        let started = std::time::Instant::now();
        let categories = self.registry.list_categories();

        let filesystem = {
            let scanner = self.scanner.clone();
            let registry = self.registry.clone();
            let cancel = cancel.clone();
            let pool = self.scan_pool.clone();
            tokio::task::spawn_blocking(move || {
                scan_filesystem(&scanner, &registry, pool.as_deref(), &cancel)
            })
        };
        let inventories = join_all(
            categories
                .iter()
                .enumerate()
                .filter(|(_, c)| matches!(c.source, EntrySource::Inventory { .. }))
                .map(|(index, category)| async move {
                    (
                        index,
                        scan_inventory(category, &self.scanner, &self.invoker, cancel).await,
                    )
                }),
        );
        let (filesystem, inventories) = tokio::join!(filesystem, inventories);

        let mut slots: Vec<Option<CategoryScan>> = vec![None; categories.len()];
        match filesystem {
            Ok(found) => found.into_iter().for_each(|(i, scan)| slots[i] = Some(scan)),
            Err(err) => log::warn!("filesystem scan worker stopped: {}", err),
        }
        inventories
            .into_iter()
            .for_each(|(i, scan)| slots[i] = Some(scan));
        let mut scans: Vec<CategoryScan> = slots
            .into_iter()
            .zip(categories)
            .map(|(slot, category)| {
                slot.unwrap_or_else(|| {
                    CategoryScan::failed(
                        category,
                        CategoryScanError::Interrupted {
                            message: "scan worker did not report".into(),
                        },
                    )
                })
            })
            .collect();

        if let Err(err) = self.refresh_probe().await {
            log::warn!("usage probe unavailable, entries need confirmation: {}", err);
        }
        let now = Utc::now();
        let classifier = self.classifier.clone();
        let registry = self.registry.clone();
        scans = match tokio::task::spawn_blocking(move || {
            classifier.classify_all(&mut scans, &registry, now);
            scans
        })
        .await
        {
            Ok(scans) => scans,
            Err(err) => {
                log::warn!("classification worker stopped: {}", err);
                categories
                    .iter()
                    .map(|category| {
                        CategoryScan::failed(
                            category,
                            CategoryScanError::Interrupted {
                                message: format!("classification stopped: {}", err),
                            },
                        )
                    })
                    .collect()
            }
        };

        let result = ScanResult {
            id,
            scanned_at: now,
            cancelled: scans.iter().any(|s| s.cancelled),
            categories: scans,
        };
        log::info!(
            "scan {} finished in {:?}: {} entries, {}",
            id,
            started.elapsed(),
            result.entries().count(),
            ByteSize::b(result.total_bytes())
        );
        self.ledger.lock().await.put(id, Arc::new(result.clone()));
        result
    }

    async fn refresh_probe(&self) -> Result<(), String> {
        let classifier = self.classifier.clone();
        match tokio::task::spawn_blocking(move || classifier.refresh_probe()).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    pub fn preview(&self, scan: &ScanResult) -> PreviewReport {
        PreviewEngine::preview(scan)
    }

    /// Removes the selected entries. Fails closed, before touching the disk,
    /// when the selection does not match a scan this engine produced.
    pub async fn clean(
        &self,
        selection: &Selection,
        cancel: &CancellationToken,
    ) -> Result<CleanupReport, PreconditionViolation> {
        let scan = self
            .ledger
            .lock()
            .await
            .get(&selection.scan_id)
            .cloned()
            .ok_or(PreconditionViolation::UnknownScan {
                scan_id: selection.scan_id,
            })?;
        let plans = self.plan(&scan, selection)?;
        log::info!(
            "cleaning {} entries from scan {} across {} categories",
            selection.len(),
            scan.id,
            plans.len()
        );
        Ok(self.cleaner.execute(scan.id, plans, cancel).await)
    }

    /// Drops a scan from the ledger; later selections from it are refused.
    pub async fn forget(&self, scan_id: Uuid) -> bool {
        self.ledger.lock().await.pop(&scan_id).is_some()
    }

    fn plan(
        &self,
        scan: &ScanResult,
        selection: &Selection,
    ) -> Result<Vec<CategoryPlan>, PreconditionViolation> {
        let recorded: HashMap<&Path, &CacheEntry> =
            scan.entries().map(|e| (e.path.as_path(), e)).collect();
        let mut seen: HashSet<&Path> = HashSet::new();
        let mut chosen: HashMap<&CategoryId, Vec<(&CacheEntry, bool)>> = HashMap::new();

        for item in selection.items() {
            let claimed = &item.entry;
            let category = self.registry.find(claimed.category.as_str()).ok_or_else(|| {
                PreconditionViolation::UnknownCategory {
                    category: claimed.category.clone(),
                    path: claimed.path.clone(),
                }
            })?;
            // The ledger copy is authoritative for tag, size and kind.
            let entry = recorded
                .get(claimed.path.as_path())
                .copied()
                .filter(|e| e.category == category.id)
                .ok_or_else(|| PreconditionViolation::EntryNotFromScan {
                    scan_id: scan.id,
                    path: claimed.path.clone(),
                })?;
            if !category.contains(&entry.path) {
                return Err(PreconditionViolation::OutsideCategory {
                    category: category.id.clone(),
                    path: entry.path.clone(),
                });
            }
            if seen.insert(entry.path.as_path()) {
                chosen
                    .entry(&entry.category)
                    .or_default()
                    .push((entry, item.confirmed));
            }
        }

        let mut plans = Vec::new();
        for category in self.registry.list_categories() {
            let Some(items) = chosen.remove(&category.id) else {
                continue;
            };
            let mut plan = CategoryPlan {
                category: category.clone(),
                remove: Vec::new(),
                skipped: Vec::new(),
            };
            for (entry, confirmed) in items {
                match entry.tag {
                    SafetyTag::Protected => plan
                        .skipped
                        .push(SkippedEntry::new(&entry.path, SkipReason::Protected)),
                    SafetyTag::ConfirmRequired if !confirmed => plan
                        .skipped
                        .push(SkippedEntry::new(&entry.path, SkipReason::NotConfirmed)),
                    SafetyTag::AutoSafe | SafetyTag::ConfirmRequired => {
                        plan.remove.push(entry.clone())
                    }
                }
            }
            if category.is_command_driven() && !plan.remove.is_empty() {
                let planned: HashSet<&Path> =
                    plan.remove.iter().map(|e| e.path.as_path()).collect();
                let complete = scan
                    .category(category.id.as_str())
                    .map(|found| {
                        found
                            .entries
                            .iter()
                            .filter(|e| e.tag != SafetyTag::Protected)
                            .all(|e| planned.contains(e.path.as_path()))
                    })
                    .unwrap_or(false);
                if !complete {
                    let partial = std::mem::take(&mut plan.remove);
                    plan.skipped.extend(partial.into_iter().map(|e| {
                        SkippedEntry::new(e.path, SkipReason::IncompleteCommandSelection)
                    }));
                }
            }
            plans.push(plan);
        }
        Ok(plans)
    }
}

fn build_scan_pool(workers: usize) -> Option<Arc<rayon::ThreadPool>> {
    if !cfg!(feature = "parallel-scan") {
        return None;
    }
    match rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("cache-scan-{}", i))
        .build()
    {
        Ok(pool) => Some(Arc::new(pool)),
        Err(err) => {
            log::warn!("scan pool unavailable, scanning sequentially: {}", err);
            None
        }
    }
}

fn scan_filesystem(
    scanner: &Scanner,
    registry: &CacheLocationRegistry,
    pool: Option<&rayon::ThreadPool>,
    cancel: &CancellationToken,
) -> Vec<(usize, CategoryScan)> {
    let work: Vec<(usize, &CacheCategory)> = registry
        .list_categories()
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c.source, EntrySource::Filesystem(_)))
        .collect();
    match pool {
        #[cfg(feature = "parallel-scan")]
        Some(pool) => pool.install(|| {
            work.par_iter()
                .map(|(i, category)| (*i, scanner.scan(category, cancel)))
                .collect::<Vec<_>>()
        }),
        _ => work
            .iter()
            .map(|(i, category)| (*i, scanner.scan(category, cancel)))
            .collect(),
    }
}
