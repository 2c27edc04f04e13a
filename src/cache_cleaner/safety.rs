mod access;
mod protected;
mod rules;

use std::sync::Arc;

use chrono::{DateTime, Utc};
#[cfg(feature = "parallel-scan")]
use rayon::prelude::*;

use protected::ProtectedPaths;
pub use rules::{Classification, SafetyRule, DEFAULT_RULES};
use rules::RuleInput;

use super::errors::{ClassificationError, ProbeError};
use super::process_snapshot::UsageProbe;
use super::registry::CacheLocationRegistry;
use super::types::{CacheCategory, CacheEntry, CategoryScan, SafetyTag, TagReason};
use crate::config::EngineConfig;

const UNCLASSIFIABLE: Classification =
    Classification::new(SafetyTag::ConfirmRequired, TagReason::Unclassifiable);

pub struct SafetyClassifier {
    rules: Vec<SafetyRule>,
    protected: ProtectedPaths,
    probe: Arc<dyn UsageProbe>,
}

impl SafetyClassifier {
    pub fn new(
        registry: &CacheLocationRegistry,
        config: &EngineConfig,
        probe: Arc<dyn UsageProbe>,
    ) -> Self {
        SafetyClassifier {
            rules: DEFAULT_RULES.to_vec(),
            protected: ProtectedPaths::new(registry.all_roots(), &config.protected_paths),
            probe,
        }
    }

    pub fn rules(&self) -> &[SafetyRule] {
        &self.rules
    }

    /// Refreshes the usage probe; blocking.
    pub fn refresh_probe(&self) -> Result<(), ProbeError> {
        self.probe.refresh()
    }

    pub fn try_classify(
        &self,
        entry: &CacheEntry,
        category: &CacheCategory,
        now: DateTime<Utc>,
    ) -> Result<Classification, ClassificationError> {
        let input = RuleInput {
            entry,
            category,
            protected: &self.protected,
            probe: self.probe.as_ref(),
            now,
        };
        for rule in &self.rules {
            if let Some(verdict) = rule.evaluate(&input)? {
                return Ok(verdict);
            }
        }
        Ok(Classification::new(category.default_tier, TagReason::CategoryDefault))
    }

    /// Never fails: an entry that cannot be judged needs confirmation.
    pub fn classify(
        &self,
        entry: &CacheEntry,
        category: &CacheCategory,
        now: DateTime<Utc>,
    ) -> Classification {
        self.try_classify(entry, category, now)
            .unwrap_or_else(|err| {
                log::debug!("{}", err);
                UNCLASSIFIABLE
            })
    }

    /// Tags every entry of one category scan in place.
    pub fn classify_scan(&self, scan: &mut CategoryScan, category: &CacheCategory, now: DateTime<Utc>) {
        let apply = |entry: &mut CacheEntry| {
            let verdict = self.classify(entry, category, now);
            entry.tag = verdict.tag;
            entry.reason = verdict.reason;
        };
        #[cfg(feature = "parallel-scan")]
        scan.entries.par_iter_mut().for_each(apply);
        #[cfg(not(feature = "parallel-scan"))]
        scan.entries.iter_mut().for_each(apply);
    }

    /// Tags every entry of a full scan. Categories unknown to `registry`
    /// fall back to `ConfirmRequired`.
    pub fn classify_all(
        &self,
        scans: &mut [CategoryScan],
        registry: &CacheLocationRegistry,
        now: DateTime<Utc>,
    ) {
        for scan in scans.iter_mut() {
            match registry.find(scan.category.as_str()) {
                Some(category) => self.classify_scan(scan, category, now),
                None => scan.entries.iter_mut().for_each(|entry| {
                    entry.tag = UNCLASSIFIABLE.tag;
                    entry.reason = UNCLASSIFIABLE.reason;
                }),
            }
        }
    }
}
