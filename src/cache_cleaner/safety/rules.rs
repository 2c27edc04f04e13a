use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::access::can_remove;
use super::protected::ProtectedPaths;
use crate::cache_cleaner::errors::ClassificationError;
use crate::cache_cleaner::process_snapshot::UsageProbe;
use crate::cache_cleaner::types::{CacheCategory, CacheEntry, SafetyTag, TagReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub tag: SafetyTag,
    pub reason: TagReason,
}

impl Classification {
    pub(crate) const fn new(tag: SafetyTag, reason: TagReason) -> Self {
        Classification { tag, reason }
    }
}

/// Classification rules, evaluated in order; the first that applies wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyRule {
    ProtectedPath,
    /// The user cannot unlink the entry; command-driven categories are exempt.
    NotRemovable,
    InUse,
    Fresh,
    CategoryDefault,
}

pub const DEFAULT_RULES: [SafetyRule; 5] = [
    SafetyRule::ProtectedPath,
    SafetyRule::NotRemovable,
    SafetyRule::InUse,
    SafetyRule::Fresh,
    SafetyRule::CategoryDefault,
];

pub(crate) struct RuleInput<'a> {
    pub(crate) entry: &'a CacheEntry,
    pub(crate) category: &'a CacheCategory,
    pub(crate) protected: &'a ProtectedPaths,
    pub(crate) probe: &'a dyn UsageProbe,
    pub(crate) now: DateTime<Utc>,
}

impl SafetyRule {
    pub(crate) fn evaluate(
        self,
        input: &RuleInput<'_>,
    ) -> Result<Option<Classification>, ClassificationError> {
        let entry = input.entry;
        let verdict = match self {
            SafetyRule::ProtectedPath => input
                .protected
                .covers(&entry.path)
                .then_some(Classification::new(SafetyTag::Protected, TagReason::ProtectedPath)),
            SafetyRule::NotRemovable => (!input.category.is_command_driven()
                && !can_remove(&entry.path))
            .then_some(Classification::new(
                SafetyTag::Protected,
                TagReason::NotRemovable,
            )),
            SafetyRule::InUse => {
                let check = |path: &Path| {
                    input.probe.is_in_use(path, entry.kind).map_err(|source| {
                        ClassificationError::Probe {
                            path: entry.path.clone(),
                            source,
                        }
                    })
                };
                // /proc reports resolved targets; a root behind a symlink
                // only matches through its resolved form.
                let in_use = check(&entry.path)?
                    || match resolved_location(&entry.path) {
                        Some(resolved) if resolved != entry.path => check(&resolved)?,
                        _ => false,
                    };
                in_use.then_some(Classification::new(
                    SafetyTag::ConfirmRequired,
                    TagReason::InUse,
                ))
            }
            SafetyRule::Fresh => is_fresh(entry, input.category, input.now).then_some(
                Classification::new(SafetyTag::ConfirmRequired, TagReason::Fresh),
            ),
            SafetyRule::CategoryDefault => Some(Classification::new(
                input.category.default_tier,
                TagReason::CategoryDefault,
            )),
        };
        Ok(verdict)
    }
}

/// The entry's path with its parent directories resolved. The last
/// component is kept so a symlink entry still names the link.
fn resolved_location(path: &Path) -> Option<PathBuf> {
    let parent = fs::canonicalize(path.parent()?).ok()?;
    Some(parent.join(path.file_name()?))
}

/// Modified within the category threshold, or in the future.
fn is_fresh(entry: &CacheEntry, category: &CacheCategory, now: DateTime<Utc>) -> bool {
    match now.signed_duration_since(entry.last_modified).to_std() {
        Ok(age) => age < category.freshness,
        Err(_) => true,
    }
}
