use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::errors::{CategoryScanError, ScanWarning, WarningKind};
use super::types::{
    CacheCategory, CacheEntry, CategoryScan, EntryKind, EntrySource, Granularity, InclusionRule,
};

/// Size and newest mtime of a directory tree, without crossing devices or
/// following symlinks. Directories on another device are reported as
/// `MountPoint` warnings and left unmeasured.
#[derive(Debug, Default)]
pub(crate) struct TreeMeasure {
    pub(crate) size: u64,
    pub(crate) newest: Option<SystemTime>,
    pub(crate) warnings: Vec<ScanWarning>,
}

impl TreeMeasure {
    /// First directory in the tree that belongs to another filesystem.
    pub(crate) fn mount_point(&self) -> Option<&Path> {
        self.warnings
            .iter()
            .find(|w| w.kind == WarningKind::MountPoint)
            .map(|w| w.path.as_path())
    }
}

pub(crate) fn measure_tree(path: &Path) -> TreeMeasure {
    match fs::symlink_metadata(path) {
        Ok(md) => measure_tree_on(path, md.dev()),
        Err(err) => TreeMeasure {
            warnings: vec![ScanWarning::from_io(path, &err)],
            ..TreeMeasure::default()
        },
    }
}

/// Like `measure_tree`, but every directory, `path` included, must live on
/// `device`.
pub(crate) fn measure_tree_on(path: &Path, device: u64) -> TreeMeasure {
    let mut measure = TreeMeasure::default();
    let mut mounts = Vec::new();
    let walker = WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            match entry.metadata() {
                Ok(md) if md.dev() != device => {
                    mounts.push(ScanWarning::new(
                        entry.path(),
                        WarningKind::MountPoint,
                        "different filesystem",
                    ));
                    false
                }
                _ => true,
            }
        });
    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                measure.warnings.push(ScanWarning::from_walk(path, &err));
                continue;
            }
        };
        let Ok(md) = entry.metadata() else {
            continue;
        };
        if !md.is_dir() {
            measure.size += md.len();
        }
        if let Ok(modified) = md.modified() {
            measure.newest = Some(match measure.newest {
                Some(current) if current >= modified => current,
                _ => modified,
            });
        }
    }
    measure.warnings.extend(mounts);
    measure
}

/// Unknown timestamps are treated as "just now", which keeps the entry fresh.
pub(crate) fn to_utc(time: Option<SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from).unwrap_or_else(Utc::now)
}

fn strictly_inside(root: &Path, path: &Path) -> bool {
    path != root && path.starts_with(root)
}

/// Walks filesystem categories and turns matching objects into entries.
#[derive(Debug, Clone)]
pub struct Scanner {
    allowed_bases: Vec<PathBuf>,
}

impl Scanner {
    pub fn new(allowed_bases: &[PathBuf]) -> Self {
        let allowed_bases = allowed_bases
            .iter()
            .map(|base| fs::canonicalize(base).unwrap_or_else(|_| base.clone()))
            .collect();
        Scanner { allowed_bases }
    }

    /// Every root must resolve under an allowed base, otherwise the whole
    /// category is refused.
    pub fn check_roots(&self, category: &CacheCategory) -> Result<(), CategoryScanError> {
        for root in &category.roots {
            let allowed = resolve_root(root)
                .map(|resolved| self.allowed_bases.iter().any(|b| resolved.starts_with(b)))
                .unwrap_or(false);
            if !allowed {
                return Err(CategoryScanError::RootOutsideAllowedBases { root: root.clone() });
            }
        }
        Ok(())
    }

    pub fn scan(&self, category: &CacheCategory, cancel: &CancellationToken) -> CategoryScan {
        let rule = match &category.source {
            EntrySource::Filesystem(rule) => rule,
            EntrySource::Inventory { .. } => return CategoryScan::empty(category),
        };
        if let Err(err) = self.check_roots(category) {
            log::warn!("skipping category {}: {}", category.id, err);
            return CategoryScan::failed(category, err);
        }

        let mut scan = CategoryScan::empty(category);
        for root in &category.roots {
            if cancel.is_cancelled() {
                scan.cancelled = true;
                break;
            }
            let root_md = match fs::metadata(root) {
                Ok(md) => md,
                Err(err) => {
                    scan.warnings.push(ScanWarning::from_io(root, &err));
                    continue;
                }
            };
            match rule.granularity {
                Granularity::Files => {
                    walk_files(category, root, root_md.dev(), rule, cancel, &mut scan)
                }
                Granularity::TopLevel => {
                    list_top_level(category, root, root_md.dev(), rule, cancel, &mut scan)
                }
            }
        }

        log::debug!(
            "scanned {}: {} entries, {} warnings{}",
            category.id,
            scan.entries.len(),
            scan.warnings.len(),
            if scan.cancelled { " (cancelled)" } else { "" }
        );
        scan
    }
}

fn resolve_root(root: &Path) -> Option<PathBuf> {
    if !root.is_absolute() || root.components().any(|c| matches!(c, Component::ParentDir)) {
        return None;
    }
    Some(fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf()))
}

fn walk_files(
    category: &CacheCategory,
    root: &Path,
    root_dev: u64,
    rule: &InclusionRule,
    cancel: &CancellationToken,
    scan: &mut CategoryScan,
) {
    let mut mount_warnings = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .max_depth(rule.max_depth)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            if rule.is_excluded(&entry.file_name().to_string_lossy()) {
                return false;
            }
            match entry.metadata() {
                Ok(md) if md.dev() != root_dev => {
                    mount_warnings.push(ScanWarning::new(
                        entry.path(),
                        WarningKind::MountPoint,
                        "different filesystem",
                    ));
                    false
                }
                _ => true,
            }
        });

    for item in walker {
        if cancel.is_cancelled() {
            scan.cancelled = true;
            break;
        }
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                scan.warnings.push(ScanWarning::from_walk(root, &err));
                continue;
            }
        };
        let file_type = entry.file_type();
        if entry.depth() == 0 || file_type.is_dir() {
            continue;
        }
        let kind = EntryKind::of(&file_type);
        if !rule.matches_name(&entry.file_name().to_string_lossy(), kind) {
            continue;
        }
        // Without follow_links this is the symlink's own metadata.
        let md = match entry.metadata() {
            Ok(md) => md,
            Err(err) => {
                scan.warnings.push(ScanWarning::from_walk(root, &err));
                continue;
            }
        };
        if md.len() < rule.min_size {
            continue;
        }
        let path = entry.into_path();
        if !strictly_inside(root, &path) {
            continue;
        }
        scan.entries.push(CacheEntry::unclassified(
            path,
            kind,
            md.len(),
            to_utc(md.modified().ok()),
            &category.id,
        ));
    }
    scan.warnings.extend(mount_warnings);
}

fn list_top_level(
    category: &CacheCategory,
    root: &Path,
    root_dev: u64,
    rule: &InclusionRule,
    cancel: &CancellationToken,
    scan: &mut CategoryScan,
) {
    let reader = match fs::read_dir(root) {
        Ok(reader) => reader,
        Err(err) => {
            scan.warnings.push(ScanWarning::from_io(root, &err));
            return;
        }
    };
    let mut children: Vec<PathBuf> = Vec::new();
    for item in reader {
        match item {
            Ok(child) => children.push(child.path()),
            Err(err) => scan.warnings.push(ScanWarning::from_io(root, &err)),
        }
    }
    children.sort_by_key(|p| p.file_name().map(|n| n.to_string_lossy().to_lowercase()));

    for path in children {
        if cancel.is_cancelled() {
            scan.cancelled = true;
            break;
        }
        let md = match fs::symlink_metadata(&path) {
            Ok(md) => md,
            Err(err) => {
                scan.warnings.push(ScanWarning::from_io(&path, &err));
                continue;
            }
        };
        let kind = EntryKind::of(&md.file_type());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !rule.matches_name(&name, kind) {
            continue;
        }

        let (size, newest) = if kind == EntryKind::Directory {
            if md.dev() != root_dev {
                scan.warnings.push(ScanWarning::new(
                    &path,
                    WarningKind::MountPoint,
                    "different filesystem",
                ));
                continue;
            }
            let measure = measure_tree(&path);
            scan.warnings.extend(measure.warnings);
            (measure.size, measure.newest.or_else(|| md.modified().ok()))
        } else {
            (md.len(), md.modified().ok())
        };
        if size < rule.min_size || !strictly_inside(root, &path) {
            continue;
        }
        scan.entries.push(CacheEntry::unclassified(
            path,
            kind,
            size,
            to_utc(newest),
            &category.id,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_cleaner::types::{RemovalStrategy, SafetyTag};
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn category(root: &Path, rule: InclusionRule) -> CacheCategory {
        CacheCategory::new(
            "test-cache",
            "Test cache",
            EntrySource::Filesystem(rule),
            RemovalStrategy::FileDelete,
        )
        .with_root(root)
        .with_tier(SafetyTag::AutoSafe)
    }

    fn write(path: &Path, size: usize) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, vec![7u8; size]).unwrap();
    }

    #[test]
    fn files_scan_stays_inside_root_and_records_symlinks() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        let outside = temp.path().join("outside");
        write(&root.join("a.bin"), 100);
        write(&root.join("nested/b.bin"), 50);
        write(&outside.join("secret.txt"), 999);
        symlink(&outside, root.join("escape")).unwrap();

        let scanner = Scanner::new(&[temp.path().to_path_buf()]);
        let scan = scanner.scan(
            &category(&root, InclusionRule::files()),
            &CancellationToken::new(),
        );

        assert!(scan.error.is_none());
        assert!(scan.entries.iter().all(|e| strictly_inside(&root, &e.path)));
        assert!(!scan
            .entries
            .iter()
            .any(|e| e.path.ends_with("secret.txt")));
        let link = scan
            .entries
            .iter()
            .find(|e| e.path.ends_with("escape"))
            .expect("symlink recorded");
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(
            scan.entries
                .iter()
                .filter(|e| e.kind == EntryKind::File)
                .map(|e| e.size)
                .sum::<u64>(),
            150
        );
    }

    #[test]
    fn top_level_scan_sizes_whole_subtrees() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        write(&root.join("pip/http/one"), 300);
        write(&root.join("pip/http/two"), 200);
        write(&root.join("loose.db"), 10);

        let scanner = Scanner::new(&[temp.path().to_path_buf()]);
        let scan = scanner.scan(
            &category(&root, InclusionRule::top_level()),
            &CancellationToken::new(),
        );

        assert_eq!(scan.entries.len(), 2);
        assert_eq!(scan.entries[0].path, root.join("loose.db"));
        assert_eq!(scan.entries[1].path, root.join("pip"));
        assert_eq!(scan.entries[1].kind, EntryKind::Directory);
        assert_eq!(scan.entries[1].size, 500);
    }

    #[test]
    fn root_outside_allowed_bases_is_fatal() {
        let allowed = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        write(&elsewhere.path().join("data.bin"), 10);

        let scanner = Scanner::new(&[allowed.path().to_path_buf()]);
        let scan = scanner.scan(
            &category(elsewhere.path(), InclusionRule::files()),
            &CancellationToken::new(),
        );

        assert!(scan.entries.is_empty());
        assert!(matches!(
            scan.error,
            Some(CategoryScanError::RootOutsideAllowedBases { .. })
        ));
    }

    #[test]
    fn symlinked_root_escaping_bases_is_fatal() {
        let allowed = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let link = allowed.path().join("cache");
        symlink(elsewhere.path(), &link).unwrap();

        let scanner = Scanner::new(&[allowed.path().to_path_buf()]);
        let result = scanner.check_roots(&category(&link, InclusionRule::files()));
        assert!(result.is_err());
    }

    #[test]
    fn relative_or_dotted_roots_are_refused() {
        let scanner = Scanner::new(&[PathBuf::from("/tmp")]);
        assert!(scanner
            .check_roots(&category(Path::new("/tmp/../etc"), InclusionRule::files()))
            .is_err());
        assert!(scanner
            .check_roots(&category(Path::new("cache"), InclusionRule::files()))
            .is_err());
    }

    #[test]
    fn missing_root_is_a_warning() {
        let temp = TempDir::new().unwrap();
        let scanner = Scanner::new(&[temp.path().to_path_buf()]);
        let scan = scanner.scan(
            &category(&temp.path().join("absent"), InclusionRule::files()),
            &CancellationToken::new(),
        );
        assert!(scan.error.is_none());
        assert_eq!(scan.warnings.len(), 1);
        assert_eq!(scan.warnings[0].kind, WarningKind::PathMissing);
    }

    #[test]
    fn excluded_directories_are_not_descended() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("log");
        write(&root.join("syslog.1"), 10);
        write(&root.join("journal/old.1"), 10);

        let rule = InclusionRule::files().exclude(&["journal"]);
        let scanner = Scanner::new(&[temp.path().to_path_buf()]);
        let scan = scanner.scan(&category(&root, rule), &CancellationToken::new());

        assert_eq!(scan.entries.len(), 1);
        assert!(scan.entries[0].path.ends_with("syslog.1"));
    }

    #[test]
    fn cancelled_scan_returns_partial_result() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        write(&root.join("a"), 1);
        let token = CancellationToken::new();
        token.cancel();

        let scanner = Scanner::new(&[temp.path().to_path_buf()]);
        let scan = scanner.scan(&category(&root, InclusionRule::files()), &token);
        assert!(scan.cancelled);
        assert!(scan.entries.is_empty());
    }

    fn device_of(path: &Path) -> u64 {
        fs::metadata(path).unwrap().dev()
    }

    #[test]
    fn subdirectories_on_another_device_are_warned_not_walked() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        write(&root.join("top.bin"), 10);
        write(&root.join("nested/inner.bin"), 20);
        let category = category(&root, InclusionRule::files());
        let EntrySource::Filesystem(rule) = &category.source else {
            unreachable!()
        };

        // Pretend the root lives on a different device than its children.
        let mut scan = CategoryScan::empty(&category);
        let foreign = device_of(&root).wrapping_add(1);
        walk_files(&category, &root, foreign, rule, &CancellationToken::new(), &mut scan);

        assert!(scan.entries.iter().any(|e| e.path.ends_with("top.bin")));
        assert!(!scan.entries.iter().any(|e| e.path.ends_with("inner.bin")));
        assert!(scan
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::MountPoint && w.path == root.join("nested")));
    }

    #[test]
    fn top_level_directories_on_another_device_are_warned() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tmp");
        write(&root.join("build/obj.o"), 30);
        write(&root.join("loose"), 5);
        let category = category(&root, InclusionRule::top_level());
        let EntrySource::Filesystem(rule) = &category.source else {
            unreachable!()
        };

        let mut scan = CategoryScan::empty(&category);
        let foreign = device_of(&root).wrapping_add(1);
        list_top_level(&category, &root, foreign, rule, &CancellationToken::new(), &mut scan);

        assert_eq!(scan.entries.len(), 1);
        assert!(scan.entries[0].path.ends_with("loose"));
        assert_eq!(scan.warnings.len(), 1);
        assert_eq!(scan.warnings[0].kind, WarningKind::MountPoint);
    }

    #[test]
    fn measure_on_foreign_device_reports_the_mount() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("d");
        write(&dir.join("x"), 4);

        let measure = measure_tree_on(&dir, device_of(&dir).wrapping_add(1));
        assert_eq!(measure.size, 0);
        assert_eq!(measure.mount_point(), Some(dir.as_path()));
        assert!(measure_tree(&dir).mount_point().is_none());
    }

    #[test]
    fn real_mount_inside_a_root_is_not_traversed() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tmp");
        let mnt = root.join("build/mnt");
        fs::create_dir_all(&mnt).unwrap();
        write(&root.join("build/obj.o"), 50);
        let mounted = std::process::Command::new("mount")
            .args(["-t", "tmpfs", "tmpfs"])
            .arg(&mnt)
            .stderr(std::process::Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if !mounted {
            // Needs privileges to mount; nothing to check here.
            return;
        }
        fs::write(mnt.join("precious.db"), vec![1u8; 4000]).unwrap();

        let scanner = Scanner::new(&[temp.path().to_path_buf()]);
        let scan = scanner.scan(
            &category(&root, InclusionRule::top_level()),
            &CancellationToken::new(),
        );
        let _ = std::process::Command::new("umount").arg(&mnt).status();

        assert_eq!(scan.entries.len(), 1);
        assert_eq!(scan.entries[0].size, 50);
        assert!(scan
            .warnings
            .iter()
            .any(|w| w.kind == WarningKind::MountPoint && w.path == mnt));
    }

    #[test]
    fn measure_tree_reports_newest_mtime() {
        let temp = TempDir::new().unwrap();
        write(&temp.path().join("d/x"), 4);
        write(&temp.path().join("d/y"), 6);
        let measure = measure_tree(&temp.path().join("d"));
        assert_eq!(measure.size, 10);
        assert!(measure.newest.is_some());
        assert!(measure.warnings.is_empty());
    }
}
