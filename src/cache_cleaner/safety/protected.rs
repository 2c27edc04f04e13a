use std::fs;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;

lazy_static! {
    static ref SYSTEM_DIRS: Vec<PathBuf> = [
        "/", "/bin", "/boot", "/dev", "/etc", "/home", "/lib", "/lib64", "/opt", "/proc",
        "/root", "/run", "/sbin", "/srv", "/sys", "/usr", "/var", "/var/cache", "/var/lib",
        "/var/log", "/var/tmp", "/tmp", "/var/lib/flatpak", "/var/cache/apt",
        "/var/log/journal",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();
}

/// Paths that must never be removed, nor any of their ancestors.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProtectedPaths {
    paths: Vec<PathBuf>,
}

impl ProtectedPaths {
    pub(crate) fn new<'a>(
        roots: impl IntoIterator<Item = &'a Path>,
        extra: &[PathBuf],
    ) -> Self {
        let mut paths: Vec<PathBuf> = SYSTEM_DIRS.clone();
        paths.extend(roots.into_iter().map(Path::to_path_buf));
        paths.extend(extra.iter().cloned());

        // Scans report lexical paths; protect the resolved form as well.
        let resolved: Vec<PathBuf> = paths
            .iter()
            .filter_map(|p| fs::canonicalize(p).ok())
            .filter(|p| !paths.contains(p))
            .collect();
        paths.extend(resolved);
        paths.sort();
        paths.dedup();
        ProtectedPaths { paths }
    }

    /// True when `path` is a protected path or one of its ancestors.
    pub(crate) fn covers(&self, path: &Path) -> bool {
        self.paths.iter().any(|protected| protected.starts_with(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_of_protected_paths_are_covered() {
        let protected = ProtectedPaths::new(
            [Path::new("/home/u/.cache/thumbnails")],
            &[PathBuf::from("/home/u")],
        );
        assert!(protected.covers(Path::new("/home/u/.cache/thumbnails")));
        assert!(protected.covers(Path::new("/home/u/.cache")));
        assert!(protected.covers(Path::new("/var/log")));
        assert!(!protected.covers(Path::new("/home/u/.cache/thumbnails/large")));
        assert!(!protected.covers(Path::new("/var/log/syslog.1")));
    }
}
