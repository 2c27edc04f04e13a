use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::errors::{CategoryScanError, ScanWarning, ToolError, WarningKind};
use super::external::ExternalToolInvoker;
use super::scanner::{measure_tree, to_utc, Scanner};
use super::types::{
    CacheCategory, CacheEntry, CategoryScan, EntryKind, EntrySource, Footprint, InventoryFormat,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatpakKind {
    App,
    Runtime,
}

impl FlatpakKind {
    fn dir(self) -> &'static str {
        match self {
            FlatpakKind::App => "app",
            FlatpakKind::Runtime => "runtime",
        }
    }
}

/// One `kind/id/arch/branch` line of flatpak output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatpakRef {
    pub kind: FlatpakKind,
    pub id: String,
    pub arch: String,
    pub branch: String,
}

impl FlatpakRef {
    /// Accepts `runtime/org.gnome.Platform/x86_64/45` as well as the
    /// unprefixed `org.gnome.Platform/x86_64/45`, which flatpak prints for
    /// runtimes.
    pub fn parse(line: &str) -> Option<Self> {
        let token = line.split_whitespace().next()?;
        let parts: Vec<&str> = token.split('/').collect();
        let (kind, rest) = match parts.as_slice() {
            ["app", rest @ ..] => (FlatpakKind::App, rest),
            ["runtime", rest @ ..] => (FlatpakKind::Runtime, rest),
            rest => (FlatpakKind::Runtime, rest),
        };
        let [id, arch, branch] = rest else {
            return None;
        };
        let valid = |part: &str| !part.is_empty() && part != "." && part != "..";
        if !id.contains('.') || ![*id, *arch, *branch].into_iter().all(valid) {
            return None;
        }
        Some(FlatpakRef {
            kind,
            id: id.to_string(),
            arch: arch.to_string(),
            branch: branch.to_string(),
        })
    }

    pub fn install_path(&self, installation: &Path) -> PathBuf {
        installation
            .join(self.kind.dir())
            .join(&self.id)
            .join(&self.arch)
            .join(&self.branch)
    }
}

/// Parses `flatpak uninstall --unused --dry-run --columns=ref`. The header
/// row and free-form messages are skipped; duplicates keep first position.
pub fn parse_flatpak_refs(output: &str) -> Vec<FlatpakRef> {
    let mut refs: Vec<FlatpakRef> = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.to_ascii_lowercase().starts_with("ref") {
            continue;
        }
        if let Some(parsed) = FlatpakRef::parse(line) {
            if !refs.contains(&parsed) {
                refs.push(parsed);
            }
        }
    }
    refs
}

lazy_static! {
    static ref APT_REMOVAL: Regex =
        Regex::new(r"^Remv\s+(\S+)(?:\s+\[([^\]]*)\])?").expect("apt removal pattern");
    static ref DEB_PACKAGE: Regex = Regex::new(r"^([a-z0-9][a-z0-9+.\-]+)(?::([a-z0-9\-]+))?$")
        .expect("debian package pattern");
}

/// One `Remv` line of an apt simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptPackage {
    pub name: String,
    pub arch: Option<String>,
    pub version: Option<String>,
}

impl AptPackage {
    /// The dpkg file list recording what the package installed. Multi-arch
    /// packages are listed as `name:arch.list`.
    pub fn file_list(&self, info_dir: &Path) -> PathBuf {
        let plain = info_dir.join(format!("{}.list", self.name));
        if let Some(arch) = &self.arch {
            let qualified = info_dir.join(format!("{}:{}.list", self.name, arch));
            if qualified.exists() {
                return qualified;
            }
        }
        if plain.exists() {
            return plain;
        }
        let prefix = format!("{}:", self.name);
        fs::read_dir(info_dir)
            .ok()
            .and_then(|dir| {
                dir.flatten().map(|e| e.path()).find(|path| {
                    path.extension().map_or(false, |ext| ext == "list")
                        && path
                            .file_name()
                            .and_then(|n| n.to_str())
                            .map_or(false, |n| n.starts_with(&prefix))
                })
            })
            .unwrap_or(plain)
    }
}

/// Parses `apt-get --dry-run autoremove`. Only `Remv` lines name packages;
/// names that are not valid Debian package names are dropped.
pub fn parse_apt_autoremove(output: &str) -> Vec<AptPackage> {
    let mut packages: Vec<AptPackage> = Vec::new();
    for line in output.lines() {
        let Some(caps) = APT_REMOVAL.captures(line.trim()) else {
            continue;
        };
        let Some(name) = DEB_PACKAGE.captures(&caps[1]) else {
            continue;
        };
        let package = AptPackage {
            name: name[1].to_string(),
            arch: name.get(2).map(|m| m.as_str().to_string()),
            version: caps.get(2).map(|m| m.as_str().to_string()),
        };
        if !packages.iter().any(|p| p.name == package.name && p.arch == package.arch) {
            packages.push(package);
        }
    }
    packages
}

/// Bytes of regular files a dpkg `.list` file names. Directories are shared
/// between packages and are not counted.
pub(crate) fn package_footprint(file_list: &Path) -> u64 {
    let Ok(listing) = fs::read_to_string(file_list) else {
        return 0;
    };
    listing
        .lines()
        .filter(|line| line.starts_with('/'))
        .filter_map(|line| fs::symlink_metadata(line).ok())
        .filter(|md| md.is_file())
        .map(|md| md.len())
        .sum()
}

fn locate(format: InventoryFormat, stdout: &str, root: &Path) -> Vec<PathBuf> {
    match format {
        InventoryFormat::FlatpakRefs => parse_flatpak_refs(stdout)
            .iter()
            .map(|r| r.install_path(root))
            .collect(),
        InventoryFormat::AptAutoremove => parse_apt_autoremove(stdout)
            .iter()
            .map(|p| p.file_list(root))
            .collect(),
    }
}

/// Scans a category whose entries come from an external inventory command.
pub(crate) async fn scan_inventory(
    category: &CacheCategory,
    scanner: &Scanner,
    invoker: &ExternalToolInvoker,
    cancel: &CancellationToken,
) -> CategoryScan {
    let EntrySource::Inventory { format, sources } = &category.source else {
        return CategoryScan::empty(category);
    };
    if let Err(err) = scanner.check_roots(category) {
        log::warn!("skipping category {}: {}", category.id, err);
        return CategoryScan::failed(category, err);
    }

    let mut scan = CategoryScan::empty(category);
    let mut listings: Vec<(PathBuf, String)> = Vec::new();
    for source in sources {
        if cancel.is_cancelled() {
            // What earlier sources listed is still reported.
            scan.cancelled = true;
            break;
        }
        let stdout = match invoker.inventory(&source.command).await {
            Ok(stdout) => stdout,
            // Tool not installed: nothing of this kind can exist.
            Err(ToolError::Spawn { source: err, .. }) if err.kind() == io::ErrorKind::NotFound => {
                scan.warnings.push(ScanWarning::new(
                    &source.root,
                    WarningKind::PathMissing,
                    format!("`{}` is not installed", source.command.program),
                ));
                continue;
            }
            Err(err) => {
                log::warn!("inventory for {} failed: {}", category.id, err);
                return CategoryScan::failed(
                    category,
                    CategoryScanError::Inventory {
                        command: source.command.to_string(),
                        message: err.to_string(),
                    },
                );
            }
        };
        listings.push((source.root.clone(), stdout));
    }

    let format = *format;
    let bounds = category.clone();
    let measured = tokio::task::spawn_blocking(move || {
        let located = listings
            .iter()
            .flat_map(|(root, stdout)| locate(format, stdout, root))
            .filter(|path| bounds.contains(path))
            .collect();
        measure_located(located, format.footprint())
    })
    .await;
    let kind = match format.footprint() {
        Footprint::Path => EntryKind::Directory,
        Footprint::PackageFiles => EntryKind::File,
    };
    match measured {
        Ok(items) => {
            for item in items {
                match item {
                    Ok((path, size, newest)) => scan.entries.push(CacheEntry::unclassified(
                        path,
                        kind,
                        size,
                        newest,
                        &category.id,
                    )),
                    Err(warning) => scan.warnings.push(warning),
                }
            }
        }
        Err(err) => {
            return CategoryScan::failed(
                category,
                CategoryScanError::Interrupted {
                    message: err.to_string(),
                },
            )
        }
    }
    log::debug!(
        "inventory {}: {} entries, {} warnings",
        category.id,
        scan.entries.len(),
        scan.warnings.len()
    );
    scan
}

type Located = Result<(PathBuf, u64, chrono::DateTime<chrono::Utc>), ScanWarning>;

fn measure_located(paths: Vec<PathBuf>, footprint: Footprint) -> Vec<Located> {
    paths
        .into_iter()
        .map(|path| {
            let md = fs::symlink_metadata(&path).map_err(|err| {
                ScanWarning::new(
                    &path,
                    WarningKind::PathMissing,
                    format!("listed by inventory but not on disk: {}", err),
                )
            })?;
            if footprint == Footprint::PackageFiles {
                let size = package_footprint(&path);
                return Ok((path, size, to_utc(md.modified().ok())));
            }
            if !md.is_dir() {
                return Err(ScanWarning::new(
                    &path,
                    WarningKind::Io,
                    "listed by inventory but not a directory",
                ));
            }
            let measure = measure_tree(&path);
            Ok((path, measure.size, to_utc(measure.newest)))
        })
        .collect()
}
