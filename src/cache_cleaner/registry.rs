use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use super::errors::SetupError;
use super::external::HostEnvironment;
use super::types::{
    CacheCategory, EntrySource, InclusionRule, InventoryFormat, InventorySource, RemovalStrategy,
    SafetyTag,
};

const HOUR: Duration = Duration::from_secs(60 * 60);

/// Freshness thresholds per kind of data.
pub const REGENERABLE_CACHE_FRESHNESS: Duration = Duration::from_secs(5 * 60);
pub const USER_CACHE_FRESHNESS: Duration = HOUR;
pub const LOG_FRESHNESS: Duration = HOUR;
pub const TEMP_FRESHNESS: Duration = Duration::from_secs(24 * 60 * 60);

lazy_static! {
    static ref ARCHIVED_JOURNAL: Regex =
        Regex::new(r"(@.+\.journal|\.journal~)$").expect("archived journal pattern");
    static ref ROTATED_LOG: Regex =
        Regex::new(r"\.(\d+|gz|xz|bz2|zst|old)$").expect("rotated log pattern");
}

/// Cache subdirectories handled by dedicated categories; the general
/// `~/.cache` sweep leaves them alone.
const DEDICATED_CACHE_DIRS: &[&str] = &[
    "thumbnails",
    "WebKitGTK",
    "webkitgtk",
    "fontconfig",
    "mesa_shader_cache",
];

const DPKG_INFO: &str = "/var/lib/dpkg/info";

/// Per-user directories the catalog resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseDirs {
    pub home: PathBuf,
    /// `$XDG_CACHE_HOME`, usually `~/.cache`.
    pub cache: PathBuf,
    /// `$XDG_DATA_HOME`, usually `~/.local/share`.
    pub data: PathBuf,
}

impl BaseDirs {
    pub fn detect() -> Result<Self, SetupError> {
        let home = dirs::home_dir().ok_or(SetupError::NoHomeDirectory)?;
        let cache = dirs::cache_dir().unwrap_or_else(|| home.join(".cache"));
        let data = dirs::data_dir().unwrap_or_else(|| home.join(".local").join("share"));
        Ok(BaseDirs { home, cache, data })
    }

    pub fn rooted_at(home: impl AsRef<Path>) -> Self {
        let home = home.as_ref().to_path_buf();
        BaseDirs {
            cache: home.join(".cache"),
            data: home.join(".local").join("share"),
            home,
        }
    }
}

/// Ordered, immutable catalog of cache categories.
#[derive(Debug, Clone)]
pub struct CacheLocationRegistry {
    categories: Vec<CacheCategory>,
}

impl CacheLocationRegistry {
    pub fn new(categories: Vec<CacheCategory>) -> Self {
        CacheLocationRegistry { categories }
    }

    pub fn list_categories(&self) -> &[CacheCategory] {
        &self.categories
    }

    pub fn find(&self, id: &str) -> Option<&CacheCategory> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn all_roots(&self) -> impl Iterator<Item = &Path> {
        self.categories
            .iter()
            .flat_map(|c| c.roots.iter().map(PathBuf::as_path))
    }

    /// The compiled-in catalog for a Linux desktop.
    pub fn linux(dirs: &BaseDirs, host: HostEnvironment) -> Self {
        let cache = &dirs.cache;
        let mut categories = vec![
            CacheCategory::new(
                "thumbnail-cache",
                "Thumbnail cache",
                EntrySource::Filesystem(InclusionRule::files().max_depth(4)),
                RemovalStrategy::FileDelete,
            )
            .with_root(cache.join("thumbnails"))
            .with_tier(SafetyTag::AutoSafe)
            .with_freshness(REGENERABLE_CACHE_FRESHNESS),
            CacheCategory::new(
                "webkit-cache",
                "WebKitGTK caches",
                EntrySource::Filesystem(InclusionRule::top_level()),
                RemovalStrategy::DirectoryPrune,
            )
            .with_root(cache.join("WebKitGTK"))
            .with_root(cache.join("webkitgtk"))
            .with_tier(SafetyTag::AutoSafe)
            .with_freshness(REGENERABLE_CACHE_FRESHNESS),
            CacheCategory::new(
                "fontconfig-cache",
                "Fontconfig cache",
                EntrySource::Filesystem(InclusionRule::files().max_depth(2)),
                RemovalStrategy::FileDelete,
            )
            .with_root(cache.join("fontconfig"))
            .with_tier(SafetyTag::AutoSafe)
            .with_freshness(REGENERABLE_CACHE_FRESHNESS),
            CacheCategory::new(
                "mesa-shader-cache",
                "Mesa shader cache",
                EntrySource::Filesystem(InclusionRule::top_level()),
                RemovalStrategy::DirectoryPrune,
            )
            .with_root(cache.join("mesa_shader_cache"))
            .with_tier(SafetyTag::AutoSafe)
            .with_freshness(REGENERABLE_CACHE_FRESHNESS),
            CacheCategory::new(
                "user-cache",
                "Other application caches",
                EntrySource::Filesystem(InclusionRule::top_level().exclude(DEDICATED_CACHE_DIRS)),
                RemovalStrategy::DirectoryPrune,
            )
            .with_root(cache.clone())
            .with_tier(SafetyTag::ConfirmRequired)
            .with_freshness(USER_CACHE_FRESHNESS),
            flatpak_app_caches(dirs),
            CacheCategory::new(
                "apt-archives",
                "APT package archives",
                EntrySource::Filesystem(
                    InclusionRule::files().max_depth(2).extensions(&["deb"]),
                ),
                RemovalStrategy::ExternalCommand(vec![host.command("apt-get", &["clean"], true)]),
            )
            .with_root("/var/cache/apt/archives")
            .with_tier(SafetyTag::AutoSafe)
            .with_freshness(REGENERABLE_CACHE_FRESHNESS),
            flatpak_unused(dirs, host),
            CacheCategory::new(
                "journal-logs",
                "Archived systemd journals",
                EntrySource::Filesystem(
                    InclusionRule::files()
                        .max_depth(3)
                        .pattern(ARCHIVED_JOURNAL.clone()),
                ),
                RemovalStrategy::FileDelete,
            )
            .with_root("/var/log/journal")
            .with_tier(SafetyTag::ConfirmRequired)
            .with_freshness(LOG_FRESHNESS),
            CacheCategory::new(
                "rotated-logs",
                "Rotated system logs",
                EntrySource::Filesystem(
                    InclusionRule::files()
                        .max_depth(4)
                        .pattern(ROTATED_LOG.clone())
                        .exclude(&["journal"]),
                ),
                RemovalStrategy::FileDelete,
            )
            .with_root("/var/log")
            .with_tier(SafetyTag::ConfirmRequired)
            .with_freshness(LOG_FRESHNESS),
            CacheCategory::new(
                "tmp-files",
                "Temporary files",
                EntrySource::Filesystem(InclusionRule::top_level().exclude(&[
                    "systemd-private-*",
                    ".X*",
                    ".ICE-unix",
                    ".font-unix",
                    ".Test-unix",
                ])),
                RemovalStrategy::DirectoryPrune,
            )
            .with_root("/tmp")
            .with_root("/var/tmp")
            .with_tier(SafetyTag::ConfirmRequired)
            .with_freshness(TEMP_FRESHNESS),
        ];
        if host.sandboxed {
            // XDG_CACHE_HOME points into the sandbox; the host cache sits under the real home.
            let host_cache = dirs.home.join(".cache");
            if host_cache != *cache && host_cache.is_dir() {
                if let Some(sweep) = categories.iter_mut().find(|c| c.id == "user-cache") {
                    sweep.roots.push(host_cache);
                }
            }
        } else {
            // dpkg's records are not visible from inside a sandbox.
            let position = categories
                .iter()
                .position(|c| c.id == "apt-archives")
                .map_or(categories.len(), |i| i + 1);
            categories.insert(position, apt_autoremove(host));
        }
        CacheLocationRegistry { categories }
    }
}

/// Per-application caches of Flatpak apps, `~/.var/app/<id>/cache`. The
/// running process's own cache is left to the `user-cache` sweep.
fn flatpak_app_caches(dirs: &BaseDirs) -> CacheCategory {
    let own = fs::canonicalize(&dirs.cache).unwrap_or_else(|_| dirs.cache.clone());
    let mut roots: Vec<PathBuf> = fs::read_dir(dirs.home.join(".var").join("app"))
        .map(|apps| {
            apps.flatten()
                .map(|app| app.path().join("cache"))
                .filter(|cache| cache.is_dir())
                .filter(|cache| {
                    *cache != dirs.cache
                        && fs::canonicalize(cache).map_or(true, |resolved| resolved != own)
                })
                .collect()
        })
        .unwrap_or_default();
    roots.sort();

    let mut category = CacheCategory::new(
        "flatpak-app-caches",
        "Flatpak application caches",
        EntrySource::Filesystem(InclusionRule::top_level()),
        RemovalStrategy::DirectoryPrune,
    )
    .with_tier(SafetyTag::ConfirmRequired)
    .with_freshness(USER_CACHE_FRESHNESS);
    category.roots = roots;
    category
}

fn apt_autoremove(host: HostEnvironment) -> CacheCategory {
    CacheCategory::new(
        "apt-autoremove",
        "Automatically installed packages no longer needed",
        EntrySource::Inventory {
            format: InventoryFormat::AptAutoremove,
            sources: vec![InventorySource {
                command: host.command("apt-get", &["--dry-run", "autoremove"], false),
                root: PathBuf::from(DPKG_INFO),
            }],
        },
        RemovalStrategy::ExternalCommand(vec![host.command(
            "apt-get",
            &["autoremove", "-y"],
            true,
        )]),
    )
    .with_root(DPKG_INFO)
    .with_tier(SafetyTag::ConfirmRequired)
    .with_freshness(Duration::ZERO)
}

fn flatpak_unused(dirs: &BaseDirs, host: HostEnvironment) -> CacheCategory {
    let user_root = dirs.data.join("flatpak");
    let system_root = PathBuf::from("/var/lib/flatpak");
    let dry_run = |scope: &str| {
        host.command(
            "flatpak",
            &["uninstall", "--unused", "--dry-run", scope, "--columns=ref"],
            false,
        )
    };
    // flatpak asks polkit itself for the system installation.
    let uninstall =
        |scope: &str| host.command("flatpak", &["uninstall", "--unused", scope, "-y"], false);

    CacheCategory::new(
        "flatpak-unused",
        "Unused Flatpak runtimes",
        EntrySource::Inventory {
            format: InventoryFormat::FlatpakRefs,
            sources: vec![
                InventorySource {
                    command: dry_run("--user"),
                    root: user_root.clone(),
                },
                InventorySource {
                    command: dry_run("--system"),
                    root: system_root.clone(),
                },
            ],
        },
        RemovalStrategy::ExternalCommand(vec![uninstall("--user"), uninstall("--system")]),
    )
    .with_root(user_root)
    .with_root(system_root)
    .with_tier(SafetyTag::AutoSafe)
    .with_freshness(Duration::ZERO)
}
