use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

const STICKY: u32 = 0o1000;

/// Whether the effective user may unlink `path` from its parent directory.
///
/// Missing paths count as removable; the cleaner reports them as gone.
pub(crate) fn can_remove(path: &Path) -> bool {
    let Some(parent) = path.parent() else {
        return false;
    };
    let parent_dir = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };
    if !parent_writable(parent_dir) {
        return false;
    }
    let (Ok(dir_md), Ok(md)) = (fs::metadata(parent_dir), fs::symlink_metadata(path)) else {
        return true;
    };
    !sticky_denies(dir_md.mode(), dir_md.uid(), md.uid(), effective_uid())
}

fn parent_writable(dir: &Path) -> bool {
    let Ok(c_path) = CString::new(dir.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the call's duration.
    let rc = unsafe {
        libc::faccessat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            libc::W_OK | libc::X_OK,
            libc::AT_EACCESS,
        )
    };
    if rc == 0 {
        return true;
    }
    !matches!(
        io::Error::last_os_error().raw_os_error(),
        Some(libc::EACCES) | Some(libc::EPERM) | Some(libc::EROFS)
    )
}

/// In a sticky directory only the owner of the entry or of the directory
/// (or root) may unlink it.
fn sticky_denies(dir_mode: u32, dir_owner: u32, entry_owner: u32, euid: u32) -> bool {
    dir_mode & STICKY != 0 && euid != 0 && dir_owner != euid && entry_owner != euid
}

fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn sticky_directories_only_yield_to_owners() {
        assert!(sticky_denies(0o1777, 0, 1001, 1000));
        assert!(!sticky_denies(0o1777, 0, 1000, 1000));
        assert!(!sticky_denies(0o1777, 1000, 1001, 1000));
        assert!(!sticky_denies(0o1777, 0, 1001, 0));
        assert!(!sticky_denies(0o0777, 0, 1001, 1000));
    }

    #[test]
    fn read_only_parent_blocks_removal() {
        if effective_uid() == 0 {
            return;
        }
        let temp = TempDir::new().unwrap();
        let locked = temp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("a.bin"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        assert!(!can_remove(&locked.join("a.bin")));
        assert!(can_remove(&locked));

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(can_remove(&locked.join("a.bin")));
    }

    #[test]
    fn missing_entries_are_not_blocked() {
        let temp = TempDir::new().unwrap();
        assert!(can_remove(&temp.path().join("gone/deeper")));
    }
}
