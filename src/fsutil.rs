//! Private-file helpers: atomic writes at 0600, directories at 0700, and
//! advisory exclusive locks.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tracing::trace;

use crate::error::{Error, Result};

pub const PRIVATE_FILE_MODE: u32 = 0o600;
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// Create `dir` (and parents) and force its mode to 0700.
pub fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::from(e).context(format!("create {}", dir.display())))?;
    fs::set_permissions(dir, fs::Permissions::from_mode(PRIVATE_DIR_MODE))?;
    Ok(())
}

/// Atomically replace `path` with `contents` at mode 0600.
///
/// Writes a sibling temp file, fsyncs it and renames it into place so readers
/// never observe a partial document.
pub fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".coop-tmp")
        .tempfile_in(parent)
        .map_err(|e| Error::from(e).context(format!("write {}", path.display())))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(PRIVATE_FILE_MODE))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| Error::from(e.error).context(format!("rename into {}", path.display())))?;
    trace!(path = %path.display(), bytes = contents.len(), "fsutil:write_private");
    Ok(())
}

/// Mode bits of `path` (permission part only).
pub fn mode_of(path: &Path) -> Result<u32> {
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}

/// Run `f` while holding an exclusive advisory lock on `<path>.lock`.
///
/// The lock file is a sibling of `path` so the lock covers the whole
/// read-modify-write of `path` even when `path` is replaced by rename.
pub fn with_exclusive<T>(path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let lock_path = lock_path_for(path);
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file: File = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .mode(PRIVATE_FILE_MODE)
        .open(&lock_path)
        .map_err(|e| Error::from(e).context(format!("open lock {}", lock_path.display())))?;
    let guard = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
        Error::Transport(format!("lock {}: {}", lock_path.display(), errno))
    })?;
    trace!(lock = %lock_path.display(), "fsutil:lock acquired");
    let result = f();
    drop(guard);
    result
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}
