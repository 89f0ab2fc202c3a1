// keg-aio/src/fs.rs
// Synchronous filesystem primitives shared by the executor, pruner and
// test harness.

use std::fs::{self, Permissions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use keg_common::error::{KegError, Result};
use tempfile::NamedTempFile;
use tracing::{debug, error, warn};

pub fn create_dir_all(path: &Path) -> Result<()> {
    debug!("Creating directory recursively: {}", path.display());
    fs::create_dir_all(path).map_err(|e| {
        error!("Failed create dir {}: {}", path.display(), e);
        KegError::from(e)
    })
}

/// Removes a directory tree; a missing directory is not an error.
pub fn remove_directory_recursive(path: &Path) -> Result<()> {
    debug!("Removing directory recursively: {}", path.display());
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            error!("Failed remove dir {}: {}", path.display(), e);
            Err(KegError::from(e))
        }
        _ => Ok(()),
    }
}

#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    debug!("Setting permissions on {}: {:o}", path.display(), mode);
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(KegError::from)
}

#[cfg(not(unix))]
pub fn set_permissions(path: &Path, _mode: u32) -> Result<()> {
    warn!("Setting permissions not supported on this platform: {}", path.display());
    Ok(())
}

/// Writes through a temporary file in the same directory, then renames.
/// Existing permissions are preserved.
pub fn atomic_write_file(original_path: &Path, content: &[u8]) -> Result<()> {
    let dir = original_path.parent().ok_or_else(|| {
        KegError::Generic(format!(
            "Cannot get parent directory for {}",
            original_path.display()
        ))
    })?;
    create_dir_all(dir)?;
    let original_perms = fs::metadata(original_path).map(|m| m.permissions()).ok();

    let mut temp_file = NamedTempFile::new_in(dir)?;
    debug!(
        "Atomically writing {} bytes to {}",
        content.len(),
        original_path.display()
    );
    temp_file.write_all(content)?;
    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file
        .persist(original_path)
        .map_err(|e| KegError::from(e.error))?;

    match original_perms {
        Some(perms) => {
            if let Err(e) = fs::set_permissions(original_path, perms) {
                warn!(
                    "Failed to restore permissions on {}: {}",
                    original_path.display(),
                    e
                );
            }
        }
        None => set_permissions(original_path, 0o644)?,
    }
    Ok(())
}

/// Joins a relative path onto `root`, refusing absolute paths and `..`
/// components so the result always stays under `root`.
pub fn resolve_under(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(KegError::Configuration(format!(
                    "Path '{relative}' must stay inside {}",
                    root.display()
                )))
            }
        }
    }
    Ok(out)
}

/// Lexical containment check; neither path is resolved on disk.
pub fn is_within(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
        && !path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
}

/// Copies a file, symlink or directory tree to `dest`. Symlinks are
/// recreated, never followed; permissions are kept.
pub fn copy_recursive(src: &Path, dest: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        if fs::symlink_metadata(dest).is_ok() {
            fs::remove_file(dest)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, dest)?;
        return Ok(());
    }
    if meta.is_dir() {
        create_dir_all(dest)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        create_dir_all(parent)?;
    }
    debug!("Copying {} -> {}", src.display(), dest.display());
    fs::copy(src, dest)?;
    Ok(())
}
