//! Atomic, symlink-resistant storage writer (C2).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use archiver_path_policy::assert_root_containment;
use archiver_retry::{ArchiverError, ErrorCode};

/// Default file mode applied to a written archive (owner rw, group r).
pub const DEFAULT_MODE: u32 = 0o640;

fn storage_err(message: impl Into<String>) -> ArchiverError {
    ArchiverError::transient(ErrorCode::Storage, message)
}

fn path_policy_err(message: impl Into<String>) -> ArchiverError {
    ArchiverError::permanent(ErrorCode::PathPolicy, message)
}

/// Walks every component of `rel_path` under `root`, rejecting if any
/// intermediate component already exists on disk as a symlink. Components
/// that don't exist yet are fine; they will be created as plain
/// directories below.
fn reject_existing_symlink_components(root: &Path, rel_path: &Path) -> Result<(), ArchiverError> {
    let mut cursor = root.to_path_buf();
    for component in rel_path.components() {
        cursor.push(component);
        match fs::symlink_metadata(&cursor) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(path_policy_err(format!(
                    "path component {} is a symlink",
                    cursor.display()
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Writes `bytes` to `root.join(rel_path)` atomically: validate root
/// containment, reject symlinked path components, create parent
/// directories, write through a sibling temp file opened with
/// `O_NOFOLLOW`, optionally fsync, apply `mode` via the open handle, then
/// rename onto the target and best-effort fsync the parent directory.
///
/// Returns the absolute path written.
pub fn write_atomic(
    root: &Path,
    rel_path: &Path,
    bytes: &[u8],
    fsync: bool,
    mode: u32,
) -> Result<PathBuf, ArchiverError> {
    let target = assert_root_containment(root, rel_path)?;
    reject_existing_symlink_components(root, rel_path)?;

    let parent = target.parent().ok_or_else(|| path_policy_err("archive path has no parent directory"))?;
    fs::create_dir_all(parent).map_err(|e| storage_err(format!("failed to create {}: {e}", parent.display())))?;

    let file_name = target
        .file_name()
        .ok_or_else(|| path_policy_err("archive path has no file name"))?;
    let tmp_name = format!(".{}.tmp-{}", file_name.to_string_lossy(), std::process::id());
    let tmp_path = parent.join(tmp_name);

    let write_result = (|| -> Result<(), ArchiverError> {
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true).custom_flags(libc::O_NOFOLLOW);
        let mut file = opts
            .open(&tmp_path)
            .map_err(|e| storage_err(format!("failed to create temp file {}: {e}", tmp_path.display())))?;
        file.write_all(bytes)
            .map_err(|e| storage_err(format!("failed to write temp file {}: {e}", tmp_path.display())))?;
        if fsync {
            file.sync_all()
                .map_err(|e| storage_err(format!("failed to fsync temp file {}: {e}", tmp_path.display())))?;
        }
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| storage_err(format!("failed to set mode on {}: {e}", tmp_path.display())))?;
        Ok(())
    })();

    if let Err(err) = write_result {
        if let Err(remove_err) = fs::remove_file(&tmp_path) {
            if remove_err.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(
                    path = %tmp_path.display(),
                    error = %remove_err,
                    "failed to remove temp file after write failure"
                );
            }
        }
        return Err(err);
    }

    fs::rename(&tmp_path, &target)
        .map_err(|e| storage_err(format!("failed to rename {} to {}: {e}", tmp_path.display(), target.display())))?;

    if let Ok(dir) = fs::File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(target)
}

/// Non-atomic write used only by tests and the explicit opt-out path.
pub fn write_direct(root: &Path, rel_path: &Path, bytes: &[u8], mode: u32) -> Result<PathBuf, ArchiverError> {
    let target = assert_root_containment(root, rel_path)?;
    let parent = target.parent().ok_or_else(|| path_policy_err("archive path has no parent directory"))?;
    fs::create_dir_all(parent).map_err(|e| storage_err(format!("failed to create {}: {e}", parent.display())))?;
    fs::write(&target, bytes).map_err(|e| storage_err(format!("failed to write {}: {e}", target.display())))?;
    fs::set_permissions(&target, fs::Permissions::from_mode(mode))
        .map_err(|e| storage_err(format!("failed to set mode on {}: {e}", target.display())))?;
    Ok(target)
}
