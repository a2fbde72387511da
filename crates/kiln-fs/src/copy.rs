use crate::FsError;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, warn};

/// Copy the contents of `src` into `dst`, creating `dst` if needed.
///
/// This is `cp -a src/. dst` semantics: `src` itself is not recreated under
/// `dst`, only its entries are.
pub fn copy_contents(src: &Path, dst: &Path) -> Result<(), FsError> {
    if !src.is_dir() {
        return Err(FsError::NotFound(src.display().to_string()));
    }
    debug!("copying {}/. to {}", src.display(), dst.display());
    fs::create_dir_all(dst).map_err(|e| copy_error(src, dst, e))?;
    copy_tree(src, dst)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), FsError> {
    let entries = fs::read_dir(src).map_err(|e| copy_error(src, dst, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| copy_error(src, dst, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = from.symlink_metadata().map_err(|e| copy_error(&from, &to, e))?;
        let ft = meta.file_type();

        if ft.is_dir() {
            fs::create_dir_all(&to).map_err(|e| copy_error(&from, &to, e))?;
            copy_tree(&from, &to)?;
            // Only once the children are in place: the mode may be read-only.
            fs::set_permissions(&to, meta.permissions()).map_err(|e| copy_error(&from, &to, e))?;
        } else if ft.is_symlink() {
            let target = fs::read_link(&from).map_err(|e| copy_error(&from, &to, e))?;
            if to.symlink_metadata().is_ok() {
                fs::remove_file(&to).map_err(|e| copy_error(&from, &to, e))?;
            }
            std::os::unix::fs::symlink(&target, &to).map_err(|e| copy_error(&from, &to, e))?;
        } else if ft.is_file() {
            fs::copy(&from, &to).map_err(|e| copy_error(&from, &to, e))?;
        } else {
            warn!("skipping unsupported file type: {}", from.display());
        }
    }
    Ok(())
}

fn copy_error(from: &Path, to: &Path, source: std::io::Error) -> FsError {
    FsError::Copy {
        from: from.display().to_string(),
        to: to.display().to_string(),
        source,
    }
}

/// Copy a single file to `dst` and make it executable.
pub fn install_file(src: &Path, dst: &Path) -> Result<(), FsError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst).map_err(|e| copy_error(src, dst, e))?;
    fs::set_permissions(dst, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// Remove a directory tree. A missing directory is not an error.
pub fn remove_dir(path: &Path) -> Result<(), FsError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
