//! Filesystem helpers for staging build contexts.

use std::path::Path;

use crate::error::Result;

/// Copies the contents of `src` into `dst`, creating directories as needed.
///
/// Existing files in `dst` are overwritten; files only present in `dst` are kept.
pub fn recursive_copy(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            recursive_copy(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Removes `dir` if present and recreates it empty.
pub fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}
