//! Random IO utilities

use std::path::{Path, PathBuf};

/// Remove all files and directories in the given directory, but not the directory itself.
pub async fn remove_dir_contents(path: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if tokio::fs::metadata(&path).await?.is_dir() {
            tokio::fs::remove_dir_all(path).await?;
        } else {
            tokio::fs::remove_file(path).await?;
        }
    }
    Ok(())
}

/// Write `contents` to `path` via a temp file and an atomic rename, so a
/// crash never leaves a half-written file behind.
pub async fn write_file_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = match path.file_name() {
        Some(name) => {
            let mut tmp_name = name.to_os_string();
            tmp_name.push(".tmp");
            path.with_file_name(tmp_name)
        }
        None => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path has no file name",
            ));
        }
    };
    tokio::fs::write(&tmp, contents).await?;
    match tokio::fs::rename(&tmp, path).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

/// Bytes a file actually occupies on disk, which for sparse backing files
/// can be far less than its length.
#[must_use]
pub fn disk_usage(md: &std::fs::Metadata) -> u64 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt as _;
        md.blocks() * 512
    }
    #[cfg(not(unix))]
    {
        md.len()
    }
}

/// Rename a regular file, creating the destination's parent directory if
/// needed. A missing source is a no-op (`Ok(false)`); renaming a file onto
/// itself is too.
pub async fn rename_file(old: &Path, new: &Path) -> std::io::Result<bool> {
    match tokio::fs::metadata(old).await {
        Ok(md) if md.is_file() => {}
        Ok(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("non-regular source file: {}", old.display()),
            ));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }
    if let Some(parent) = new.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(old, new).await?;
    Ok(true)
}

/// Remove empty directories under `root`, deepest first. The root itself is
/// kept when `leave_root` is set. Missing roots are fine.
pub async fn remove_empty_dirs(root: &Path, leave_root: bool) -> std::io::Result<()> {
    if !tokio::fs::try_exists(root).await? {
        return Ok(());
    }

    // Collect the directory tree first, then delete in depth order so
    // children go before parents.
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut queue: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = queue.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                let path = entry.path();
                dirs.push(path.clone());
                queue.push(path);
            }
        }
    }

    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
    for dir in dirs {
        // Only empty directories go; remove_dir fails (harmlessly) otherwise.
        let _ = tokio::fs::remove_dir(&dir).await;
    }
    if !leave_root {
        let _ = tokio::fs::remove_dir(root).await;
    }
    Ok(())
}
