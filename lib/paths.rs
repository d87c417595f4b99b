//! Remote-name canonicalization and mapping onto the on-disk cache trees.
//!
//! A remote name is a slash-separated path relative to the remote root. Two
//! names that clean to the same canonical form refer to the same cache item,
//! so every registry entry point runs [`clean`] first.

use std::path::{Path, PathBuf};

/// Canonicalize a remote name.
///
/// Strips leading and trailing slashes, collapses duplicate slashes, resolves
/// `.` and `..` segments. `..` cannot escape the remote root; surplus parent
/// segments are dropped. The empty string is the root.
#[must_use]
pub fn clean(name: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in name.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            _ => out.push(seg),
        }
    }
    out.join("/")
}

/// The parent directory of a cleaned name, or `""` for top-level names.
#[must_use]
pub fn find_parent(name: &str) -> &str {
    match name.rfind('/') {
        Some(idx) => &name[..idx],
        None => "",
    }
}

/// The final path segment of a cleaned name.
#[must_use]
pub fn leaf(name: &str) -> &str {
    match name.rfind('/') {
        Some(idx) => &name[idx + 1..],
        None => name,
    }
}

/// Strip characters the host file system forbids from one path segment.
#[cfg(windows)]
fn sanitize_segment(seg: &str) -> String {
    seg.chars().filter(|c| *c != ':').collect()
}

/// Turn a cleaned remote name into an absolute path under `root`.
#[must_use]
pub fn to_os_path(root: &Path, name: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for seg in name.split('/').filter(|s| !s.is_empty()) {
        #[cfg(windows)]
        path.push(sanitize_segment(seg));
        #[cfg(not(windows))]
        path.push(seg);
    }
    path
}

/// Sanitize a remote identifier for use as a directory component.
///
/// Remote identifiers may contain separators or characters that are illegal
/// in a single path segment on the host.
#[must_use]
pub fn sanitize_remote_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}
