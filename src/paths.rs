//! Slash-rooted path helpers
//!
//! Both trees key their directories by POSIX-style paths rooted at `/`
//! ("/photos/2023"), independent of where the data root lives on disk.

use std::path::{Component, Path, PathBuf};

pub const ROOT: &str = "/";

/// Normalize a slash path: collapse repeated and trailing separators, drop
/// `.` components. Returns `None` for relative paths and for any `..`.
pub fn normalize_slash_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if !raw.starts_with('/') {
        return None;
    }
    let mut out = String::with_capacity(raw.len());
    for part in raw.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            p => {
                out.push('/');
                out.push_str(p);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Some(out)
}

/// Directory-name of a normalized slash path; the root has no parent.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(pos) => Some(&path[..pos]),
        None => None,
    }
}

/// Final component of a normalized slash path (`/` for the root).
pub fn name_of(path: &str) -> &str {
    if path == ROOT {
        return ROOT;
    }
    path.rsplit('/').next().unwrap_or(path)
}

/// Two job paths overlap when one is a prefix of the other, equality included.
pub fn overlaps(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Slash path of `path` relative to `root`, with a leading separator.
pub fn relative_slash_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let mut out = String::new();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Map a normalized slash path under the local data root.
pub fn local_path(root: &Path, slash_path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for part in slash_path.split('/').filter(|p| !p.is_empty()) {
        out.push(part);
    }
    out
}

/// Directory the transfer tool writes into: the parent of the mirrored
/// directory, so the tool recreates the directory itself. The root mirrors
/// straight into the data root.
pub fn transfer_destination(root: &Path, slash_path: &str) -> PathBuf {
    if slash_path == ROOT {
        return root.to_path_buf();
    }
    let target = local_path(root, slash_path);
    match target.parent() {
        Some(parent) => parent.to_path_buf(),
        None => root.to_path_buf(),
    }
}
