//! Path handling for builder node paths.
//!
//! Builder paths are absolute, `/`-separated and never contain `.` or `..`
//! components. `"/"` is the root directory.

use crate::error::{FsBuildError, Result};

/// Normalize a node path: collapse repeated and trailing separators and
/// make it absolute.
pub fn normalize(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if part == "." || part == ".." {
            return Err(FsBuildError::InvalidPath {
                path: path.to_string(),
            });
        }
        parts.push(part);
    }
    if parts.is_empty() {
        if path.starts_with('/') {
            return Ok("/".to_string());
        }
        return Err(FsBuildError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Parent directory of a normalized path. The root has no parent.
pub fn parent_dir_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final component of a normalized path.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}
