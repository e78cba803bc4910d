//! Workspace root discovery.
//!
//! A server is started per workspace root, not per file. The root for a file
//! is the nearest ancestor directory containing one of the server's root
//! markers (`Cargo.toml`, `tsconfig.json`, ...).

use std::path::{Path, PathBuf};

/// Collapse `.` and `..` components lexically, without touching the
/// filesystem. Server URIs come back with dot segments already resolved, so
/// every path used as a map key goes through this first.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for c in path.components() {
        match c {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

/// Find the workspace root for `path` by walking up the directory tree.
///
/// The walk starts at `path` itself when it is a directory, otherwise at its
/// parent. The first ancestor containing any marker wins, so nested projects
/// resolve to the innermost root. Returns `None` when no ancestor carries a
/// marker.
#[must_use]
pub fn resolve_workspace_root(path: &Path, markers: &[&str]) -> Option<PathBuf> {
    let start = if path.is_dir() { path } else { path.parent()? };
    for ancestor in start.ancestors() {
        for marker in markers {
            if ancestor.join(marker).exists() {
                return Some(ancestor.to_path_buf());
            }
        }
    }
    None
}

/// Like [`resolve_workspace_root`], falling back to the file's own directory
/// when no marker is found anywhere above it. Single-file scripts still get
/// a server this way.
#[must_use]
pub fn resolve_workspace_root_or_parent(path: &Path, markers: &[&str]) -> PathBuf {
    if let Some(root) = resolve_workspace_root(path, markers) {
        return root;
    }
    if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent()
            .map_or_else(|| path.to_path_buf(), Path::to_path_buf)
    }
}
