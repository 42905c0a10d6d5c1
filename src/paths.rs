//! Lexical path containment.
//!
//! Paths are normalized without touching the filesystem, so a request that
//! escapes its root is rejected before anything is read.

use std::path::{Component, Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Collapse `.` and `..` components. Returns `None` when `..` climbs above
/// the start of the path.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Some(out)
}

/// Resolve `candidate` against `root` and require the result to stay inside it.
///
/// Relative candidates are joined onto `root`; absolute candidates are taken
/// as-is. Comparison is component-wise, so `/mnt/nas2` is not inside `/mnt/nas`.
pub fn resolve_within(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let escape = || PipelineError::PathEscape {
        root: root.display().to_string(),
        path: candidate.display().to_string(),
    };

    let root_norm = normalize(root).ok_or_else(escape)?;
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root_norm.join(candidate)
    };
    let resolved = normalize(&joined).ok_or_else(escape)?;

    if !resolved.starts_with(&root_norm) {
        return Err(escape());
    }
    Ok(resolved)
}

/// Lowercased extension without the dot, if any.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}
