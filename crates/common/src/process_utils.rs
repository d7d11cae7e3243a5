use std::io;
use std::path::{Path, PathBuf};

use path_clean::PathClean;

/// Makes `path` absolute against the current directory and normalizes it
/// lexically. Does not touch the filesystem beyond reading the cwd.
pub fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize_path(path))
    } else {
        Ok(normalize_path(&std::env::current_dir()?.join(path)))
    }
}

/// Resolves symlinks through the deepest existing ancestor of `path` and
/// re-appends the components that do not exist yet.
///
/// Lets callers compare a not-yet-created file against a canonical root
/// (e.g. `/tmp` vs `/private/tmp`).
pub fn resolve_through_existing(path: &Path) -> io::Result<PathBuf> {
    let absolute = absolutize(path)?;
    let mut existing = absolute.clone();
    let mut missing = Vec::new();

    loop {
        match std::fs::canonicalize(&existing) {
            Ok(canonical) => {
                let mut resolved = canonical;
                for part in missing.iter().rev() {
                    resolved.push(part);
                }
                return Ok(normalize_path(&resolved));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Ok(absolute);
                };
                missing.push(name);
                if !existing.pop() {
                    return Ok(absolute);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Canonicalise `candidate` relative to `root`, preventing traversal outside.
pub fn canonicalize_within_root(root: &Path, candidate: &Path) -> io::Result<PathBuf> {
    let root_norm = resolve_through_existing(root)?;
    let combined = if candidate.is_absolute() {
        resolve_through_existing(candidate)?
    } else {
        resolve_through_existing(&root_norm.join(candidate))?
    };

    if !combined.starts_with(&root_norm) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "Path {} escapes workspace {}",
                combined.display(),
                root_norm.display()
            ),
        ));
    }

    Ok(combined)
}

/// Lexical normalization: drops `.` and folds `..` without consulting the
/// filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    path.clean()
}
