//! Directory walking, copying and clearing for snapshots.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::core::config::VersionSettings;

/// Root-level names reserved for version bookkeeping.
pub const RESERVED_ROOT_NAMES: &[&str] = &["metadata.json", "preview.json", "screenshot.png"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub file_count: u64,
    pub size_bytes: u64,
}

/// Decides which entries of a project tree take part in a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotFilter {
    exclude_dirs: BTreeSet<String>,
    exclude_extensions: BTreeSet<String>,
    skip_reserved: bool,
    /// Never descended into (the version store itself).
    skip_paths: Vec<PathBuf>,
}

impl SnapshotFilter {
    pub fn from_settings(settings: &VersionSettings) -> Self {
        Self {
            exclude_dirs: settings.exclude_dirs.iter().cloned().collect(),
            exclude_extensions: settings
                .exclude_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            skip_reserved: true,
            skip_paths: Vec::new(),
        }
    }

    /// Copies everything except root-level reserved names.
    pub fn verbatim() -> Self {
        Self {
            exclude_dirs: BTreeSet::new(),
            exclude_extensions: BTreeSet::new(),
            skip_reserved: true,
            skip_paths: Vec::new(),
        }
    }

    pub fn skipping(mut self, path: impl Into<PathBuf>) -> Self {
        self.skip_paths.push(path.into());
        self
    }

    fn excludes(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 {
            return false;
        }
        if self.skip_paths.iter().any(|skip| entry.path() == skip) {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        let file_type = entry.file_type();
        if file_type.is_dir() {
            return self.exclude_dirs.contains(name.as_ref());
        }
        if self.skip_reserved && entry.depth() == 1 && RESERVED_ROOT_NAMES.contains(&name.as_ref()) {
            return true;
        }
        entry
            .path()
            .extension()
            .map(|ext| {
                self.exclude_extensions
                    .contains(&ext.to_string_lossy().to_ascii_lowercase())
            })
            .unwrap_or(false)
    }

    fn walk<'a>(&'a self, root: &Path) -> impl Iterator<Item = io::Result<DirEntry>> + 'a {
        WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| !self.excludes(entry))
            .map(|entry| entry.map_err(io::Error::from))
    }
}

/// Copies the regular files and directories of `src` accepted by `filter`
/// into `dst`. Symlinks are skipped.
pub fn copy_tree(src: &Path, dst: &Path, filter: &SnapshotFilter) -> io::Result<TreeStats> {
    let mut stats = TreeStats::default();
    fs::create_dir_all(dst)?;

    for entry in filter.walk(src) {
        let entry = entry?;
        let relative = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            let copied = fs::copy(entry.path(), &target)?;
            stats.file_count += 1;
            stats.size_bytes += copied;
        } else {
            debug!(path = %entry.path().display(), "skipping non-regular entry");
        }
    }

    Ok(stats)
}

/// Counts regular files and their sizes under `root`.
pub fn scan_tree(root: &Path, filter: &SnapshotFilter) -> io::Result<TreeStats> {
    let mut stats = TreeStats::default();
    for entry in filter.walk(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            stats.file_count += 1;
            stats.size_bytes += entry.metadata().map_err(io::Error::from)?.len();
        }
    }
    Ok(stats)
}

/// Sorted `/`-separated relative paths of the regular files under `root`.
pub fn list_files(root: &Path, filter: &SnapshotFilter) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in filter.walk(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.push(relative_key(relative));
        }
    }
    files.sort();
    Ok(files)
}

pub fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Removes everything inside `dir` except `keep` and the directories leading
/// to it.
pub fn clear_dir_except(dir: &Path, keep: Option<&Path>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if let Some(keep) = keep {
            if path == keep {
                continue;
            }
            if file_type.is_dir() && keep.starts_with(&path) {
                clear_dir_except(&path, Some(keep))?;
                continue;
            }
        }

        if file_type.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn test_copy_applies_exclusions() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write(src.path(), "src/app.ts", "export {}");
        write(src.path(), "node_modules/react/index.js", "x");
        write(src.path(), ".git/HEAD", "ref");
        write(src.path(), "debug.log", "noise");
        write(src.path(), "metadata.json", "{}");
        write(src.path(), "docs/metadata.json", "{}");

        let filter = SnapshotFilter::from_settings(&VersionSettings::default());
        let stats = copy_tree(src.path(), dst.path(), &filter).unwrap();
        assert_eq!(stats.file_count, 2);

        let files = list_files(dst.path(), &SnapshotFilter::verbatim()).unwrap();
        assert_eq!(files, vec!["docs/metadata.json", "src/app.ts"]);
        assert_eq!(scan_tree(dst.path(), &filter).unwrap(), stats);
    }

    #[test]
    fn test_clear_keeps_nested_store() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "index.html", "<html/>");
        write(dir.path(), ".atelier/cache.txt", "c");
        write(dir.path(), ".atelier/versions/versions.json", "[]");
        let keep = dir.path().join(".atelier/versions");

        clear_dir_except(dir.path(), Some(&keep)).unwrap();

        assert!(!dir.path().join("index.html").exists());
        assert!(!dir.path().join(".atelier/cache.txt").exists());
        assert!(keep.join("versions.json").exists());
    }
}
