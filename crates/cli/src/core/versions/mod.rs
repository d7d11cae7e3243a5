//! # Atelier Version Store
//!
//! Full-tree snapshots of a project directory.
//!
//! ## Layout
//!
//! ```text
//! <versions_dir>/
//!   versions.json         index, newest first
//!   .versions.lock        advisory lock for index writers
//!   <version-id>/         copied tree + metadata.json (+ preview.json)
//! ```
//!
//! A snapshot is copied into a hidden staging directory and only renamed
//! into place once complete, so readers never see a partial version. Index
//! writes go through a temporary file, fsync and rename while holding the
//! lock file. Pruned and deleted versions are renamed to `.trash-<id>` in
//! the same critical section and removed afterwards.
//!
//! All methods block on the filesystem; async callers go through
//! `spawn_blocking`.

mod archive;
mod tree;

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use atelier_common::process_utils::absolutize;

use super::config::VersionSettings;
use super::errors::{EngineError, EngineResult};

pub use tree::{scan_tree, SnapshotFilter, TreeStats, RESERVED_ROOT_NAMES};

const INDEX_FILE: &str = "versions.json";
const LOCK_FILE: &str = ".versions.lock";
const METADATA_FILE: &str = "metadata.json";
const PREVIEW_FILE: &str = "preview.json";
const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// Metadata recorded with every version, also used as the index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub source_project_path: PathBuf,
    pub file_count: u64,
    pub size_bytes: u64,
}

/// Optional preview details stored next to a version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedVersion {
    pub version_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub metadata: VersionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDetail {
    pub metadata: VersionMetadata,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<PreviewDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    pub version_id: String,
    pub target_path: PathBuf,
    pub restored_files: u64,
}

/// Membership differences between two versions. `added` holds paths present
/// only in the second version, `removed` paths present only in the first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDiff {
    pub version1: String,
    pub version2: String,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub file_count_diff: i64,
    pub size_diff: i64,
    pub time_diff_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionStats {
    pub total_versions: usize,
    pub total_size: u64,
    pub average_size: u64,
    pub oldest_version: Option<VersionMetadata>,
    pub newest_version: Option<VersionMetadata>,
}

#[derive(Debug)]
pub struct VersionStore {
    root: PathBuf,
    settings: VersionSettings,
    index: RwLock<Vec<VersionMetadata>>,
}

impl VersionStore {
    /// Opens (creating if needed) the store at `dir`.
    ///
    /// A missing or unreadable index is rebuilt from the `metadata.json`
    /// files found on disk; leftover staging directories are removed.
    pub fn open(dir: impl AsRef<Path>, settings: VersionSettings) -> EngineResult<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .map_err(|e| EngineError::io(dir.to_path_buf(), "create version store", e))?;
        let root = fs::canonicalize(dir)
            .map_err(|e| EngineError::io(dir.to_path_buf(), "resolve version store", e))?;

        let store = Self {
            root,
            settings,
            index: RwLock::new(Vec::new()),
        };
        store.remove_stale_staging();

        let index = match read_index_file(&store.index_path()) {
            Some(index) => index,
            None => {
                let rebuilt = store.scan_metadata();
                info!(
                    store = %store.root.display(),
                    versions = rebuilt.len(),
                    "rebuilt version index from disk"
                );
                store.with_lock(|| write_index_atomic(&store.root, &rebuilt))?;
                rebuilt
            }
        };
        *store.index.write().unwrap_or_else(PoisonError::into_inner) = index;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &VersionSettings {
        &self.settings
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn version_dir(&self, id: &str) -> EngineResult<PathBuf> {
        validate_id(id)?;
        let dir = self.root.join(id);
        if dir.join(METADATA_FILE).is_file() {
            Ok(dir)
        } else {
            Err(EngineError::not_found("version", id))
        }
    }

    /// Filter used when copying a project into the store.
    pub fn snapshot_filter(&self) -> SnapshotFilter {
        SnapshotFilter::from_settings(&self.settings).skipping(self.root.clone())
    }

    pub fn save_version(
        &self,
        project_path: &Path,
        description: &str,
    ) -> EngineResult<SavedVersion> {
        self.save_version_with_preview(project_path, description, None)
    }

    /// Like [`save_version`](Self::save_version), also recording
    /// `preview.json` when a descriptor is given.
    pub fn save_version_with_preview(
        &self,
        project_path: &Path,
        description: &str,
        preview: Option<&PreviewDescriptor>,
    ) -> EngineResult<SavedVersion> {
        let source = fs::canonicalize(project_path)
            .ok()
            .filter(|p| p.is_dir())
            .ok_or_else(|| EngineError::not_found("project", project_path.display().to_string()))?;

        let timestamp = Utc::now();
        let id = new_version_id(timestamp);
        let staging = self.root.join(format!("{STAGING_PREFIX}{id}"));

        let staged = self.stage_version(&source, &staging, &id, timestamp, description, preview);
        let metadata = match staged {
            Ok(metadata) => metadata,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(err);
            }
        };

        let final_dir = self.root.join(&id);
        if let Err(e) = fs::rename(&staging, &final_dir) {
            let _ = fs::remove_dir_all(&staging);
            return Err(EngineError::io(final_dir, "publish version", e));
        }

        let max_versions = self.settings.max_versions.max(1);
        let entry = metadata.clone();
        let pruned = self.update_index(move |index| {
            index.retain(|v| v.id != entry.id);
            index.insert(0, entry);
            if index.len() > max_versions {
                index
                    .split_off(max_versions)
                    .into_iter()
                    .map(|old| old.id)
                    .collect()
            } else {
                Vec::new()
            }
        })?;
        for old in &pruned {
            debug!(version_id = %old, "pruned version");
        }

        info!(
            version_id = %id,
            files = metadata.file_count,
            bytes = metadata.size_bytes,
            "version saved"
        );
        Ok(SavedVersion {
            version_id: id,
            timestamp,
            description: metadata.description.clone(),
            metadata,
        })
    }

    fn stage_version(
        &self,
        source: &Path,
        staging: &Path,
        id: &str,
        timestamp: DateTime<Utc>,
        description: &str,
        preview: Option<&PreviewDescriptor>,
    ) -> EngineResult<VersionMetadata> {
        let filter = self.snapshot_filter();
        tree::copy_tree(source, staging, &filter)
            .map_err(|e| EngineError::io(source.to_path_buf(), "copy project tree", e))?;
        let stats = tree::scan_tree(staging, &SnapshotFilter::verbatim())
            .map_err(|e| EngineError::io(staging.to_path_buf(), "scan version tree", e))?;

        let metadata = VersionMetadata {
            id: id.to_string(),
            timestamp,
            description: description.to_string(),
            source_project_path: source.to_path_buf(),
            file_count: stats.file_count,
            size_bytes: stats.size_bytes,
        };
        write_json(&staging.join(METADATA_FILE), &metadata)?;
        if let Some(preview) = preview {
            write_json(&staging.join(PREVIEW_FILE), preview)?;
        }
        Ok(metadata)
    }

    /// Index, newest first.
    pub fn get_versions(&self) -> Vec<VersionMetadata> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_version(&self, id: &str) -> EngineResult<VersionDetail> {
        let dir = self.version_dir(id)?;
        let metadata: VersionMetadata = read_json(&dir.join(METADATA_FILE))?;
        let files = tree::list_files(&dir, &SnapshotFilter::verbatim())
            .map_err(|e| EngineError::io(dir.clone(), "list version files", e))?;
        let preview_path = dir.join(PREVIEW_FILE);
        let preview = if preview_path.is_file() {
            Some(read_json(&preview_path)?)
        } else {
            None
        };
        Ok(VersionDetail {
            metadata,
            files,
            preview,
        })
    }

    /// Replaces the contents of `target` with the version's tree.
    ///
    /// If the store lives inside `target` it is left in place.
    pub fn restore_version(&self, id: &str, target: &Path) -> EngineResult<RestoreResult> {
        validate_id(id)?;
        let mut index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        if !index.iter().any(|v| v.id == id) {
            // Another handle may have saved it since this one last loaded.
            drop(index);
            self.reload_index();
            index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        }
        if !index.iter().any(|v| v.id == id) {
            return Err(EngineError::not_found("version", id));
        }
        // Pruning and deletion retire directories under the write lock, so
        // the source stays whole while this guard is held.
        let dir = self.version_dir(id)?;

        fs::create_dir_all(target)
            .map_err(|e| EngineError::io(target.to_path_buf(), "create restore target", e))?;
        let target = fs::canonicalize(target)
            .map_err(|e| EngineError::io(target.to_path_buf(), "resolve restore target", e))?;
        if target.starts_with(&self.root) {
            return Err(EngineError::policy(
                "restore_target",
                "cannot restore a version into the version store",
            ));
        }

        let keep = self.root.starts_with(&target).then_some(self.root.as_path());
        tree::clear_dir_except(&target, keep)
            .map_err(|e| EngineError::io(target.clone(), "clear restore target", e))?;
        let stats = tree::copy_tree(&dir, &target, &SnapshotFilter::verbatim())
            .map_err(|e| EngineError::io(target.clone(), "copy version tree", e))?;

        info!(version_id = %id, target = %target.display(), files = stats.file_count, "version restored");
        Ok(RestoreResult {
            version_id: id.to_string(),
            target_path: target,
            restored_files: stats.file_count,
        })
    }

    pub fn compare_versions(&self, id1: &str, id2: &str) -> EngineResult<VersionDiff> {
        let first = self.get_version(id1)?;
        let second = self.get_version(id2)?;
        let files1: BTreeSet<&String> = first.files.iter().collect();
        let files2: BTreeSet<&String> = second.files.iter().collect();

        Ok(VersionDiff {
            version1: id1.to_string(),
            version2: id2.to_string(),
            added: files2.difference(&files1).map(|s| s.to_string()).collect(),
            removed: files1.difference(&files2).map(|s| s.to_string()).collect(),
            file_count_diff: second.metadata.file_count as i64 - first.metadata.file_count as i64,
            size_diff: second.metadata.size_bytes as i64 - first.metadata.size_bytes as i64,
            time_diff_ms: second
                .metadata
                .timestamp
                .signed_duration_since(first.metadata.timestamp)
                .num_milliseconds(),
        })
    }

    pub fn delete_version(&self, id: &str) -> EngineResult<bool> {
        validate_id(id)?;
        let dir = self.root.join(id);
        let known = self.get_versions().iter().any(|v| v.id == id);
        if !known && !dir.is_dir() {
            return Err(EngineError::not_found("version", id));
        }

        let owned_id = id.to_string();
        self.update_index(move |index| {
            index.retain(|v| v.id != owned_id);
            vec![owned_id]
        })?;
        info!(version_id = %id, "version deleted");
        Ok(true)
    }

    /// Writes a zip of the version. A directory `export_path` receives
    /// `<id>.zip`.
    pub fn export_version(&self, id: &str, export_path: &Path) -> EngineResult<ExportResult> {
        let dir = self.version_dir(id)?;
        let archive = if export_path.is_dir() {
            export_path.join(format!("{id}.zip"))
        } else {
            export_path.to_path_buf()
        };
        if let Some(parent) = archive.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::io(parent.to_path_buf(), "create export directory", e))?;
        }
        let archive = absolutize(&archive)
            .map_err(|e| EngineError::io(archive.clone(), "resolve export path", e))?;
        if archive.starts_with(&self.root) {
            return Err(EngineError::policy(
                "export_target",
                "exports cannot be written inside the version store",
            ));
        }

        let size = match archive::write_zip(&dir, &archive) {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&archive);
                return Err(EngineError::io(archive, "write zip archive", e));
            }
        };
        info!(version_id = %id, path = %archive.display(), size, "version exported");
        Ok(ExportResult {
            path: archive,
            size,
        })
    }

    pub fn get_version_stats(&self) -> VersionStats {
        let index = self.get_versions();
        let total_size: u64 = index.iter().map(|v| v.size_bytes).sum();
        let total_versions = index.len();
        VersionStats {
            total_versions,
            total_size,
            average_size: if total_versions == 0 {
                0
            } else {
                total_size / total_versions as u64
            },
            oldest_version: index.last().cloned(),
            newest_version: index.first().cloned(),
        }
    }

    /// Runs `mutate` on the freshest index while holding both the in-process
    /// write lock and the lock file, then persists the result.
    ///
    /// `mutate` returns the ids whose directories leave the store. They are
    /// moved aside before the locks are released and deleted after.
    fn update_index(
        &self,
        mutate: impl FnOnce(&mut Vec<VersionMetadata>) -> Vec<String>,
    ) -> EngineResult<Vec<String>> {
        let (retired, trash) = {
            let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
            self.with_lock(|| {
                // Another process may have written since we last loaded.
                if let Some(on_disk) = read_index_file(&self.index_path()) {
                    *index = on_disk;
                }
                let retired = mutate(&mut index);
                write_index_atomic(&self.root, &index)?;
                let trash = self.move_to_trash(&retired)?;
                Ok((retired, trash))
            })?
        };

        for path in trash {
            if let Err(e) = fs::remove_dir_all(&path) {
                warn!(path = %path.display(), "failed to remove retired version data: {e}");
            }
        }
        Ok(retired)
    }

    fn move_to_trash(&self, ids: &[String]) -> EngineResult<Vec<PathBuf>> {
        let mut trash = Vec::with_capacity(ids.len());
        for id in ids {
            let dir = self.root.join(id);
            let dest = self.root.join(format!("{TRASH_PREFIX}{id}-{}", Uuid::new_v4().simple()));
            match fs::rename(&dir, &dest) {
                Ok(()) => trash.push(dest),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::io(dir, "retire version", e)),
            }
        }
        Ok(trash)
    }

    fn reload_index(&self) {
        if let Some(on_disk) = read_index_file(&self.index_path()) {
            *self.index.write().unwrap_or_else(PoisonError::into_inner) = on_disk;
        }
    }

    fn with_lock<R>(&self, body: impl FnOnce() -> EngineResult<R>) -> EngineResult<R> {
        let lock_path = self.root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| EngineError::io(lock_path.clone(), "open version lock", e))?;
        lock.lock_exclusive()
            .map_err(|e| EngineError::io(lock_path.clone(), "lock version index", e))?;
        let result = body();
        let _ = lock.unlock();
        result
    }

    fn scan_metadata(&self) -> Vec<VersionMetadata> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut versions: Vec<VersionMetadata> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter(|entry| validate_id(&entry.file_name().to_string_lossy()).is_ok())
            .filter_map(|entry| read_json(&entry.path().join(METADATA_FILE)).ok())
            .collect();
        versions.sort_by(|a: &VersionMetadata, b| b.timestamp.cmp(&a.timestamp));
        versions
    }

    fn remove_stale_staging(&self) {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(STAGING_PREFIX) || name.starts_with(TRASH_PREFIX) {
                let path = entry.path();
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), "failed to remove leftover store dir: {e}");
                }
            }
        }
    }
}

fn new_version_id(timestamp: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("ver-{}-{}", timestamp.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// Ids are single path components made of `[A-Za-z0-9_-]`.
fn validate_id(id: &str) -> EngineResult<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(EngineError::not_found("version", id))
    }
}

fn read_index_file(path: &Path) -> Option<Vec<VersionMetadata>> {
    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(index) => Some(index),
        Err(err) => {
            warn!(path = %path.display(), "version index unreadable: {err}");
            None
        }
    }
}

fn write_index_atomic(dir: &Path, index: &[VersionMetadata]) -> EngineResult<()> {
    let final_path = dir.join(INDEX_FILE);
    let temp_path = dir.join(format!("{INDEX_FILE}.tmp"));
    let io_err = |e| EngineError::io(final_path.clone(), "write version index", e);

    let mut temp = File::create(&temp_path).map_err(io_err)?;
    serde_json::to_writer_pretty(&mut temp, index)
        .map_err(|e| io_err(io::Error::new(io::ErrorKind::Other, e)))?;
    temp.write_all(b"\n").map_err(io_err)?;
    temp.sync_all().map_err(io_err)?;
    drop(temp);

    fs::rename(&temp_path, &final_path).map_err(io_err)?;
    #[cfg(unix)]
    if let Ok(dir_handle) = File::open(dir) {
        let _ = dir_handle.sync_all();
    }
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> EngineResult<()> {
    let body = serde_json::to_vec_pretty(value).map_err(|e| {
        EngineError::io(
            path.to_path_buf(),
            "serialize json",
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })?;
    fs::write(path, body).map_err(|e| EngineError::io(path.to_path_buf(), "write json", e))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> EngineResult<T> {
    let body =
        fs::read_to_string(path).map_err(|e| EngineError::io(path.to_path_buf(), "read json", e))?;
    serde_json::from_str(&body).map_err(|e| {
        EngineError::io(
            path.to_path_buf(),
            "parse json",
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_id_shape() {
        let id = new_version_id(Utc::now());
        assert!(id.starts_with("ver-"));
        // ver-YYYYmmdd-HHMMSS-xxxxxxxx
        assert_eq!(id.len(), 4 + 8 + 1 + 6 + 1 + 8);
        assert!(validate_id(&id).is_ok());
    }

    #[test]
    fn test_invalid_ids_are_not_found() {
        for id in ["", "..", "../etc", "a/b", ".staging-x", "ver 1"] {
            let err = validate_id(id).unwrap_err();
            assert_eq!(err.error_code(), "E_NOT_FOUND", "id {id:?}");
        }
    }
}
