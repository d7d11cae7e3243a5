//! Version store: snapshots, restore, comparison, retention and export

mod common;

use std::fs;
use std::io::Read;
use std::thread::sleep;
use std::time::Duration;

use atelier_cli::core::versions::PreviewDescriptor;
use atelier_cli::VersionStore;
use common::*;

fn project() -> Tmp {
    let t = Tmp::new();
    t.write("index.html", "<h1>v1</h1>\n");
    t.write("src/app.js", "console.log('v1');\n");
    t.write("node_modules/lib/index.js", "module.exports = 1;\n");
    t.write("debug.log", "noise\n");
    t
}

#[test]
fn save_copies_project_without_excluded_entries() {
    let store_dir = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();

    let saved = store.save_version(proj.path(), "first").unwrap();
    assert!(saved.version_id.starts_with("ver-"));
    assert_eq!(saved.description, "first");
    assert_eq!(saved.metadata.file_count, 2);
    assert_eq!(
        saved.metadata.source_project_path,
        fs::canonicalize(proj.path()).unwrap()
    );

    let detail = store.get_version(&saved.version_id).unwrap();
    assert_eq!(detail.files, vec!["index.html", "src/app.js"]);
    assert!(detail.preview.is_none());

    let listed = store.get_versions();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0], saved.metadata);
}

#[test]
fn versions_are_listed_newest_first() {
    let store_dir = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();

    let a = store.save_version(proj.path(), "a").unwrap();
    sleep(Duration::from_millis(5));
    let b = store.save_version(proj.path(), "b").unwrap();

    let ids: Vec<_> = store.get_versions().into_iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![b.version_id.clone(), a.version_id.clone()]);

    let stats = store.get_version_stats();
    assert_eq!(stats.total_versions, 2);
    assert_eq!(stats.newest_version.unwrap().id, b.version_id);
    assert_eq!(stats.oldest_version.unwrap().id, a.version_id);
    assert_eq!(stats.total_size, a.metadata.size_bytes + b.metadata.size_bytes);
    assert_eq!(stats.average_size, stats.total_size / 2);
}

#[test]
fn restore_replaces_target_contents() {
    let store_dir = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();
    let saved = store.save_version(proj.path(), "baseline").unwrap();

    proj.write("index.html", "<h1>v2</h1>\n");
    proj.write("extra.css", "body {}\n");
    fs::remove_file(proj.join("src/app.js")).unwrap();

    let restored = store.restore_version(&saved.version_id, proj.path()).unwrap();
    assert_eq!(restored.restored_files, 2);
    assert_eq!(proj.read("index.html"), "<h1>v1</h1>\n");
    assert_eq!(proj.read("src/app.js"), "console.log('v1');\n");
    assert!(!proj.exists("extra.css"));
    // excluded entries were never captured, so the restore drops them
    assert!(!proj.exists("node_modules"));
    assert!(!proj.exists("metadata.json"));
}

#[test]
fn restore_keeps_a_store_nested_in_the_target() {
    let proj = project();
    let store_dir = proj.join(".atelier/versions");
    let store = VersionStore::open(&store_dir, version_settings(&store_dir, 10)).unwrap();

    let saved = store.save_version(proj.path(), "nested").unwrap();
    let detail = store.get_version(&saved.version_id).unwrap();
    assert!(detail.files.iter().all(|f| !f.starts_with(".atelier")));

    proj.write("index.html", "changed\n");
    store.restore_version(&saved.version_id, proj.path()).unwrap();
    assert_eq!(proj.read("index.html"), "<h1>v1</h1>\n");
    assert_eq!(store.get_versions().len(), 1);
    assert!(store.get_version(&saved.version_id).is_ok());
}

#[test]
fn restore_into_the_store_is_rejected() {
    let store_dir = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();
    let saved = store.save_version(proj.path(), "x").unwrap();

    let err = store
        .restore_version(&saved.version_id, store_dir.path())
        .unwrap_err();
    assert_eq!(err.error_code(), "E_POLICY_VIOLATION");
    assert_eq!(store.get_versions().len(), 1);
}

#[test]
fn compare_reports_added_and_removed_files() {
    let store_dir = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();

    let first = store.save_version(proj.path(), "one").unwrap();
    fs::remove_file(proj.join("src/app.js")).unwrap();
    proj.write("about.html", "about\n");
    proj.write("styles/site.css", "h1 {}\n");
    let second = store.save_version(proj.path(), "two").unwrap();

    let diff = store
        .compare_versions(&first.version_id, &second.version_id)
        .unwrap();
    assert_eq!(diff.added, vec!["about.html", "styles/site.css"]);
    assert_eq!(diff.removed, vec!["src/app.js"]);
    assert_eq!(diff.file_count_diff, 1);
    assert!(diff.time_diff_ms >= 0);

    let reverse = store
        .compare_versions(&second.version_id, &first.version_id)
        .unwrap();
    assert_eq!(reverse.added, diff.removed);
    assert_eq!(reverse.removed, diff.added);
    assert_eq!(reverse.file_count_diff, -diff.file_count_diff);

    let same = store
        .compare_versions(&first.version_id, &first.version_id)
        .unwrap();
    assert!(same.added.is_empty() && same.removed.is_empty());
    assert_eq!(same.size_diff, 0);
}

#[test]
fn oldest_versions_are_pruned_beyond_capacity() {
    let store_dir = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 3)).unwrap();

    let ids: Vec<String> = (0..4)
        .map(|i| store.save_version(proj.path(), &format!("v{i}")).unwrap().version_id)
        .collect();

    let listed: Vec<String> = store.get_versions().into_iter().map(|v| v.id).collect();
    assert_eq!(listed.len(), 3);
    assert!(!listed.contains(&ids[0]));
    assert!(!store_dir.path().join(&ids[0]).exists());
    assert_eq!(store.get_version(&ids[0]).unwrap_err().error_code(), "E_NOT_FOUND");
    for id in &ids[1..] {
        assert!(store_dir.path().join(id).is_dir());
    }
}

#[test]
fn index_is_rebuilt_when_missing_or_corrupt() {
    let store_dir = Tmp::new();
    let proj = project();
    let settings = version_settings(store_dir.path(), 10);

    let (a, b) = {
        let store = VersionStore::open(store_dir.path(), settings.clone()).unwrap();
        let a = store.save_version(proj.path(), "a").unwrap();
        sleep(Duration::from_millis(5));
        let b = store.save_version(proj.path(), "b").unwrap();
        (a, b)
    };

    fs::write(store_dir.path().join("versions.json"), "{ not json").unwrap();
    fs::create_dir_all(store_dir.path().join(".staging-ver-stale")).unwrap();

    let reopened = VersionStore::open(store_dir.path(), settings.clone()).unwrap();
    let ids: Vec<_> = reopened.get_versions().into_iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![b.version_id.clone(), a.version_id.clone()]);
    assert!(!store_dir.path().join(".staging-ver-stale").exists());

    fs::remove_file(store_dir.path().join("versions.json")).unwrap();
    let again = VersionStore::open(store_dir.path(), settings).unwrap();
    assert_eq!(again.get_versions().len(), 2);
    assert!(store_dir.path().join("versions.json").is_file());
}

#[test]
fn two_handles_share_one_index() {
    let store_dir = Tmp::new();
    let proj = project();
    let settings = version_settings(store_dir.path(), 10);
    let first = VersionStore::open(store_dir.path(), settings.clone()).unwrap();
    let second = VersionStore::open(store_dir.path(), settings).unwrap();

    first.save_version(proj.path(), "from first").unwrap();
    second.save_version(proj.path(), "from second").unwrap();

    let raw = fs::read_to_string(store_dir.path().join("versions.json")).unwrap();
    let on_disk: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
    assert_eq!(on_disk.len(), 2);
    assert_eq!(second.get_versions().len(), 2);
}

#[test]
fn delete_removes_data_and_index_entry() {
    let store_dir = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();
    let saved = store.save_version(proj.path(), "doomed").unwrap();

    assert!(store.delete_version(&saved.version_id).unwrap());
    assert!(store.get_versions().is_empty());
    assert!(!store_dir.path().join(&saved.version_id).exists());
    let leftovers: Vec<_> = fs::read_dir(store_dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(".trash-"))
        .collect();
    assert!(leftovers.is_empty());
    assert_eq!(
        store.delete_version(&saved.version_id).unwrap_err().error_code(),
        "E_NOT_FOUND"
    );
}

#[test]
fn malformed_ids_are_not_found() {
    let store_dir = Tmp::new();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();

    for id in ["", "..", "../etc", "a/b", ".hidden", "ver 1"] {
        let err = store.get_version(id).unwrap_err();
        assert_eq!(err.error_code(), "E_NOT_FOUND", "id {id:?}");
        assert_eq!(store.delete_version(id).unwrap_err().error_code(), "E_NOT_FOUND");
    }
}

#[test]
fn preview_descriptor_is_kept_with_the_version() {
    let store_dir = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();

    let preview = PreviewDescriptor {
        url: Some("http://localhost:3000".to_string()),
        screenshot: None,
    };
    let saved = store
        .save_version_with_preview(proj.path(), "with preview", Some(&preview))
        .unwrap();

    let detail = store.get_version(&saved.version_id).unwrap();
    assert_eq!(detail.preview, Some(preview));
    assert!(!detail.files.contains(&"preview.json".to_string()));
}

#[test]
fn export_writes_zip_of_version_files() {
    let store_dir = Tmp::new();
    let out = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();
    let saved = store.save_version(proj.path(), "ship it").unwrap();

    let exported = store.export_version(&saved.version_id, out.path()).unwrap();
    assert_eq!(exported.path, out.path().join(format!("{}.zip", saved.version_id)));
    assert!(exported.size > 0);

    let mut archive = zip::ZipArchive::new(fs::File::open(&exported.path).unwrap()).unwrap();
    let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
    names.sort();
    assert!(names.contains(&"index.html".to_string()));
    assert!(names.contains(&"src/app.js".to_string()));

    let mut body = String::new();
    archive
        .by_name("index.html")
        .unwrap()
        .read_to_string(&mut body)
        .unwrap();
    assert_eq!(body, "<h1>v1</h1>\n");

    let named = store
        .export_version(&saved.version_id, &out.join("nested/site.zip"))
        .unwrap();
    assert!(named.path.ends_with("nested/site.zip"));
    assert!(named.path.is_file());

    let err = store
        .export_version(&saved.version_id, store_dir.path())
        .unwrap_err();
    assert_eq!(err.error_code(), "E_POLICY_VIOLATION");
}

#[test]
fn saving_a_missing_project_fails_cleanly() {
    let store_dir = Tmp::new();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();

    let err = store
        .save_version(&store_dir.join("nope"), "ghost")
        .unwrap_err();
    assert_eq!(err.error_code(), "E_NOT_FOUND");
    assert!(store.get_versions().is_empty());
}

#[test]
fn restore_requires_an_indexed_version() {
    let store_dir = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 10)).unwrap();
    let saved = store.save_version(proj.path(), "indexed").unwrap();

    // a directory with metadata that the index does not list
    let stray = store_dir.join("ver-stray");
    fs::create_dir_all(&stray).unwrap();
    fs::copy(
        store_dir.path().join(&saved.version_id).join("metadata.json"),
        stray.join("metadata.json"),
    )
    .unwrap();

    let target = Tmp::new();
    target.write("keep.txt", "untouched");
    let err = store.restore_version("ver-stray", target.path()).unwrap_err();
    assert_eq!(err.error_code(), "E_NOT_FOUND");
    assert_eq!(target.read("keep.txt"), "untouched");
}

#[test]
fn restore_sees_a_version_saved_through_another_handle() {
    let store_dir = Tmp::new();
    let proj = project();
    let settings = version_settings(store_dir.path(), 10);
    let writer = VersionStore::open(store_dir.path(), settings.clone()).unwrap();
    let reader = VersionStore::open(store_dir.path(), settings).unwrap();

    let saved = writer.save_version(proj.path(), "elsewhere").unwrap();
    let target = Tmp::new();
    let restored = reader.restore_version(&saved.version_id, target.path()).unwrap();
    assert_eq!(restored.restored_files, 2);
}

#[test]
fn restores_racing_with_pruning_are_whole_or_not_found() {
    let store_dir = Tmp::new();
    let proj = project();
    let store = VersionStore::open(store_dir.path(), version_settings(store_dir.path(), 1)).unwrap();
    store.save_version(proj.path(), "seed").unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..20 {
                store.save_version(proj.path(), &format!("save {i}")).unwrap();
            }
        });
        scope.spawn(|| {
            let target = Tmp::new();
            for _ in 0..20 {
                let Some(latest) = store.get_versions().first().map(|v| v.id.clone()) else {
                    continue;
                };
                match store.restore_version(&latest, target.path()) {
                    Ok(restored) => {
                        assert_eq!(restored.restored_files, 2);
                        assert!(target.exists("index.html"));
                        assert!(target.exists("src/app.js"));
                    }
                    Err(err) => assert_eq!(err.error_code(), "E_NOT_FOUND"),
                }
            }
        });
    });
    assert_eq!(store.get_versions().len(), 1);
}
