use std::fs;
use std::thread::sleep;
use std::time::Duration;

use serde_json::{Value, json};

use stampede_cache::config::FileStoreConfig;
use stampede_cache::{BinaryFileStore, FileLayout, SourceFileStore, Store};

use crate::{Backend, setup_store};

#[test]
fn test_roundtrip_and_expiry() {
    let stores: Vec<_> = [Backend::Binary, Backend::Source]
        .into_iter()
        .map(setup_store)
        .collect();
    let value = json!({"title": "Hello", "tags": ["a", "b"], "views": 3});

    for (store, _) in &stores {
        store
            .set("post-1", value.clone(), Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(store.get("post-1").unwrap(), Some(value.clone()));
        assert!(store.has("post-1").unwrap());
    }

    sleep(Duration::from_millis(1100));

    for (store, _) in &stores {
        let fallback = json!("default");
        assert_eq!(store.get("post-1").unwrap().unwrap_or(fallback.clone()), fallback);
        assert!(!store.has("post-1").unwrap());
    }
}

#[test]
fn test_on_disk_layout() {
    stampede_test::setup();
    let dir = stampede_test::tempdir();

    let binary = BinaryFileStore::new(
        FileLayout::new(dir.path().join("bin"), BinaryFileStore::SUFFIX).directory_level(2),
    )
    .unwrap();
    let source = SourceFileStore::new(
        FileLayout::new(dir.path().join("src"), ".cache").directory_level(2),
    )
    .unwrap();

    binary.set("abcdef", json!(1), None).unwrap();
    source.set("abcdef", json!(1), None).unwrap();

    assert!(dir.path().join("bin/ab/cd/abcdef.bin").is_file());
    assert!(dir.path().join("src/ab/cd/abcdef.cache").is_file());
}

#[test]
fn test_from_config() {
    stampede_test::setup();
    let dir = stampede_test::tempdir();
    let config = FileStoreConfig {
        path: dir.path().to_owned(),
        directory_level: 0,
        file_suffix: Some(".data".into()),
        file_mode: 0o600,
        gc_probability: 0,
        compression_level: Some(3),
        ..Default::default()
    };

    let store = BinaryFileStore::from_config(&config).unwrap();
    store.set("key", json!("value"), None).unwrap();

    let path = dir.path().join("key.data");
    assert!(path.is_file());
    assert_eq!(store.get("key").unwrap(), Some(json!("value")));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn test_aged_binary_file_is_expired() {
    let (store, dir) = setup_store(Backend::Binary);
    store.set("abc", json!(1), None).unwrap();

    stampede_test::age_file(dir.path().join("ab/abc.bin"), Duration::from_secs(1));
    assert_eq!(store.get("abc").unwrap(), None);
}

#[test]
fn test_expired_source_file_is_expired() {
    let (store, dir) = setup_store(Backend::Source);
    store.set("abc", json!(1), None).unwrap();

    let path = dir.path().join("ab/abc.vex");
    fs::write(&path, "[1000, 1]").unwrap();
    assert_eq!(store.get("abc").unwrap(), None);

    fs::write(&path, "[0, 2]").unwrap();
    assert_eq!(store.get("abc").unwrap(), Some(json!(2)));
}

#[test]
fn test_gc_removes_expired_files() {
    stampede_test::setup();
    let dir = stampede_test::tempdir();
    let store = BinaryFileStore::new(FileLayout::new(dir.path(), ".bin").gc_probability(0)).unwrap();

    for key in ["fresh", "stale-1", "stale-2"] {
        store.set(key, json!(key), None).unwrap();
    }
    stampede_test::age_file(dir.path().join("st/stale-1.bin"), Duration::from_secs(60));
    stampede_test::age_file(dir.path().join("st/stale-2.bin"), Duration::from_secs(60));

    let stats = store.gc().unwrap();
    assert_eq!(stats.removed_files, 2);
    assert_eq!(stats.retained_files, 1);
    // directories survive expiry-only passes
    assert!(dir.path().join("st").is_dir());
    assert_eq!(store.get("fresh").unwrap(), Some(json!("fresh")));
}

#[test]
fn test_gc_on_write() {
    stampede_test::setup();
    let dir = stampede_test::tempdir();
    let store =
        SourceFileStore::new(FileLayout::new(dir.path(), ".vex").gc_probability(1_000_000))
            .unwrap();

    store.set("stale", json!(1), None).unwrap();
    fs::write(dir.path().join("st/stale.vex"), "[1, 1]").unwrap();

    // every write collects garbage
    store.set("other", json!(2), None).unwrap();
    assert!(!dir.path().join("st/stale.vex").exists());
    assert_eq!(store.get("other").unwrap(), Some(json!(2)));
}

#[test]
fn test_clear() {
    for backend in [Backend::Binary, Backend::Source] {
        let (store, dir) = setup_store(backend);
        for key in ["a", "abc", "xyz"] {
            store.set(key, Value::from(key), None).unwrap();
        }

        store.clear().unwrap();

        assert!(dir.path().is_dir(), "{backend:?}");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0, "{backend:?}");
        assert_eq!(
            store.get_multiple(&["a", "abc", "xyz"]).unwrap(),
            vec![None, None, None]
        );
    }
}

#[test]
fn test_rejects_invalid_keys() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        assert!(store.set("", json!(1), None).is_err(), "{backend:?}");
        assert!(store.set("../escape", json!(1), None).is_err(), "{backend:?}");
        assert!(store.get("a/b").is_err(), "{backend:?}");
    }
}
