use std::fs;
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use stampede_cache::{Cache, Dependency, Key, Options, Store, Ttl, normalize};

use crate::{Backend, Counter, setup_store};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Post {
    id: u32,
    title: String,
}

#[test]
fn test_single_computation() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        let cache = Cache::new(store);
        let calls = Counter::new();

        let post: Post = cache
            .get_or_set(("post", 1), |_| {
                calls.hit();
                Post {
                    id: 1,
                    title: "Hello".into(),
                }
            })
            .unwrap();

        assert_eq!(calls.get(), 1, "{backend:?}");
        assert_eq!(post.title, "Hello", "{backend:?}");
    }
}

#[test]
fn test_cache_hit() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        let cache = Cache::new(store);
        let calls = Counter::new();
        let options = Options::new().ttl(Duration::from_secs(3600)).beta(0.0);

        for _ in 0..3 {
            let value: u32 = cache
                .get_or_set_with("answer", options.clone(), |_| {
                    calls.hit();
                    42
                })
                .unwrap();
            assert_eq!(value, 42);
        }

        assert_eq!(calls.get(), 1, "{backend:?}");
    }
}

#[test]
fn test_hard_expiry() {
    let caches: Vec<_> = Backend::ALL
        .into_iter()
        .map(|backend| {
            let (store, dir) = setup_store(backend);
            (backend, Cache::new(store), dir)
        })
        .collect();
    let options = Options::new().ttl(1).beta(0.0);

    for (_, cache, _) in &caches {
        let value: usize = cache.get_or_set_with("k", options.clone(), |_| 1).unwrap();
        assert_eq!(value, 1);
    }

    sleep(Duration::from_millis(1100));

    for (backend, cache, _) in &caches {
        let calls = Counter::new();
        let value: usize = cache
            .get_or_set_with("k", options.clone(), |_| calls.hit() + 1)
            .unwrap();
        assert_eq!(calls.get(), 1, "{backend:?}");
        assert_eq!(value, 2, "{backend:?}");
    }
}

#[test]
fn test_non_positive_ttl_deletes() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        let cache = Cache::new(store.clone());

        let value: String = cache
            .get_or_set_with("zero", Options::new().ttl(0), |_| "uncached".to_owned())
            .unwrap();
        assert_eq!(value, "uncached");
        assert!(!store.has("zero").unwrap(), "{backend:?}");

        let value: String = cache
            .get_or_set_with("negative", Options::new().ttl(-10), |_| "uncached".to_owned())
            .unwrap();
        assert_eq!(value, "uncached");
        assert!(!store.has("negative").unwrap(), "{backend:?}");

        // a zero duration is the same as a zero TTL
        let calls = Counter::new();
        for _ in 0..2 {
            let _: u32 = cache
                .get_or_set_with("duration", Options::new().ttl(Duration::ZERO), |_| {
                    calls.hit();
                    1
                })
                .unwrap();
        }
        assert_eq!(calls.get(), 2, "{backend:?}");
    }
}

#[test]
fn test_huge_ttl() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        let cache = Cache::new(store.clone());
        let calls = Counter::new();

        for ttl in [Ttl::from(Duration::MAX), Ttl::from(i64::MAX)] {
            for _ in 0..2 {
                let value: usize = cache
                    .get_or_set_with("huge", Options::new().ttl(ttl).beta(0.0), |_| calls.hit())
                    .unwrap();
                assert_eq!(value, 1, "{backend:?}");
            }
        }
        assert_eq!(calls.get(), 1, "{backend:?}");
        assert!(store.has("huge").unwrap(), "{backend:?}");

        store.set("raw", json!(1), Some(Duration::MAX)).unwrap();
        assert_eq!(store.get("raw").unwrap(), Some(json!(1)), "{backend:?}");
    }
}

#[test]
fn test_callback_dependency() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        let version = Arc::new(Mutex::new(json!("A")));
        let source_version = version.clone();
        let cache = Cache::builder(store)
            .source("schema", move |_: &dyn Store| {
                source_version.lock().unwrap().clone()
            })
            .build();

        let calls = Counter::new();
        let options = Options::new()
            .ttl(Ttl::Forever)
            .beta(0.0)
            .dependency(Dependency::callback("schema"));
        let produce = || {
            cache
                .get_or_set_with("k", options.clone(), |_| calls.hit())
                .unwrap()
        };

        assert_eq!(produce(), 1);
        assert_eq!(produce(), 1);

        *version.lock().unwrap() = json!("B");
        assert_eq!(produce(), 2, "{backend:?}");
        assert_eq!(produce(), 2, "{backend:?}");
    }
}

#[test]
fn test_file_dependency() {
    for backend in Backend::ALL {
        let (store, dir) = setup_store(backend);
        let cache = Cache::new(store);
        let config = dir.path().join("settings.yml");
        fs::write(&config, "debug: false").unwrap();

        let calls = Counter::new();
        let options = Options::new().dependency(Dependency::file(&config));
        let produce = || {
            cache
                .get_or_set_with("settings", options.clone(), |_| {
                    calls.hit();
                    fs::read_to_string(&config).unwrap()
                })
                .unwrap()
        };

        assert_eq!(produce(), "debug: false");
        assert_eq!(calls.get(), 1);

        fs::write(&config, "debug: true").unwrap();
        stampede_test::age_file(&config, Duration::from_secs(60));
        assert_eq!(produce(), "debug: true", "{backend:?}");
        assert_eq!(calls.get(), 2, "{backend:?}");

        fs::remove_file(&config).unwrap();
        let calls_before = calls.get();
        let _ = cache.get_or_set_with("settings", options.clone(), |_| {
            calls.hit();
            String::new()
        });
        assert_eq!(calls.get(), calls_before + 1, "{backend:?}");
    }
}

#[test]
fn test_composite_dependencies() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        let version = Arc::new(Mutex::new(1));
        let source_version = version.clone();
        let cache = Cache::builder(store)
            .source("changing", move |_: &dyn Store| {
                json!(*source_version.lock().unwrap())
            })
            .source("stable", |_: &dyn Store| json!("stable"))
            .build();

        let changing = Dependency::callback("changing");
        let stable = Dependency::callback("stable");
        let any = Options::new().dependency(Dependency::any([changing.clone(), stable.clone()]));
        let all = Options::new().dependency(Dependency::all([changing, stable]));

        let any_calls = Counter::new();
        let all_calls = Counter::new();
        let _: usize = cache.get_or_set_with("any", any.clone(), |_| any_calls.hit()).unwrap();
        let _: usize = cache.get_or_set_with("all", all.clone(), |_| all_calls.hit()).unwrap();

        *version.lock().unwrap() = 2;

        let _: usize = cache.get_or_set_with("any", any, |_| any_calls.hit()).unwrap();
        let _: usize = cache.get_or_set_with("all", all, |_| all_calls.hit()).unwrap();
        assert_eq!(any_calls.get(), 2, "{backend:?}");
        assert_eq!(all_calls.get(), 1, "{backend:?}");
    }
}

#[test]
fn test_tag_invalidation() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        let cache = Cache::new(store);
        let calls = Counter::new();

        let posts = Options::new().dependency(Dependency::tags(["posts"]));
        let users = Options::new().dependency(Dependency::tags(["users"]));
        let _: usize = cache.get_or_set_with("posts", posts.clone(), |_| calls.hit()).unwrap();
        let _: usize = cache.get_or_set_with("users", users.clone(), |_| calls.hit()).unwrap();

        cache.invalidate_tags(["posts"]).unwrap();

        let posts_value: usize = cache.get_or_set_with("posts", posts, |_| calls.hit()).unwrap();
        let users_value: usize = cache.get_or_set_with("users", users, |_| calls.hit()).unwrap();
        assert_eq!(posts_value, 3, "{backend:?}");
        assert_eq!(users_value, 2, "{backend:?}");
    }
}

#[test]
fn test_remove() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        let cache = Cache::new(store.clone());

        cache.remove("missing").unwrap();

        let _: u32 = cache.get_or_set("present", |_| 1).unwrap();
        assert!(store.has("present").unwrap(), "{backend:?}");

        cache.remove("present").unwrap();
        assert!(!store.has("present").unwrap(), "{backend:?}");
        assert!(!cache.store().has("present").unwrap(), "{backend:?}");

        // removing twice is fine
        cache.remove("present").unwrap();

        let calls = Counter::new();
        let _: usize = cache.get_or_set("present", |_| calls.hit()).unwrap();
        assert_eq!(calls.get(), 1, "{backend:?}");
    }
}

#[test]
fn test_composite_keys() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        let cache = Cache::new(store.clone());
        let calls = Counter::new();

        let first: usize = cache.get_or_set(("user", 42), |_| calls.hit()).unwrap();
        let key = Key::from(vec![Key::from("user"), Key::from(42)]);
        let second: usize = cache.get_or_set(key.clone(), |_| calls.hit()).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.get(), 1, "{backend:?}");

        // keys with reserved characters are hashed instead of rejected
        let _: usize = cache.get_or_set("user:42", |_| calls.hit()).unwrap();
        assert_eq!(calls.get(), 2, "{backend:?}");

        let normalized = normalize(&key).unwrap();
        assert!(store.has(&normalized).unwrap(), "{backend:?}");
    }
}

#[test]
fn test_raw_values_are_not_entries() {
    for backend in Backend::ALL {
        let (store, _dir) = setup_store(backend);
        let cache = Cache::new(store.clone());
        store.set("raw", json!("not an entry"), None).unwrap();

        let calls = Counter::new();
        let value: usize = cache.get_or_set("raw", |_| calls.hit()).unwrap();
        assert_eq!(value, 1, "{backend:?}");

        // the producer handle reads through dependencies
        let stored: Value = cache
            .get_or_set("reader", |store: &dyn Store| {
                store.get("raw").unwrap().unwrap_or(Value::Null)
            })
            .unwrap();
        assert_eq!(stored, json!(1), "{backend:?}");
    }
}

#[test]
fn test_shared_directory() {
    for backend in [Backend::Binary, Backend::Source] {
        let (store, dir) = setup_store(backend);
        let first = Cache::new(store);
        let second = Cache::new(backend.open(&dir));
        let calls = Counter::new();

        let _: usize = first.get_or_set("shared", |_| calls.hit()).unwrap();
        let value: usize = second.get_or_set("shared", |_| calls.hit()).unwrap();
        assert_eq!(value, 1, "{backend:?}");
        assert_eq!(calls.get(), 1, "{backend:?}");

        second.remove("shared").unwrap();
        let value: usize = first.get_or_set("shared", |_| calls.hit()).unwrap();
        assert_eq!(value, 2, "{backend:?}");
    }
}
