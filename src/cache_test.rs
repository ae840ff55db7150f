use super::*;

fn temp_cache() -> (tempfile::TempDir, LocalCache) {
    let dir = tempfile::tempdir().unwrap();
    let cache = LocalCache::open(dir.path().join("data")).unwrap();
    (dir, cache)
}

#[test]
fn open_creates_directory() {
    let (_dir, cache) = temp_cache();
    assert!(cache.dir().is_dir());
}

#[test]
fn missing_slot_reads_as_none() {
    let (_dir, cache) = temp_cache();
    assert_eq!(cache.get("products").unwrap(), None);
}

#[test]
fn set_then_get_returns_value() {
    let (_dir, cache) = temp_cache();
    cache.set("products", "[1,2,3]").unwrap();
    assert_eq!(cache.get("products").unwrap().as_deref(), Some("[1,2,3]"));
}

#[test]
fn set_overwrites_and_leaves_no_temp_files() {
    let (_dir, cache) = temp_cache();
    cache.set("products", "old").unwrap();
    cache.set("products", "new").unwrap();
    assert_eq!(cache.get("products").unwrap().as_deref(), Some("new"));

    let leftovers = fs::read_dir(cache.dir())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn remove_reports_whether_slot_existed() {
    let (_dir, cache) = temp_cache();
    cache.set("bulk_transfer", "x").unwrap();
    assert!(cache.remove("bulk_transfer").unwrap());
    assert!(!cache.remove("bulk_transfer").unwrap());
    assert_eq!(cache.get("bulk_transfer").unwrap(), None);
}

#[test]
fn keys_with_path_characters_are_rejected() {
    let (_dir, cache) = temp_cache();
    assert!(matches!(cache.get("../escape"), Err(CacheError::InvalidKey(_))));
    assert!(matches!(cache.set("a/b", "x"), Err(CacheError::InvalidKey(_))));
    assert!(matches!(cache.remove(""), Err(CacheError::InvalidKey(_))));
}
