mod common;

use common::{Corpus, TestDb};
use gdbm_core::OpenOptions;

#[test]
fn explicit_cachesize_is_respected() {
    let env = TestDb::new();
    env.create().close().unwrap();

    let db = OpenOptions::new()
        .cachesize(Some(4))
        .open(&env.path)
        .unwrap();
    assert_eq!(db.cachesize(), 4);
}

#[test]
fn shrink_keeps_recently_used_buckets_resident() {
    common::init_logging();
    let env = TestDb::new();
    let mut db = env.create_small();
    let corpus = Corpus::words(600);
    corpus.store_into(&mut db);

    // touch a handful of keys so their buckets are the most recent
    let hot: Vec<&str> = corpus.records[..4].iter().map(|(k, _)| k.as_str()).collect();
    for key in &hot {
        let _: Option<Vec<u8>> = db.get(*key).unwrap();
    }

    db.set_cachesize(8).unwrap();
    assert_eq!(db.cachesize(), 8);

    // refetching the hot keys must be pure cache hits
    let before = db.cache_stats();
    for key in &hot {
        let value: Option<Vec<u8>> = db.get(*key).unwrap();
        assert!(value.is_some());
    }
    let after = db.cache_stats();

    assert_eq!(after.accesses - before.accesses, hot.len() as u64);
    assert_eq!(after.hits - before.hits, hot.len() as u64);
}

#[test]
fn shrunk_cache_still_resolves_every_bucket() {
    let env = TestDb::new();
    let mut db = env.create_small();
    let corpus = Corpus::words(500);
    corpus.store_into(&mut db);

    db.set_cachesize(2).unwrap();

    for (key, value) in &corpus.records {
        let found: Option<String> = db.get(key).unwrap();
        assert_eq!(found.as_ref(), Some(value));
    }
}

#[test]
fn eviction_writes_dirty_buckets_back() {
    let env = TestDb::new();
    let corpus = Corpus::words(400);

    {
        let mut db = env.create_small();
        // a single-bucket cache forces a steady stream of dirty
        // evictions while the corpus goes in
        db.set_cachesize(1).unwrap();
        corpus.store_into(&mut db);
        db.close().unwrap();
    }

    let mut db = env.open_rw();
    assert_eq!(common::drain(&mut db), corpus.as_map());
}

#[test]
fn growing_the_cache_is_lazy_and_safe() {
    let env = TestDb::new();
    let mut db = env.create_small();
    let corpus = Corpus::words(300);
    corpus.store_into(&mut db);

    db.set_cachesize(2).unwrap();
    db.set_cachesize(512).unwrap();

    assert_eq!(common::drain(&mut db), corpus.as_map());
}

#[test]
fn cache_stats_accumulate() {
    let env = TestDb::new();
    let mut db = env.create();
    db.insert("key", "value").unwrap();

    let before = db.cache_stats();
    for _ in 0..10 {
        let _: Option<Vec<u8>> = db.get("key").unwrap();
    }
    let after = db.cache_stats();

    assert!(after.accesses >= before.accesses + 10);
    assert!(after.hits >= before.hits + 10);
}
