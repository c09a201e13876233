mod common;

use std::collections::HashSet;

use common::{Corpus, TestDb};

#[test]
fn empty_database_iterates_nothing() {
    let env = TestDb::new();
    let mut db = env.create();

    assert_eq!(db.len().unwrap(), 0);
    assert_eq!(db.iter::<Vec<u8>, Vec<u8>>().count(), 0);
    assert_eq!(db.first_key().unwrap(), None);
}

#[test]
fn iteration_visits_every_key_exactly_once() {
    let env = TestDb::new();
    let mut db = env.create_small();
    let corpus = Corpus::words(500);
    corpus.store_into(&mut db);

    let mut seen = HashSet::new();
    for kv in db.iter::<Vec<u8>, Vec<u8>>() {
        let (key, _) = kv.unwrap();
        assert!(seen.insert(key), "key visited twice");
    }

    let expected: HashSet<Vec<u8>> = corpus.as_map().into_keys().collect();
    assert_eq!(seen, expected);
}

#[test]
fn len_matches_full_iteration() {
    let env = TestDb::new();
    let mut db = env.create_small();
    let corpus = Corpus::words(321);
    corpus.store_into(&mut db);

    assert_eq!(db.len().unwrap(), db.iter::<Vec<u8>, Vec<u8>>().count());
    assert_eq!(db.len().unwrap(), 321);
}

#[test]
fn keys_and_values_agree_with_iter() {
    let env = TestDb::new();
    let mut db = env.create();
    let corpus = Corpus::words(64);
    corpus.store_into(&mut db);

    let keys: HashSet<String> = db.keys::<String>().map(|k| k.unwrap()).collect();
    let values: HashSet<String> = db.values::<String>().map(|v| v.unwrap()).collect();

    for (key, value) in &corpus.records {
        assert!(keys.contains(key));
        assert!(values.contains(value));
    }
}

#[test]
fn stateless_cursor_walks_every_key() {
    let env = TestDb::new();
    let mut db = env.create_small();
    let corpus = Corpus::words(300);
    corpus.store_into(&mut db);

    let mut seen = HashSet::new();
    let mut cursor = db.first_key().unwrap();
    while let Some(key) = cursor {
        assert!(seen.insert(key.clone()), "cursor revisited a key");
        // the fetch after a cursor step is the hot path
        let value: Option<Vec<u8>> = db.get(&key).unwrap();
        assert!(value.is_some());
        cursor = db.next_key(&key).unwrap();
    }

    let expected: HashSet<Vec<u8>> = corpus.as_map().into_keys().collect();
    assert_eq!(seen, expected);
}

#[test]
fn next_key_of_missing_key_ends_iteration() {
    let env = TestDb::new();
    let mut db = env.create();
    db.insert("here", "value").unwrap();

    assert_eq!(db.next_key("never-stored").unwrap(), None);
}

#[test]
fn cursor_survives_concurrent_deletes() {
    let env = TestDb::new();
    let mut db = env.create_small();
    let corpus = Corpus::words(100);
    corpus.store_into(&mut db);

    // deleting behind the cursor may skip or revisit keys, but must
    // neither fail nor loop forever
    let mut walked = 0;
    let mut cursor = db.first_key().unwrap();
    while let Some(key) = cursor {
        walked += 1;
        cursor = db.next_key(&key).unwrap();
        db.remove(&key).unwrap();
        if walked > 1000 {
            panic!("cursor failed to terminate");
        }
    }
    assert!(walked > 0);
}
