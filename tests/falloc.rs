mod common;

use common::{Corpus, TestDb};

#[test]
fn central_free_overflows_and_drains_the_avail_stack() {
    common::init_logging();
    let env = TestDb::new();
    let mut db = env.create_small();

    // with 512-byte blocks the header avail table holds a few dozen
    // elements; freeing hundreds of records must push overflow blocks
    db.set_central_free(true);

    let corpus = Corpus::words(500);
    corpus.store_into(&mut db);
    for (key, _) in &corpus.records {
        assert!(db.remove(key).unwrap().is_some());
    }
    assert_eq!(db.len().unwrap(), 0);

    // refilling drains the stack back through the header table
    corpus.store_into(&mut db);
    assert_eq!(common::drain(&mut db), corpus.as_map());

    db.sync().unwrap();
}

#[test]
fn freed_space_is_reused() {
    let env = TestDb::new();
    let mut db = env.create_small();
    db.set_central_free(true);
    db.set_coalesce_blocks(true);

    let corpus = Corpus::words(200);

    // warm up: let the file grow to its working size
    for _ in 0..3 {
        corpus.store_into(&mut db);
        for (key, _) in &corpus.records {
            db.remove(key).unwrap();
        }
    }
    db.sync().unwrap();
    let settled = std::fs::metadata(&env.path).unwrap().len();

    // further identical churn feeds on recycled extents
    for _ in 0..5 {
        corpus.store_into(&mut db);
        for (key, _) in &corpus.records {
            db.remove(key).unwrap();
        }
    }
    db.sync().unwrap();
    let after = std::fs::metadata(&env.path).unwrap().len();

    assert!(
        after <= settled * 2,
        "free space is not being reused: {settled} -> {after}"
    );
}

#[test]
fn distributed_avail_serves_small_allocations() {
    let env = TestDb::new();
    let mut db = env.create_small();

    let corpus = Corpus::words(100);
    corpus.store_into(&mut db);

    // deleting and reinserting within one bucket's neighbourhood keeps
    // the traffic in the distributed avail tables
    for (key, value) in &corpus.records {
        db.remove(key).unwrap();
        db.insert(key, value).unwrap();
    }

    assert_eq!(common::drain(&mut db), corpus.as_map());

    // survives a reopen, so the avail bookkeeping that was written out
    // is well formed
    db.close().unwrap();
    let mut db = env.open_rw();
    assert_eq!(common::drain(&mut db), corpus.as_map());
}
