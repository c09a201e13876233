mod common;

use common::{Corpus, TestDb};
use gdbm_core::{Alignment, BlockSize, Error, OpenOptions};

#[test]
fn create_then_reopen() {
    common::init_logging();
    let env = TestDb::new();
    {
        let mut db = env.create();
        db.insert("key", "value").unwrap();
        db.close().unwrap();
    }

    let mut db = env.open_ro();
    let value: Option<String> = db.get("key").unwrap();
    assert_eq!(value.as_deref(), Some("value"));
}

#[test]
fn open_missing_file_fails() {
    let env = TestDb::new();
    assert!(matches!(
        OpenOptions::new().open(&env.path),
        Err(Error::Io(_))
    ));
    assert!(matches!(
        OpenOptions::new().write().open(&env.path),
        Err(Error::Io(_))
    ));
}

#[test]
fn wrcreat_opens_existing_database() {
    let env = TestDb::new();
    {
        let mut db = env.create();
        db.insert("kept", "yes").unwrap();
        db.close().unwrap();
    }

    // create() on an existing database must open it, not wipe it
    let mut db = env.create();
    let value: Option<String> = db.get("kept").unwrap();
    assert_eq!(value.as_deref(), Some("yes"));
}

#[test]
fn newdb_truncates_existing_database() {
    let env = TestDb::new();
    {
        let mut db = env.create();
        db.insert("old", "content").unwrap();
        db.close().unwrap();
    }

    let mut db = OpenOptions::new()
        .write()
        .create()
        .truncate()
        .open(&env.path)
        .unwrap();
    assert_eq!(db.len().unwrap(), 0);
}

#[test]
fn block_size_selection() {
    let env = TestDb::new();
    let db = OpenOptions::new()
        .write()
        .create()
        .block_size(BlockSize::Exactly(512))
        .open(&env.path)
        .unwrap();
    assert_eq!(db.block_size(), 512);
    assert_eq!(db.bucket_size(), 512);
    drop(db);

    // a rough size is rounded up to a power of two
    let env = TestDb::new();
    let db = OpenOptions::new()
        .write()
        .create()
        .block_size(BlockSize::Roughly(600))
        .open(&env.path)
        .unwrap();
    assert_eq!(db.block_size(), 1024);
    drop(db);

    // an exact size that needs rounding is refused
    let env = TestDb::new();
    assert!(matches!(
        OpenOptions::new()
            .write()
            .create()
            .block_size(BlockSize::Exactly(600))
            .open(&env.path),
        Err(Error::BadBlockSize {
            requested: 600,
            actual: 1024
        })
    ));
}

#[test]
fn alignment_is_stored_in_magic() {
    let env = TestDb::new();
    {
        let db = OpenOptions::new()
            .write()
            .create()
            .alignment(Some(Alignment::Align32))
            .open(&env.path)
            .unwrap();
        assert_eq!(db.alignment(), Alignment::Align32);
        db.close().unwrap();
    }

    let db = env.open_ro();
    assert_eq!(db.alignment(), Alignment::Align32);
}

#[test]
fn align32_database_round_trips_data() {
    let env = TestDb::new();
    let corpus = Corpus::words(250);
    {
        let mut db = OpenOptions::new()
            .write()
            .create()
            .alignment(Some(Alignment::Align32))
            .block_size(BlockSize::Exactly(512))
            .open(&env.path)
            .unwrap();
        corpus.store_into(&mut db);
        db.close().unwrap();
    }

    let mut db = env.open_rw();
    assert_eq!(common::drain(&mut db), corpus.as_map());
}

#[test]
fn garbage_magic_is_rejected() {
    let env = TestDb::new();
    std::fs::write(&env.path, vec![0x42u8; 2048]).unwrap();

    assert!(matches!(
        OpenOptions::new().open(&env.path),
        Err(Error::BadMagic(_))
    ));
}

#[test]
fn byte_swapped_magic_is_rejected() {
    let env = TestDb::new();
    env.create().close().unwrap();

    // simulate a file from a foreign-endian host by swapping the magic
    let mut image = std::fs::read(&env.path).unwrap();
    image[0..4].reverse();
    std::fs::write(&env.path, image).unwrap();

    assert!(matches!(
        OpenOptions::new().open(&env.path),
        Err(Error::ByteSwapped(_))
    ));
}

#[test]
fn truncated_file_needs_recovery() {
    let env = TestDb::new();
    {
        let mut db = env.create_small();
        Corpus::words(100).store_into(&mut db);
        db.close().unwrap();
    }

    let len = std::fs::metadata(&env.path).unwrap().len();
    let f = std::fs::OpenOptions::new()
        .write(true)
        .open(&env.path)
        .unwrap();
    f.set_len(len - 512).unwrap();
    drop(f);

    assert!(matches!(
        OpenOptions::new().open(&env.path),
        Err(Error::NeedsRecovery)
    ));
}

#[test]
fn mmap_and_plain_io_see_the_same_database() {
    let env = TestDb::new();
    let corpus = Corpus::words(300);
    {
        let mut db = env.create_small();
        corpus.store_into(&mut db);
        db.close().unwrap();
    }

    let mut mapped = OpenOptions::new().open(&env.path).unwrap();
    let mut plain = OpenOptions::new().no_mmap().open(&env.path).unwrap();

    assert_eq!(common::drain_ro(&mut mapped), corpus.as_map());
    assert_eq!(common::drain_ro(&mut plain), corpus.as_map());
}

#[test]
fn tempfile_database_works() {
    let mut db = OpenOptions::new().write().create().tempfile().unwrap();
    db.insert("ephemeral", "yes").unwrap();
    let value: Option<String> = db.get("ephemeral").unwrap();
    assert_eq!(value.as_deref(), Some("yes"));
    assert_eq!(db.path(), None);
}
