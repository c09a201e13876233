mod common;

use common::{Corpus, TestDb};
use gdbm_core::{Error, ExportBinMode, ImportMode};

fn corpus_shapes() -> Vec<Corpus> {
    vec![
        Corpus::words(2000),
        Corpus {
            records: vec![(String::new(), "value for empty key".to_string())],
        },
        Corpus {
            records: vec![("key with empty value".to_string(), String::new())],
        },
    ]
}

#[test]
fn ascii_round_trip() {
    common::init_logging();
    for corpus in corpus_shapes() {
        let src_env = TestDb::new();
        let mut src = src_env.create();
        corpus.store_into(&mut src);

        // leave a manifest next to the dump and verify against the
        // reloaded copy
        let manifest = src_env.dir.path().join("manifest.json");
        corpus.save(&manifest);

        let mut dump = Vec::new();
        src.export_ascii(&mut dump).unwrap();

        let dst_env = TestDb::new();
        let mut dst = dst_env.create();
        dst.import_ascii(&mut dump.as_slice(), ImportMode::Insert)
            .unwrap();

        let expected = Corpus::load(&manifest).as_map();
        assert_eq!(common::drain(&mut dst), expected);
        assert_eq!(common::drain(&mut src), expected);
    }
}

#[test]
fn binary_round_trip() {
    for corpus in corpus_shapes() {
        for mode in [ExportBinMode::Exp32, ExportBinMode::Exp64] {
            let src_env = TestDb::new();
            let mut src = src_env.create();
            corpus.store_into(&mut src);

            let mut dump = Vec::new();
            src.export_bin(&mut dump, mode).unwrap();

            let dst_env = TestDb::new();
            let mut dst = dst_env.create();
            dst.import_bin(&mut dump.as_slice(), mode, ImportMode::Insert)
                .unwrap();

            assert_eq!(common::drain(&mut dst), corpus.as_map());
        }
    }
}

#[test]
fn ascii_dump_is_line_oriented_text() {
    let env = TestDb::new();
    let mut db = env.create();
    db.insert("key", &vec![0u8; 300]).unwrap();

    let mut dump = Vec::new();
    db.export_ascii(&mut dump).unwrap();
    let text = String::from_utf8(dump).unwrap();

    assert!(text.starts_with("# GDBM dump file created by"));
    assert!(text.contains("#:len=300"));
    assert!(text.ends_with("# End of data\n"));
    // base64 payload is wrapped
    assert!(text.lines().all(|line| line.len() <= 76));
}

#[test]
fn insert_mode_load_rejects_collisions() {
    let src_env = TestDb::new();
    let mut src = src_env.create();
    src.insert("shared", "dumped value").unwrap();
    src.insert("unique", "other").unwrap();

    let mut dump = Vec::new();
    src.export_bin(&mut dump, ExportBinMode::Exp64).unwrap();

    // a colliding key makes INSERT-mode loads fail...
    let dst_env = TestDb::new();
    let mut dst = dst_env.create();
    dst.insert("shared", "resident value").unwrap();
    assert!(matches!(
        dst.import_bin(&mut dump.as_slice(), ExportBinMode::Exp64, ImportMode::Insert),
        Err(Error::CannotReplace)
    ));

    // ...while REPLACE-mode loads take the dump's content
    dst.import_bin(&mut dump.as_slice(), ExportBinMode::Exp64, ImportMode::Replace)
        .unwrap();
    let value: Option<String> = dst.get("shared").unwrap();
    assert_eq!(value.as_deref(), Some("dumped value"));
    let value: Option<String> = dst.get("unique").unwrap();
    assert_eq!(value.as_deref(), Some("other"));
}

#[test]
fn reorganize_preserves_content_and_shrinks_file() {
    let env = TestDb::new();
    let mut db = env.create_small();
    let corpus = Corpus::words(400);
    corpus.store_into(&mut db);

    // churn to spread free space through the file
    for (key, _) in corpus.records.iter().skip(100) {
        db.remove(key).unwrap();
    }
    db.sync().unwrap();
    let before = std::fs::metadata(&env.path).unwrap().len();

    db.compact().unwrap();
    db.sync().unwrap();
    let after = std::fs::metadata(&env.path).unwrap().len();
    assert!(after < before, "compaction did not shrink {before} -> {after}");

    let mut expected = corpus.as_map();
    for (key, _) in corpus.records.iter().skip(100) {
        expected.remove(key.as_bytes());
    }
    assert_eq!(common::drain(&mut db), expected);
}
