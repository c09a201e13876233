use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gdbm_core::{BlockSize, Gdbm, OpenOptions, ReadOnly, ReadWrite};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

/// A scratch directory holding one test database (and whatever other
/// files a test wants to put next to it).
pub struct TestDb {
    pub dir: TempDir,
    pub path: PathBuf,
}

#[allow(dead_code)]
impl TestDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        TestDb { dir, path }
    }

    pub fn create(&self) -> Gdbm<ReadWrite> {
        OpenOptions::new().write().create().open(&self.path).unwrap()
    }

    /// A database with 512-byte blocks, so buckets hold few elements
    /// and splits come early.
    pub fn create_small(&self) -> Gdbm<ReadWrite> {
        OpenOptions::new()
            .write()
            .create()
            .block_size(BlockSize::Exactly(512))
            .open(&self.path)
            .unwrap()
    }

    pub fn open_ro(&self) -> Gdbm<ReadOnly> {
        OpenOptions::new().open(&self.path).unwrap()
    }

    pub fn open_rw(&self) -> Gdbm<ReadWrite> {
        OpenOptions::new().write().open(&self.path).unwrap()
    }
}

/// Deterministic key/value corpus, serializable so a test can leave a
/// manifest next to a dump and cross-check what came back.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    pub records: Vec<(String, String)>,
}

#[allow(dead_code)]
impl Corpus {
    pub fn words(n: usize) -> Corpus {
        Corpus {
            records: (0..n).map(|i| (i.to_string(), word(i))).collect(),
        }
    }

    pub fn store_into(&self, db: &mut Gdbm<ReadWrite>) {
        for (key, value) in &self.records {
            db.insert(key, value).unwrap();
        }
    }

    pub fn as_map(&self) -> HashMap<Vec<u8>, Vec<u8>> {
        self.records
            .iter()
            .map(|(k, v)| (k.clone().into_bytes(), v.clone().into_bytes()))
            .collect()
    }

    pub fn save(&self, path: &Path) {
        std::fs::write(path, serde_json::to_string(self).unwrap()).unwrap();
    }

    pub fn load(path: &Path) -> Corpus {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }
}

/// A pronounceable pseudo-word derived from `i`.
#[allow(dead_code)]
pub fn word(i: usize) -> String {
    const SYLLABLES: [&str; 12] = [
        "ka", "ro", "mi", "ten", "sol", "ba", "lu", "den", "gar", "pex", "vin", "osh",
    ];

    let mut n = i;
    let mut out = String::new();
    for _ in 0..3 {
        out.push_str(SYLLABLES[n % SYLLABLES.len()]);
        n = n / SYLLABLES.len() + 1;
    }
    out.push_str(&i.to_string());
    out
}

#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Drain a writable database into a map by full iteration.
#[allow(dead_code)]
pub fn drain(db: &mut Gdbm<ReadWrite>) -> HashMap<Vec<u8>, Vec<u8>> {
    db.iter::<Vec<u8>, Vec<u8>>()
        .collect::<gdbm_core::Result<HashMap<_, _>>>()
        .unwrap()
}

/// Drain a read-only database into a map by full iteration.
#[allow(dead_code)]
pub fn drain_ro(db: &mut Gdbm<ReadOnly>) -> HashMap<Vec<u8>, Vec<u8>> {
    db.iter::<Vec<u8>, Vec<u8>>()
        .collect::<gdbm_core::Result<HashMap<_, _>>>()
        .unwrap()
}
