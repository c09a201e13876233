//
// recover.rs -- salvage readable records from a damaged database
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::collections::HashSet;
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

use log::{debug, warn};

use crate::bucket::Bucket;
use crate::cache::BucketCache;
use crate::hashutil::hash_key;
use crate::{
    load_directory, load_header, read_ofs, BlockSize, Error, Gdbm, OpenOptions, ReadWrite, Result,
    WriteState,
};

/// Failure tolerances for [`Gdbm::recover`].  `None` means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoverOptions {
    pub max_failed_keys: Option<usize>,
    pub max_failed_buckets: Option<usize>,
    /// Bound on failed keys and buckets combined.
    pub max_failures: Option<usize>,
    /// Keep a copy of the damaged file next to it before overwriting.
    pub backup: bool,
}

/// What a recovery run managed to salvage.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub recovered_keys: usize,
    pub recovered_buckets: usize,
    pub failed_keys: usize,
    pub failed_buckets: usize,
    pub duplicate_keys: usize,
    pub backup_path: Option<PathBuf>,
}

fn over(limit: Option<usize>, n: usize) -> bool {
    limit.is_some_and(|max| n > max)
}

impl Gdbm<ReadWrite> {
    /// Rebuild the database from whatever is still readable.
    ///
    /// Walks the directory and buckets with raw reads (no cache, no
    /// consistency latch), re-inserting every record whose bytes check
    /// out into a fresh database that then replaces the file contents.
    /// This is the only operation permitted on a handle poisoned by a
    /// fatal error.
    ///
    /// # Examples
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().unwrap();
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> gdbm_core::Result<()> {
    /// #         let mut db = gdbm_core::OpenOptions::new().write().create().open(&path)?;
    /// let stats = db.recover(gdbm_core::RecoverOptions::default())?;
    /// println!("recovered {} keys", stats.recovered_keys);
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn recover(&mut self, options: RecoverOptions) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();

        let mut tmpdb = OpenOptions::new()
            .write()
            .create()
            .alignment(Some(self.header.layout.alignment))
            .block_size(BlockSize::Exactly(self.header.block_sz))
            .numsync(self.header.numsync.is_some())
            .tempfile()?;

        let file_len = self.f.len().map_err(Error::Io)?;
        let mut seen = HashSet::new();

        for offset in self.dir.dir.clone() {
            if !seen.insert(offset) {
                continue;
            }

            let bucket = read_ofs(&mut self.f, offset, self.header.bucket_sz as usize)
                .ok()
                .and_then(|buf| {
                    Bucket::from_reader(
                        self.header.bucket_elems,
                        self.header.layout,
                        &mut buf.as_slice(),
                    )
                    .ok()
                })
                .filter(|bucket| bucket.count <= self.header.bucket_elems);

            let bucket = match bucket {
                Some(bucket) => bucket,
                None => {
                    warn!("recovery: skipping unreadable bucket at {offset}");
                    stats.failed_buckets += 1;
                    if over(options.max_failed_buckets, stats.failed_buckets)
                        || over(options.max_failures, stats.failed_buckets + stats.failed_keys)
                    {
                        return Err(Error::RecoveryFailed(format!(
                            "too many unreadable buckets ({})",
                            stats.failed_buckets
                        )));
                    }
                    continue;
                }
            };
            stats.recovered_buckets += 1;

            for elem in bucket.tab.iter().filter(|elem| elem.is_occupied()) {
                let total = u64::from(elem.key_size) + u64::from(elem.data_size);
                let readable = elem
                    .data_ofs
                    .checked_add(total)
                    .map(|end| end <= file_len)
                    .unwrap_or(false);

                let record = match readable {
                    true => read_ofs(&mut self.f, elem.data_ofs, total as usize).ok(),
                    false => None,
                };

                // a record is trusted when its key bytes rehash to the
                // value the bucket slot promised
                let keyval = record.and_then(|data| {
                    let (key, value) = data.split_at(elem.key_size as usize);
                    (hash_key(key) == elem.hash).then(|| (key.to_vec(), value.to_vec()))
                });

                match keyval {
                    None => {
                        stats.failed_keys += 1;
                        if over(options.max_failed_keys, stats.failed_keys)
                            || over(options.max_failures, stats.failed_buckets + stats.failed_keys)
                        {
                            return Err(Error::RecoveryFailed(format!(
                                "too many unreadable keys ({})",
                                stats.failed_keys
                            )));
                        }
                    }
                    Some((key, value)) => match tmpdb.try_insert(&key, &value)? {
                        Some(_) => stats.duplicate_keys += 1,
                        None => stats.recovered_keys += 1,
                    },
                }
            }
        }

        tmpdb.sync()?;

        if options.backup {
            if let Some(path) = &self.path {
                let backup_path = PathBuf::from(format!("{}.bak", path.display()));
                std::fs::copy(path, &backup_path).map_err(Error::BackupFailed)?;
                stats.backup_path = Some(backup_path);
            }
        }

        // the salvaged image replaces the damaged file
        let new_len = tmpdb.header.next_block;
        {
            let src = tmpdb.f.file_mut();
            let dst = self.f.file_mut();
            src.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
            dst.seek(SeekFrom::Start(0)).map_err(Error::Io)?;
            std::io::copy(src, dst).map_err(Error::Io)?;
        }
        self.f.set_len(new_len).map_err(Error::Io)?;

        let file_len = self.f.len().map_err(Error::Io)?;
        self.header = load_header(&mut self.f, file_len)?;
        self.dir = load_directory(&mut self.f, &self.header)?;
        self.bucket_cache = BucketCache::new(
            self.bucket_cache.cachesize(),
            self.bucket_cache.auto_sized(),
            None,
        );
        self.read_write.state = WriteState::Clean;

        debug!(
            "recovery complete: {} keys over {} buckets ({} keys and {} buckets lost)",
            stats.recovered_keys, stats.recovered_buckets, stats.failed_keys, stats.failed_buckets
        );

        Ok(stats)
    }
}
