//
// lib.rs -- core library API routines
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! Pure-Rust implementation of the GDBM extendible-hashing key/value
//! database.
//!
//! A single-file on-disk store for opaque byte-string keys and values:
//! point lookup, insertion, deletion and full-key iteration, with
//! distributed free-space management, an LRU bucket cache and advisory
//! cross-process locking.  Files produced by GDBM on a same-endian host
//! are readable and vice versa.
//!
//! # Examples
//! ```
//! use gdbm_core as gdbm;
//!
//! # use tempfile::tempdir;
//! # fn main() -> Result<(), String> {
//! #     let tmp_dir = tempdir().map_err(|e| e.to_string())?;
//! #     let passwords = tmp_dir.path().join("top-level-doc-test");
//! #     || -> gdbm::Result<()> {
//! // Create a new database at path
//! let mut db = gdbm::OpenOptions::new()
//!     .write()
//!     .create()
//!     .open(&passwords)?;
//!
//! // Insert key/value pairs
//! db.insert("286755fad04869ca523320acce0dc6a4", "chal28griffin@example.com")?;
//! db.insert("4aacf9c858c82716ab0034320bd2efe9", "floribund@gmail.com")?;
//!
//! // Read a value back.  The database has no knowledge of the stored
//! // type, so a hint is needed.
//! let value: Option<String> = db.get("4aacf9c858c82716ab0034320bd2efe9")?;
//! assert!(value == Some("floribund@gmail.com".to_string()));
//! #         Ok(())
//! #     }().map_err(|e| e.to_string())
//! # }
//! ```

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use base64::Engine;
use log::debug;

mod avail;
mod bucket;
mod bytes;
mod cache;
mod dir;
mod error;
mod fileio;
mod hashutil;
mod header;
mod import;
mod lock;
mod magic;
mod options;
mod recover;
mod ser;
mod snapshot;

use avail::{AvailBlock, AvailElem, IGNORE_SIZE};
use bucket::{Bucket, BucketElement, BUCKET_AVAIL};
pub use bytes::{BytesRef, FromBytes, ToBytesRef};
pub use cache::CacheStats;
use cache::{BucketCache, CachedDatum};
use dir::Directory;
pub use error::Error;
use fileio::DbFile;
pub use fileio::DEFAULT_MMAP_MAX;
use hashutil::{bucket_dir, key_loc, PartialKey, GDBM_HASH_BITS};
use header::Header;
pub use header::GDBM_MIN_BLOCK_SIZE;
use import::{ASCIIImportIterator, BinaryImportIterator};
use lock::FileLock;
pub use lock::{LockError, LockMechanism, LockWait};
pub use magic::Magic;
pub use options::{BlockSize, Create, NotCreate, NotWrite, OpenOptions, Write as WriteOptions};
pub use recover::{RecoverOptions, RecoveryStats};
use ser::{write32, write64, Endian, Layout};
pub use ser::Alignment;
pub use snapshot::{latest_snapshot, SnapshotSelection};

use std::any::Any;
use std::os::unix::fs::MetadataExt;

/// Our claimed GDBM lib version compatibility.  Appears in dump files.
pub const COMPAT_GDBM_VERSION: &str = "1.23";

/// The crate Result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Mode to use when exporting a binary dump.  It affects the number of
/// bytes used to store length metadata within the dump.  There is no
/// indication of this mode stored in a dump file, so the same mode must
/// be used when restoring the dumped data.  For this reason the ASCII
/// dump format is preferable.
#[derive(Copy, Clone, Debug)]
pub enum ExportBinMode {
    /// Match the width of the database's offset fields.
    ExpNative,
    /// Store lengths as 32-bit values.
    Exp32,
    /// Store lengths as 64-bit values.
    Exp64,
}

/// Collision policy when loading a dump into a database.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ImportMode {
    /// Fail with [`Error::CannotReplace`] when a dumped key already exists.
    Insert,
    /// Overwrite existing values.
    Replace,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
enum WriteState {
    #[default]
    Clean,
    Dirty,
    /// A mutation failed midway; the on-disk state is untrustworthy and
    /// only recovery may touch it.
    Inconsistent,
}

/// Struct used as type parameter to open a database in read-only mode.
#[derive(Copy, Clone, Debug, Default)]
pub struct ReadOnly;

/// Struct used as type parameter to open a database in read-write mode.
#[derive(Copy, Clone, Debug, Default)]
pub struct ReadWrite {
    sync: bool,
    state: WriteState,
}

trait CacheBucket {
    const EXCLUSIVE: bool;
    fn cache_bucket(&mut self, offset: u64, bucket: Bucket) -> Result<()>;
    fn write_displaced(&mut self, displaced: Vec<(u64, Bucket)>) -> Result<()>;
    fn note_fatal(&mut self, what: &str);
    fn assert_consistent(&self) -> Result<()>;
}

// read and return file data stored at (ofs,total_size); a file shorter
// than the metadata promises is a fatal inconsistency
fn read_ofs(f: &mut DbFile, ofs: u64, total_size: usize) -> Result<Vec<u8>> {
    f.read_at(ofs, total_size).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::NeedsRecovery,
        _ => Error::Io(e),
    })
}

fn load_header(f: &mut DbFile, file_len: u64) -> Result<Header> {
    // the block size field tells us how much of the first block to
    // parse; read it before the real header read
    let probe = read_ofs(f, 0, 8)?;
    let guess = u32::from_ne_bytes(probe[4..8].try_into().unwrap());
    let read_len = if (GDBM_MIN_BLOCK_SIZE..=1 << 24).contains(&guess) {
        u64::from(guess)
    } else {
        u64::from(GDBM_MIN_BLOCK_SIZE)
    };

    let buf = read_ofs(f, 0, read_len.min(file_len) as usize)?;
    Header::from_reader(file_len, &mut buf.as_slice())
}

fn load_directory(f: &mut DbFile, header: &Header) -> Result<Directory> {
    let buf = read_ofs(f, header.dir_ofs, header.dir_sz as usize)?;
    let dir = Directory::from_reader(header.layout, header.dir_sz, &mut buf.as_slice())?;

    dir.validate(
        u64::from(header.block_sz),
        header.next_block,
        header.bucket_sz,
    )
    .map_err(|(index, offset)| Error::BadDirEntry { index, offset })?;

    Ok(dir)
}

// cache capacity derived from the directory depth when nothing was
// requested explicitly
fn auto_cachesize(dir_bits: u32) -> usize {
    1usize << dir_bits.clamp(4, 10)
}

/// GDBM database type.
///
/// The `R` parameter is [`ReadOnly`] or [`ReadWrite`]; mutating methods
/// exist only on the latter.
pub struct Gdbm<R: 'static> {
    // declared before `f` so the lock is released while the descriptor
    // is still open
    #[allow(dead_code)]
    lock: Option<FileLock>,
    f: DbFile,
    path: Option<PathBuf>,
    header: Header,
    dir: Directory,
    bucket_cache: BucketCache,
    central_free: bool,
    coalesce_blocks: bool,
    fatal_handler: Option<Box<dyn Fn(&str)>>,

    read_write: R,
}

// cache_bucket for ReadOnly never sees dirty displaced buckets.
impl CacheBucket for Gdbm<ReadOnly> {
    const EXCLUSIVE: bool = false;

    fn cache_bucket(&mut self, offset: u64, bucket: Bucket) -> Result<()> {
        let _ = self.bucket_cache.insert(offset, bucket, false);

        Ok(())
    }

    fn write_displaced(&mut self, _displaced: Vec<(u64, Bucket)>) -> Result<()> {
        Ok(())
    }

    fn note_fatal(&mut self, what: &str) {
        if let Some(handler) = &self.fatal_handler {
            handler(what);
        }
    }

    fn assert_consistent(&self) -> Result<()> {
        Ok(())
    }
}

// cache_bucket for ReadWrite needs to write dirty displaced buckets.
impl CacheBucket for Gdbm<ReadWrite> {
    const EXCLUSIVE: bool = true;

    fn cache_bucket(&mut self, offset: u64, bucket: Bucket) -> Result<()> {
        if let Some((evicted_offset, evicted_bucket)) =
            self.bucket_cache.insert(offset, bucket, false)
        {
            self.write_bucket(&evicted_bucket, evicted_offset)?;
        }

        Ok(())
    }

    fn write_displaced(&mut self, displaced: Vec<(u64, Bucket)>) -> Result<()> {
        displaced
            .into_iter()
            .try_for_each(|(offset, bucket)| self.write_bucket(&bucket, offset))
    }

    fn note_fatal(&mut self, what: &str) {
        self.read_write.state = WriteState::Inconsistent;
        if let Some(handler) = &self.fatal_handler {
            handler(what);
        }
    }

    fn assert_consistent(&self) -> Result<()> {
        match self.read_write.state {
            WriteState::Inconsistent => Err(Error::NeedsRecovery),
            _ => Ok(()),
        }
    }
}

#[allow(private_bounds)]
impl<R> Gdbm<R>
where
    Gdbm<R>: CacheBucket,
    R: Default,
{
    pub(crate) fn open<W>(
        f: File,
        path: Option<PathBuf>,
        options: &OpenOptions<W>,
    ) -> Result<Gdbm<R>> {
        let lock = match options.no_lock {
            true => None,
            false => Some(
                FileLock::acquire(&f, Self::EXCLUSIVE, options.lock_wait).map_err(|_| {
                    if Self::EXCLUSIVE {
                        Error::CantBeWriter
                    } else {
                        Error::CantBeReader
                    }
                })?,
            ),
        };

        let file_len = f.metadata()?.len();
        let mut file = DbFile::new(f, !options.no_mmap, options.mmap_max, options.preread);

        let header = load_header(&mut file, file_len)?;
        let dir = load_directory(&mut file, &header)?;

        debug!(
            "opened database ({}): block size {}, dir bits {}, bucket elems {}",
            header.magic, header.block_sz, header.dir_bits, header.bucket_elems
        );

        let (cachesize, auto_sized) = match options.cachesize {
            Some(n) => (n, false),
            None => (auto_cachesize(header.dir_bits), true),
        };

        Ok(Gdbm {
            lock,
            f: file,
            path,
            header,
            dir,
            bucket_cache: BucketCache::new(cachesize, auto_sized, None),
            central_free: false,
            coalesce_blocks: false,
            fatal_handler: None,
            read_write: R::default(),
        })
    }

    /// Install a callback observing fatal errors, in addition to the
    /// handle's needs-recovery latch.
    pub fn set_fatal_handler(&mut self, handler: impl Fn(&str) + 'static) {
        self.fatal_handler = Some(Box::new(handler));
    }

    fn export_ascii_header(&self, outf: &mut impl Write) -> io::Result<()> {
        writeln!(outf, "# GDBM dump file created by {COMPAT_GDBM_VERSION}")?;
        writeln!(outf, "#:version=1.1")?;
        if let Some(path) = &self.path {
            writeln!(outf, "#:file={}", path.to_string_lossy())?;
        }
        writeln!(outf, "#:format=standard")?;
        writeln!(outf, "# End of header")?;
        Ok(())
    }

    fn export_ascii_datum(outf: &mut impl Write, bindata: &[u8]) -> io::Result<()> {
        const MAX_DUMP_LINE_LEN: usize = 76;

        writeln!(outf, "#:len={}", bindata.len())?;

        let b64 = base64::prelude::BASE64_STANDARD.encode(bindata);
        let mut rest = b64.as_str();
        while rest.len() > MAX_DUMP_LINE_LEN {
            let (line, tail) = rest.split_at(MAX_DUMP_LINE_LEN);
            writeln!(outf, "{line}")?;
            rest = tail;
        }
        writeln!(outf, "{rest}")?;

        Ok(())
    }

    fn export_ascii_records(&mut self, outf: &mut impl Write) -> Result<usize> {
        self.iter().try_fold(0, |count, kv| {
            kv.and_then(|(key, value): (Vec<u8>, Vec<u8>)| {
                Self::export_ascii_datum(outf, &key)
                    .and_then(|()| Self::export_ascii_datum(outf, &value))
                    .map(|()| count + 1)
                    .map_err(Error::Io)
            })
        })
    }

    fn export_ascii_footer(outf: &mut impl Write, n_written: usize) -> io::Result<()> {
        writeln!(outf, "#:count={n_written}")?;
        writeln!(outf, "# End of data")?;
        Ok(())
    }

    /// Dump the database in ASCII format to the supplied [`io::Write`].
    ///
    /// # Examples
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().unwrap();
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> gdbm_core::Result<()> {
    /// #         let mut db = gdbm_core::OpenOptions::new().write().create().open(&path)?;
    /// let mut buffer = Vec::new();
    /// db.export_ascii(&mut buffer)?;
    /// println!("{}", std::str::from_utf8(&buffer).unwrap());
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn export_ascii(&mut self, outf: &mut impl Write) -> Result<()> {
        self.assert_consistent()?;
        self.export_ascii_header(outf)
            .map_err(Error::Io)
            .and_then(|()| self.export_ascii_records(outf))
            .and_then(|n_written| Self::export_ascii_footer(outf, n_written).map_err(Error::Io))
    }

    fn export_bin_header(outf: &mut impl Write) -> io::Result<()> {
        write!(
            outf,
            "!\r\n! GDBM FLAT FILE DUMP -- THIS IS NOT A TEXT FILE\r\n"
        )?;
        write!(outf, "! {COMPAT_GDBM_VERSION}\r\n!\r\n")?;
        Ok(())
    }

    fn export_bin_datum(
        outf: &mut impl Write,
        alignment: Alignment,
        bindata: &[u8],
    ) -> io::Result<()> {
        // length metadata is big endian, 32 or 64 bits
        match alignment {
            Alignment::Align32 => write32(Endian::Big, outf, bindata.len() as u32)?,
            Alignment::Align64 => write64(Endian::Big, outf, bindata.len() as u64)?,
        }

        outf.write_all(bindata)?;

        Ok(())
    }

    fn export_bin_records(&mut self, outf: &mut impl Write, alignment: Alignment) -> Result<()> {
        self.iter::<Vec<_>, Vec<_>>().try_for_each(|kv| {
            kv.and_then(|(key, value)| {
                Self::export_bin_datum(outf, alignment, &key)
                    .and_then(|()| Self::export_bin_datum(outf, alignment, &value))
                    .map_err(Error::Io)
            })
        })
    }

    /// Dump the database in binary format to the supplied [`io::Write`].
    ///
    /// The binary encoding stores key and value lengths as big-endian
    /// integers; [`mode`](ExportBinMode) selects their width.  Decoding
    /// requires knowing the mode used to export, so ASCII dumps travel
    /// better.
    pub fn export_bin(&mut self, outf: &mut impl Write, mode: ExportBinMode) -> Result<()> {
        self.assert_consistent()?;
        let alignment = match mode {
            ExportBinMode::ExpNative => self.header.layout.alignment,
            ExportBinMode::Exp32 => Alignment::Align32,
            ExportBinMode::Exp64 => Alignment::Align64,
        };

        Self::export_bin_header(outf)
            .map_err(Error::Io)
            .and_then(|()| self.export_bin_records(outf, alignment))
    }

    // read bucket via the bucket cache
    fn cache_load_bucket(&mut self, bucket_dir: usize) -> Result<&Bucket> {
        let offset = self.dir.dir[bucket_dir];

        let cached = self.bucket_cache.contains(offset);
        self.bucket_cache.record_access(cached);

        if !cached {
            let bucket = read_ofs(&mut self.f, offset, self.header.bucket_sz as usize)
                .and_then(|buf| {
                    Bucket::from_reader(
                        self.header.bucket_elems,
                        self.header.layout,
                        &mut buf.as_slice(),
                    )
                    .map_err(Error::Io)
                })
                .map_err(|e| {
                    self.note_fatal("bucket read failed");
                    e
                })?;

            if bucket.count > self.header.bucket_elems || bucket.bits > self.header.dir_bits {
                self.note_fatal("bucket failed validation");
                return Err(Error::BadBucket {
                    offset,
                    elems: bucket.count,
                    bits: bucket.bits,
                    max_elems: self.header.bucket_elems,
                    dir_bits: self.header.dir_bits,
                });
            }

            self.cache_bucket(offset, bucket)?;
        }

        self.bucket_cache.set_current(offset);

        Ok(self.bucket_cache.current_bucket().unwrap())
    }

    // since one directory entry may duplicate another, this function
    // returns the next non-dup directory slot
    fn next_bucket_dir(&self, bucket_dir_in: usize) -> usize {
        let dir_max_elem = self.dir.len();
        if bucket_dir_in >= dir_max_elem {
            return dir_max_elem;
        }

        let mut bucket_dir = bucket_dir_in;

        let cur_ofs = self.dir.dir[bucket_dir];
        while bucket_dir < dir_max_elem && cur_ofs == self.dir.dir[bucket_dir] {
            bucket_dir += 1;
        }

        bucket_dir
    }

    /// Number of key/value pairs in the database.
    ///
    /// This walks every bucket's metadata, so it is exact and not cheap.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&mut self) -> Result<usize> {
        self.assert_consistent()?;
        let mut len: usize = 0;
        let mut cur_dir: usize = 0;
        let dir_max_elem = self.dir.len();
        while cur_dir < dir_max_elem {
            len += self.cache_load_bucket(cur_dir)?.count as usize;
            cur_dir = self.next_bucket_dir(cur_dir);
        }

        Ok(len)
    }

    /// An [`Iterator`] over the values in the database.
    pub fn values<V: FromBytes>(&mut self) -> impl std::iter::Iterator<Item = Result<V>> + '_ {
        GDBMIterator::<R>::new(self, KeyOrValue::Value)
            .map(|data| data.and_then(|(_, value)| V::from_bytes(&value)))
    }

    /// An [`Iterator`] over the keys in the database.
    pub fn keys<K: FromBytes>(&mut self) -> impl std::iter::Iterator<Item = Result<K>> + '_ {
        GDBMIterator::<R>::new(self, KeyOrValue::Key)
            .map(|data| data.and_then(|(key, _)| K::from_bytes(&key)))
    }

    /// An [`Iterator`] over the (key, value) pairs in the database.
    ///
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().map_err(|e| e.to_string())?;
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> gdbm_core::Result<()> {
    /// #         let mut db = gdbm_core::OpenOptions::new().write().create().open(&path)?;
    /// for kv in db.iter::<String, u32>() {
    ///     let (button, count) = kv?;
    ///     println!("button <{button}> was clicked {count} times")
    /// }
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn iter<K: FromBytes, V: FromBytes>(
        &mut self,
    ) -> impl std::iter::Iterator<Item = Result<(K, V)>> + '_ {
        GDBMIterator::<R>::new(self, KeyOrValue::Both).map(|data| {
            data.and_then(|(key, value)| {
                K::from_bytes(&key).and_then(|k| V::from_bytes(&value).map(|v| (k, v)))
            })
        })
    }

    /// Whether the database contains a specific key.
    pub fn contains_key<K: ToBytesRef + ?Sized>(&mut self, key: &K) -> Result<bool> {
        self.int_get(key.to_bytes_ref().as_ref())
            .map(|result| result.is_some())
    }

    // retrieve record data, and element offset in bucket, for given key
    fn int_get(&mut self, key: &[u8]) -> Result<Option<(usize, Vec<u8>)>> {
        self.assert_consistent()?;
        let (key_hash, bucket_dir, elem_ofs) =
            key_loc(self.header.dir_bits, self.header.bucket_elems, key);
        let key_start = PartialKey::new(key);

        self.cache_load_bucket(bucket_dir)?;

        // a fetch customarily follows a key-iteration step; serve it
        // from the remembered pair
        if let Some(datum) = self.bucket_cache.current_datum() {
            if datum.hash == key_hash && datum.key == key {
                return Ok(Some((datum.elem_loc, datum.data.clone())));
            }
        }

        let bucket = self.bucket_cache.current_bucket().unwrap();
        let candidates = (0..bucket.tab.len())
            .map(|index| (index + elem_ofs as usize) % bucket.tab.len())
            .map(|offset| (offset, bucket.tab[offset]))
            .take_while(|(_, elem)| elem.is_occupied())
            .filter(|(_, elem)| {
                elem.hash == key_hash
                    && elem.key_size == key.len() as u32
                    && elem.key_start == key_start
            })
            .collect::<Vec<_>>();

        for (offset, elem) in candidates {
            let data = read_ofs(
                &mut self.f,
                elem.data_ofs,
                (elem.key_size + elem.data_size) as usize,
            )?;
            if data[..key.len()] == *key {
                return Ok(Some((offset, data[key.len()..].to_vec())));
            }
        }

        Ok(None)
    }

    /// The value stored under `key`, or `None`.
    ///
    /// # Examples
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().unwrap();
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> gdbm_core::Result<()> {
    /// #         let mut db = gdbm_core::OpenOptions::new().write().create().open(&path)?;
    /// #     let display = |_: Vec<u8>| ();
    /// #     let image_name = "";
    /// if let Some(image) = db.get(image_name)? {
    ///     display(image);
    /// }
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn get<K: ToBytesRef + ?Sized, V: FromBytes>(&mut self, key: &K) -> Result<Option<V>> {
        match self.int_get(key.to_bytes_ref().as_ref())? {
            None => Ok(None),
            Some(data) => V::from_bytes(&data.1).map(|v| Some(v)),
        }
    }

    fn key_at_slot(&mut self, slot: &Slot) -> Result<Vec<u8>> {
        let (hash, data_ofs, key_size, data_size) = {
            let bucket = self.cache_load_bucket(slot.bucket)?;
            let elem = bucket.tab[slot.element];
            (
                elem.hash,
                elem.data_ofs,
                elem.key_size as usize,
                elem.data_size as usize,
            )
        };

        let data = read_ofs(&mut self.f, data_ofs, key_size + data_size)?;
        let (key, value) = data.split_at(key_size);

        self.bucket_cache.set_current_datum(CachedDatum {
            hash,
            elem_loc: slot.element,
            key: key.to_vec(),
            data: value.to_vec(),
        });

        Ok(key.to_vec())
    }

    /// The first key in iteration order, or `None` on an empty database.
    ///
    /// Together with [`next_key`](Gdbm::next_key) this walks every key
    /// without iterator state: the position is fully determined by the
    /// last key returned.
    pub fn first_key(&mut self) -> Result<Option<Vec<u8>>> {
        self.assert_consistent()?;
        match first_occupied_slot(self) {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok(slot)) => self.key_at_slot(&slot).map(Some),
        }
    }

    /// The key following `prev` in iteration order.
    ///
    /// Returns `None` when `prev` was the last key, or is no longer
    /// present.  Concurrent inserts and deletes may cause keys to be
    /// skipped or revisited, but never invalidate the cursor.
    pub fn next_key<K: ToBytesRef + ?Sized>(&mut self, prev: &K) -> Result<Option<Vec<u8>>> {
        let prev = prev.to_bytes_ref();
        let key = prev.as_ref();

        let (_, bucket_dir, _) = key_loc(self.header.dir_bits, self.header.bucket_elems, key);
        match self.int_get(key)? {
            None => Ok(None),
            Some((elem_loc, _)) => {
                let slot = Slot {
                    bucket: bucket_dir,
                    element: elem_loc,
                };
                match next_occupied_slot(self, &slot) {
                    None => Ok(None),
                    Some(Err(e)) => Err(e),
                    Some(Ok(next)) => self.key_at_slot(&next).map(Some),
                }
            }
        }
    }

    /// The database [`Magic`] number.
    pub fn magic(&self) -> Magic {
        self.header.magic
    }

    /// Width of the database's offset fields.
    pub fn alignment(&self) -> Alignment {
        self.header.layout.alignment
    }

    /// The database block size.
    pub fn block_size(&self) -> u32 {
        self.header.block_sz
    }

    /// Current depth of the extendible-hash directory.
    pub fn dir_bits(&self) -> u32 {
        self.header.dir_bits
    }

    /// Size in bytes of one bucket.
    pub fn bucket_size(&self) -> u32 {
        self.header.bucket_sz
    }

    /// The path this database was opened from, if any.
    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    /// Current bucket cache capacity, in buckets.
    pub fn cachesize(&self) -> usize {
        self.bucket_cache.cachesize()
    }

    /// Bucket cache access statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.bucket_cache.stats()
    }

    /// Resize the bucket cache to hold at most `cachesize` buckets.
    ///
    /// Shrinking evicts least recently used buckets (writing dirty
    /// images back); growing takes effect lazily.  Explicit sizing
    /// disables automatic sizing.
    pub fn set_cachesize(&mut self, cachesize: usize) -> Result<()> {
        let displaced = self.bucket_cache.set_cachesize(cachesize, false);
        self.write_displaced(displaced)
    }

    /// Re-enable automatic cache sizing from the directory depth.
    pub fn set_cache_auto(&mut self) -> Result<()> {
        let displaced = self
            .bucket_cache
            .set_cachesize(auto_cachesize(self.header.dir_bits), true);
        self.write_displaced(displaced)
    }

    /// Enable or disable the memory-mapped read window.
    pub fn set_mmap(&mut self, enabled: bool) {
        self.f.set_mmap(enabled);
    }

    /// Whether reads may go through the memory-mapped window.
    pub fn mmap_enabled(&self) -> bool {
        self.f.mmap_enabled()
    }

    /// Bound the memory-mapped read window to `max` bytes.
    pub fn set_mmap_max_size(&mut self, max: usize) {
        self.f.set_map_max(max);
    }

    /// Current bound on the memory-mapped read window.
    pub fn mmap_max_size(&self) -> usize {
        self.f.map_max()
    }

    /// Whether freed extents bypass the distributed avail tables.
    pub fn central_free(&self) -> bool {
        self.central_free
    }

    /// Whether adjacent freed extents are merged.
    pub fn coalesce_blocks(&self) -> bool {
        self.coalesce_blocks
    }
}

impl Gdbm<ReadOnly> {
    /// Close the database, releasing the lock.
    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

impl Gdbm<ReadWrite> {
    pub(crate) fn create(
        f: File,
        path: Option<PathBuf>,
        options: &OpenOptions<WriteOptions<Create>>,
    ) -> Result<Gdbm<ReadWrite>> {
        let lock = match options.no_lock {
            true => None,
            false => Some(
                FileLock::acquire(&f, true, options.lock_wait).map_err(|_| Error::CantBeWriter)?,
            ),
        };

        let layout = Layout {
            alignment: options.write.create.alignment.unwrap_or(Alignment::Align64),
            endian: Endian::native(),
        };

        let block_sz = {
            let requested = match options.write.create.block_size {
                BlockSize::Filesystem => f.metadata()?.blksize() as u32,
                BlockSize::Roughly(size) | BlockSize::Exactly(size) => size,
            };
            let actual = requested.max(GDBM_MIN_BLOCK_SIZE).next_power_of_two();
            if let BlockSize::Exactly(size) = options.write.create.block_size {
                if actual != size {
                    return Err(Error::BadBlockSize {
                        requested: size,
                        actual,
                    });
                }
            }
            actual
        };

        let header = Header::new(block_sz, layout, !options.write.create.no_numsync);
        let bucket = Bucket::new(0, header.bucket_elems as usize);
        let bucket_offset = header.next_block - u64::from(header.bucket_sz);
        let dir = Directory::new(vec![bucket_offset; 1 << header.dir_bits]);

        debug!(
            "created database ({}): block size {}, dir bits {}",
            header.magic, header.block_sz, header.dir_bits
        );

        let (cachesize, auto_sized) = match options.cachesize {
            Some(n) => (n, false),
            None => (auto_cachesize(header.dir_bits), true),
        };
        let bucket_cache = BucketCache::new(cachesize, auto_sized, Some((bucket_offset, bucket)));

        let mut db = Gdbm {
            lock,
            f: DbFile::new(f, !options.no_mmap, options.mmap_max, options.preread),
            path,
            header,
            dir,
            bucket_cache,
            central_free: false,
            coalesce_blocks: false,
            fatal_handler: None,
            read_write: ReadWrite {
                sync: options.write.sync,
                state: WriteState::Dirty,
            },
        };

        // put the initial image on disk so the file is a valid database
        // even if the handle is never synced
        db.write_dirty()?;
        if db.read_write.sync {
            db.f.sync_data().map_err(Error::Io)?;
        }

        Ok(db)
    }

    /// Set the database sync mode.
    ///
    /// When enabled, all metadata is written and the file fsynced after
    /// every mutation.  Costly, but the database survives a crash at any
    /// point.  Off by default; the setting is not stored in the file.
    pub fn set_sync(&mut self, sync: bool) {
        self.read_write.sync = sync;
    }

    /// Whether sync mode is on.
    pub fn sync_mode(&self) -> bool {
        self.read_write.sync
    }

    /// Route every freed extent to the header avail table instead of
    /// the per-bucket tables.
    pub fn set_central_free(&mut self, central_free: bool) {
        self.central_free = central_free;
    }

    /// Merge freed extents with adjacent free space on insert.
    pub fn set_coalesce_blocks(&mut self, coalesce_blocks: bool) {
        self.coalesce_blocks = coalesce_blocks;
    }

    /// Load entries from an ASCII dump created with
    /// [`export_ascii`](Gdbm::export_ascii).
    pub fn import_ascii(&mut self, reader: &mut impl Read, mode: ImportMode) -> Result<()> {
        ASCIIImportIterator::new(reader)
            .map_err(Error::Io)
            .and_then(|mut lines| {
                lines.try_for_each(|l| {
                    let (key, value) = l.map_err(Error::Io)?;
                    self.import_record(&key, &value, mode)
                })
            })
    }

    /// Load entries from a binary dump created with
    /// [`export_bin`](Gdbm::export_bin), using the same `mode` it was
    /// exported with.
    pub fn import_bin(
        &mut self,
        reader: &mut impl Read,
        bin_mode: ExportBinMode,
        mode: ImportMode,
    ) -> Result<()> {
        let alignment = match bin_mode {
            ExportBinMode::ExpNative => self.header.layout.alignment,
            ExportBinMode::Exp32 => Alignment::Align32,
            ExportBinMode::Exp64 => Alignment::Align64,
        };

        BinaryImportIterator::new(alignment, reader)
            .map_err(Error::Io)
            .and_then(|mut lines| {
                lines.try_for_each(|l| {
                    let (key, value) = l.map_err(Error::Io)?;
                    self.import_record(&key, &value, mode)
                })
            })
    }

    fn import_record(&mut self, key: &[u8], value: &[u8], mode: ImportMode) -> Result<()> {
        match mode {
            ImportMode::Replace => self.insert(key, value).map(|_| ()),
            ImportMode::Insert => match self.try_insert(key, value)? {
                Some(_) => Err(Error::CannotReplace),
                None => Ok(()),
            },
        }
    }

    // virtually allocate whole blocks at the end of the file (no I/O)
    fn extend(&mut self, size: u32) -> (u64, u32) {
        let offset = self.header.next_block;
        let length = size.div_ceil(self.header.block_sz) * self.header.block_sz;

        self.header.next_block += u64::from(length);
        self.header.dirty = true;

        (offset, length)
    }

    // The header avail table is full.  Split it in half: odd-indexed
    // elements move into a new block pushed onto the avail stack, the
    // rest stay.  Space for the new block comes from the table itself
    // (it is full, after all) or the end of the file.
    fn push_avail_block(&mut self) -> Result<()> {
        let layout = self.header.layout;
        let extent = AvailBlock::stack_extent(layout, self.header.avail.sz);

        let (addr, length) = match self.header.allocate(extent) {
            Some(block) => block,
            None => self.extend(extent),
        };

        let (keep, moved) = self.header.avail.partition();
        debug!("push avail block at {addr}: {} elements move", moved.len());

        let block = AvailBlock::with(self.header.avail.sz, self.header.avail.next_block, moved);
        self.header.avail.next_block = addr;
        self.header.avail.elems = keep;
        self.header.dirty = true;

        // the table is half empty now, so the tail of the allocation
        // can be freed without re-triggering a push
        self.free_record(addr + u64::from(extent), length - extent)?;

        // the stack block goes to disk immediately
        let mut buf = Vec::with_capacity(extent as usize);
        block.serialize(layout, &mut buf).map_err(Error::Io)?;
        self.f.write_at(addr, &buf).map_err(Error::Io)?;

        Ok(())
    }

    // Pop the top avail block off the stack and fold its elements back
    // into the header table.  The header may fill mid-merge; a
    // recursive push makes room without losing elements.
    fn pop_avail_block(&mut self) -> Result<()> {
        if self.header.avail.is_full() {
            self.push_avail_block()?;
        }

        let layout = self.header.layout;
        let next_addr = self.header.avail.next_block;

        let popped = {
            let head = read_ofs(&mut self.f, next_addr, layout.avail_header_size() as usize)?;
            let mut rdr = head.as_slice();
            let sz = ser::read32(layout.endian, &mut rdr)?;
            let count = ser::read32(layout.endian, &mut rdr)?;
            let chain = layout.read_offset(&mut rdr)?;

            if sz == 0 || count > sz {
                self.note_fatal("avail stack block failed validation");
                return Err(Error::BadAvail);
            }

            let body = read_ofs(
                &mut self.f,
                next_addr + u64::from(layout.avail_header_size()),
                (count * layout.avail_elem_size()) as usize,
            )?;
            let mut rdr = body.as_slice();
            let mut elems = Vec::with_capacity(count as usize);
            for _ in 0..count {
                elems.push(AvailElem::from_reader(layout, &mut rdr)?);
            }
            elems.sort();

            AvailBlock::with(sz, chain, elems)
        };

        debug!(
            "pop avail block at {next_addr}: {} elements return",
            popped.elems.len()
        );

        // unchain first, so a push during the merge links the new block
        // correctly
        self.header.avail.next_block = popped.next_block;
        self.header.dirty = true;

        for elem in popped.elems {
            if self.header.avail.is_full() {
                self.push_avail_block()?;
            }
            self.header.avail.insert(elem, true);
        }

        // the popped block's own extent is free space now
        let extent = AvailBlock::stack_extent(layout, popped.sz);
        if self.header.avail.is_full() {
            self.push_avail_block()?;
        }
        self.header.avail.insert(
            AvailElem {
                sz: extent,
                addr: next_addr,
            },
            true,
        );

        Ok(())
    }

    // Keep the current bucket's avail table near one-third full: pull
    // an element from the header when it runs dry, push spares back
    // when it brims.  Localizes most writes to the bucket.
    fn adjust_bucket_avail(&mut self) -> Result<()> {
        let third = BUCKET_AVAIL / 3;

        let av_count = match self.bucket_cache.current_bucket() {
            Some(bucket) => bucket.avail.len(),
            None => return Ok(()),
        };

        if av_count < third {
            if let Some(elem) = self.header.avail.elems.pop() {
                self.header.dirty = true;
                let coalesce = self.coalesce_blocks;
                self.bucket_cache
                    .current_bucket_mut()
                    .unwrap()
                    .free(elem.addr, elem.sz, coalesce);
            }
            return Ok(());
        }

        while self.bucket_cache.current_bucket().unwrap().avail.len() > BUCKET_AVAIL - third
            && !self.header.avail.is_full()
        {
            let elem = {
                let bucket = self.bucket_cache.current_bucket_mut().unwrap();
                avail::extract_elem(&mut bucket.avail, 0)
            };
            match elem {
                Some(elem) => {
                    let coalesce = self.coalesce_blocks;
                    self.header.free(elem.addr, elem.sz, coalesce);
                }
                None => {
                    self.note_fatal("bucket avail table is inconsistent");
                    return Err(Error::BadAvail);
                }
            }
        }

        Ok(())
    }

    // Return (addr,sz) to the free pool.  Small extents go to the
    // current bucket, large ones (or everything under central_free) to
    // the header table, pushing an overflow block when it is full.
    fn free_record(&mut self, addr: u64, sz: u32) -> Result<()> {
        // simply forget elements too small to worry about
        if sz <= IGNORE_SIZE {
            return Ok(());
        }

        if sz >= self.header.block_sz || self.central_free {
            if self.header.avail.is_full() {
                self.push_avail_block()?;
            }
            self.header.free(addr, sz, self.coalesce_blocks);
        } else {
            let bucket_has_room = self
                .bucket_cache
                .current_bucket()
                .map(|bucket| bucket.avail.len() < BUCKET_AVAIL)
                .unwrap_or(false);

            if bucket_has_room {
                let coalesce = self.coalesce_blocks;
                self.bucket_cache
                    .current_bucket_mut()
                    .unwrap()
                    .free(addr, sz, coalesce);
            } else {
                if self.header.avail.is_full() {
                    self.push_avail_block()?;
                }
                self.header.free(addr, sz, self.coalesce_blocks);
            }
        }

        if self.header.dirty {
            self.adjust_bucket_avail()?;
        }

        Ok(())
    }

    // Allocate `size` bytes of file space: current bucket's avail table
    // first, then the header table (replenished from the overflow stack
    // when it runs low), then fresh blocks at the end of the file.  The
    // unused tail of whatever was found goes straight back to the pool.
    fn allocate_record(&mut self, size: u32) -> Result<u64> {
        let (offset, length) = match self
            .bucket_cache
            .current_bucket_mut()
            .and_then(|bucket| bucket.allocate(size))
        {
            Some(block) => block,
            None => {
                if self.header.avail.elems.len() <= (self.header.avail.sz as usize) / 2
                    && self.header.avail.next_block != 0
                {
                    self.pop_avail_block()?;
                }

                match self.header.allocate(size) {
                    Some(block) => block,
                    None => self.extend(size),
                }
            }
        };

        self.free_record(offset + u64::from(size), length - size)?;

        Ok(offset)
    }

    fn write_bucket(&mut self, bucket: &Bucket, offset: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(self.header.bucket_sz as usize);
        bucket
            .serialize(self.header.layout, &mut buf)
            .map_err(Error::Io)?;
        buf.resize(self.header.bucket_sz as usize, 0);
        self.f.write_at(offset, &buf).map_err(Error::Io)?;

        Ok(())
    }

    // write out all not-yet-written bucket images
    fn write_buckets(&mut self) -> Result<()> {
        let layout = self.header.layout;
        let bucket_sz = self.header.bucket_sz as usize;

        for (offset, bucket) in self.bucket_cache.dirty_list() {
            let mut buf = Vec::with_capacity(bucket_sz);
            bucket.serialize(layout, &mut buf).map_err(Error::Io)?;
            buf.resize(bucket_sz, 0);
            self.f.write_at(offset, &buf).map_err(Error::Io)?;
        }
        self.bucket_cache.clear_dirty();

        Ok(())
    }

    fn write_dir(&mut self) -> Result<()> {
        if !self.dir.dirty {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(self.dir.extent(self.header.layout) as usize);
        self.dir
            .serialize(self.header.layout, &mut buf)
            .map_err(Error::Io)?;
        self.f
            .write_at(self.header.dir_ofs, &buf)
            .map_err(Error::Io)?;

        self.dir.dirty = false;

        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        if !self.header.dirty {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(self.header.block_sz as usize);
        self.header.serialize(&mut buf).map_err(Error::Io)?;
        buf.resize(self.header.block_sz as usize, 0);
        self.f.write_at(0, &buf).map_err(Error::Io)?;

        self.header.dirty = false;

        Ok(())
    }

    // write out all cached, not-yet-written metadata and data
    fn write_dirty(&mut self) -> Result<()> {
        self.read_write.state = WriteState::Inconsistent;

        self.write_buckets()?;
        self.write_dir()?;
        self.write_header()?;

        self.read_write.state = WriteState::Clean;

        Ok(())
    }

    /// Write all database state to the file and fsync it.
    ///
    /// On numsync databases the synchronization counter is bumped after
    /// the data is stable, followed by a second fsync, so crash-recovery
    /// snapshots can be ordered.
    ///
    /// A sync with no intervening writes is a no-op.
    pub fn sync(&mut self) -> Result<()> {
        match self.read_write.state {
            WriteState::Clean => Ok(()),
            WriteState::Inconsistent => Err(Error::NeedsRecovery),
            WriteState::Dirty => {
                self.write_dirty()?;
                self.f.sync_data().map_err(Error::Io)?;

                if self.header.numsync.is_some() {
                    self.header.increment_numsync();
                    self.write_header()?;
                    self.f.sync_data().map_err(Error::Io)?;
                }

                Ok(())
            }
        }
    }

    /// Sync and close the database, releasing the lock.
    pub fn close(mut self) -> Result<()> {
        self.sync()
    }

    fn int_remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let loc = self.int_get(key)?;
        let Some((elem_loc, data)) = loc else {
            return Ok(None);
        };

        self.read_write.state = WriteState::Inconsistent;

        let elem = self
            .bucket_cache
            .current_bucket_mut()
            .unwrap()
            .remove(elem_loc);

        // release record bytes to the available-space pool
        self.free_record(elem.data_ofs, elem.key_size + elem.data_size)?;

        self.read_write.state = WriteState::Dirty;

        Ok(Some(data))
    }

    /// Remove the entry for `key`, returning the raw bytes value if it
    /// existed.
    pub fn remove<K: ToBytesRef + ?Sized>(&mut self, key: &K) -> Result<Option<Vec<u8>>> {
        self.int_remove(key.to_bytes_ref().as_ref())
            .and_then(|old_value| {
                if old_value.is_some() && self.read_write.sync {
                    self.sync()?;
                }

                Ok(old_value)
            })
    }

    fn int_insert(&mut self, key: &[u8], data: &[u8]) -> Result<()> {
        self.read_write.state = WriteState::Inconsistent;

        let offset = self.allocate_record((key.len() + data.len()) as u32)?;

        let mut record = Vec::with_capacity(key.len() + data.len());
        record.extend_from_slice(key);
        record.extend_from_slice(data);
        self.f.write_at(offset, &record).map_err(Error::Io)?;

        let bucket_elem = BucketElement::new(key, data, offset);
        self.cache_load_bucket(bucket_dir(self.header.dir_bits, bucket_elem.hash))?;

        while self.bucket_cache.current_bucket().unwrap().is_full() {
            self.split_bucket()?;
            self.cache_load_bucket(bucket_dir(self.header.dir_bits, bucket_elem.hash))?;
        }

        self.bucket_cache
            .current_bucket_mut()
            .unwrap()
            .insert(bucket_elem);

        self.read_write.state = WriteState::Dirty;

        Ok(())
    }

    /// Insert an entry, replacing (and returning) any previous value
    /// stored under the same key.
    ///
    /// # Examples
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().unwrap();
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> gdbm_core::Result<()> {
    /// #         let mut db = gdbm_core::OpenOptions::new().write().create().open(&path)?;
    /// db.insert("marmite", "dog")?;
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn insert<K: ToBytesRef + ?Sized, V: ToBytesRef + ?Sized>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<Option<Vec<u8>>> {
        let key_ref = key.to_bytes_ref();
        let value_ref = value.to_bytes_ref();
        let key = key_ref.as_ref();
        let value = value_ref.as_ref();

        if let Some((elem_loc, old_value)) = self.int_get(key)? {
            if old_value.len() == value.len() {
                // same size: overwrite the value bytes in place
                let elem = self.bucket_cache.current_bucket().unwrap().tab[elem_loc];
                self.read_write.state = WriteState::Inconsistent;
                self.f
                    .write_at(elem.data_ofs + u64::from(elem.key_size), value)
                    .map_err(Error::Io)?;
                self.read_write.state = WriteState::Dirty;
                self.bucket_cache.clear_current_datum();
            } else {
                self.int_remove(key)?;
                self.int_insert(key, value)?;
            }

            if self.read_write.sync {
                self.sync()?;
            }
            return Ok(Some(old_value));
        }

        self.int_insert(key, value)?;
        if self.read_write.sync {
            self.sync()?;
        }

        Ok(None)
    }

    /// Insert an entry unless the key already exists; the existing raw
    /// value is returned in that case, and the database is unchanged.
    ///
    /// # Examples
    /// ```
    /// # use tempfile::tempdir;
    /// # fn main() -> Result<(), String> {
    /// #     let tmp_dir = tempdir().unwrap();
    /// #     let path = tmp_dir.path().join("test");
    /// #     || -> gdbm_core::Result<()> {
    /// #         let mut db = gdbm_core::OpenOptions::new().write().create().open(&path)?;
    /// match db.try_insert("marmite", "cat")? {
    ///     Some(v) => {
    ///         println!("marmite exists and is a {}", std::str::from_utf8(&v).unwrap())
    ///     }
    ///     None => println!("added marmite to the database"),
    /// };
    /// #         Ok(())
    /// #     }().map_err(|e| e.to_string())
    /// # }
    /// ```
    pub fn try_insert<K: ToBytesRef + ?Sized, V: ToBytesRef + ?Sized>(
        &mut self,
        key: &K,
        value: &V,
    ) -> Result<Option<Vec<u8>>> {
        let key_ref = key.to_bytes_ref();
        let key = key_ref.as_ref();

        match self.int_get(key)? {
            Some((_, old_value)) => Ok(Some(old_value)),
            None => {
                self.int_insert(key, value.to_bytes_ref().as_ref())?;
                if self.read_write.sync {
                    self.sync()?;
                }
                Ok(None)
            }
        }
    }

    // Split the current (full) bucket, doubling the directory first if
    // the bucket is already at full depth.
    fn split_bucket(&mut self) -> Result<()> {
        if self.bucket_cache.current_bucket().unwrap().bits == self.header.dir_bits {
            self.extend_directory()?;
        }

        let cur_bucket_offset = self.bucket_cache.current_offset().unwrap();
        let new_bucket_offset = self.allocate_record(self.header.bucket_sz)?;

        let (lower, upper) = self.bucket_cache.current_bucket().unwrap().split();
        let bits = lower.bits;

        debug!(
            "split bucket at {cur_bucket_offset} to depth {bits}, new bucket at {new_bucket_offset}"
        );

        let _ = self.bucket_cache.insert(cur_bucket_offset, lower, true);
        if let Some((evicted_offset, evicted_bucket)) =
            self.bucket_cache.insert(new_bucket_offset, upper, true)
        {
            self.write_bucket(&evicted_bucket, evicted_offset)?;
        }

        self.dir
            .update_bucket_split(self.header.dir_bits, bits, cur_bucket_offset, new_bucket_offset);
        self.header.dirty = true;

        Ok(())
    }

    // Double the directory: the new image goes to a fresh extent and is
    // written there before the header points at it, so a failure mid-way
    // leaves the old directory intact.  The old extent is freed last.
    fn extend_directory(&mut self) -> Result<()> {
        if self.header.dir_bits >= GDBM_HASH_BITS {
            return Err(Error::DirOverflow);
        }

        let directory = self.dir.extend();
        let size = directory.extent(self.header.layout);
        let offset = self.allocate_record(size)?;

        debug!(
            "doubling directory to {} bits at {offset}",
            self.header.dir_bits + 1
        );

        let mut buf = Vec::with_capacity(size as usize);
        directory
            .serialize(self.header.layout, &mut buf)
            .map_err(Error::Io)?;
        self.f.write_at(offset, &buf).map_err(Error::Io)?;

        let (old_ofs, old_sz) = (self.header.dir_ofs, self.header.dir_sz);
        self.header.dir_bits += 1;
        self.header.dir_ofs = offset;
        self.header.dir_sz = size;
        self.header.dirty = true;

        self.dir = directory;
        self.dir.dirty = false;

        self.free_record(old_ofs, old_sz)?;

        if self.bucket_cache.auto_sized() {
            let displaced = self
                .bucket_cache
                .set_cachesize(auto_cachesize(self.header.dir_bits), true);
            self.write_displaced(displaced)?;
        }

        Ok(())
    }

    /// Convert between the standard and numsync formats in place.
    ///
    /// The extension header lives inside the first block at the expense
    /// of avail table capacity; on conversion to numsync, avail elements
    /// that no longer fit are re-freed through the regular path.
    pub fn set_numsync(&mut self, numsync: bool) -> Result<()> {
        self.assert_consistent()?;
        self.read_write.state = WriteState::Inconsistent;

        let shaved = self.header.convert_numsync(numsync);
        for (addr, sz) in shaved {
            self.free_record(addr, sz)?;
        }

        self.read_write.state = WriteState::Dirty;

        Ok(())
    }

    /// Rebuild the database, reclaiming all unused file space.
    ///
    /// Every entry is copied into a scratch database which then replaces
    /// the current file contents.  Needs free disk space up to the size
    /// of the database.
    pub fn compact(&mut self) -> Result<()> {
        self.assert_consistent()?;

        let mut tmpdb = OpenOptions::new()
            .write()
            .create()
            .alignment(Some(self.header.layout.alignment))
            .block_size(BlockSize::Exactly(self.header.block_sz))
            .numsync(self.header.numsync.is_some())
            .tempfile()?;
        tmpdb.header.numsync = self.header.numsync;

        self.iter::<Vec<u8>, Vec<u8>>()
            .try_for_each(|entry| {
                let (key, value) = entry?;
                tmpdb.insert(&key, &value).map(|_| ())
            })
            .and_then(|()| tmpdb.sync())?;

        let new_len = tmpdb.header.next_block;
        {
            let src = tmpdb.f.file_mut();
            let dst = self.f.file_mut();
            src.seek(SeekFrom::Start(0))?;
            dst.seek(SeekFrom::Start(0))?;
            io::copy(src, dst)?;
        }
        self.f.set_len(new_len)?;

        let file_len = self.f.len()?;
        self.header = load_header(&mut self.f, file_len)?;
        self.dir = load_directory(&mut self.f, &self.header)?;
        self.bucket_cache = BucketCache::new(
            self.bucket_cache.cachesize(),
            self.bucket_cache.auto_sized(),
            None,
        );
        self.read_write.state = WriteState::Clean;

        Ok(())
    }
}

impl<R> Drop for Gdbm<R> {
    fn drop(&mut self) {
        let db: &mut dyn Any = self as &mut dyn Any;
        if let Some(db) = db.downcast_mut::<Gdbm<ReadWrite>>() {
            let _ = db.sync();
        }
    }
}

#[derive(Debug)]
struct Slot {
    bucket: usize,
    element: usize,
}

fn next_slot<R>(db: &Gdbm<R>, slot: &Slot) -> Option<Slot>
where
    Gdbm<R>: CacheBucket,
    R: Default + 'static,
{
    match slot {
        Slot { bucket, element } if element + 1 < db.header.bucket_elems as usize => Some(Slot {
            bucket: *bucket,
            element: element + 1,
        }),
        Slot { bucket, .. } => {
            let current_bucket_offset = db.dir.dir[*bucket];
            (db.dir.dir)
                .iter()
                .enumerate()
                .skip(bucket + 1)
                .find(|(_, &offset)| offset != current_bucket_offset)
                .map(|(bucket, _)| Slot { bucket, element: 0 })
        }
    }
}

fn next_occupied_slot<R>(db: &mut Gdbm<R>, slot: &Slot) -> Option<Result<Slot>>
where
    Gdbm<R>: CacheBucket,
    R: Default + 'static,
{
    let mut candidate = next_slot(db, slot);
    while let Some(slot) = candidate {
        let is_occupied = db
            .cache_load_bucket(slot.bucket)
            .map(|bucket| bucket.tab[slot.element].is_occupied());
        match is_occupied {
            Ok(false) => (),
            Ok(true) => return Some(Ok(slot)),
            Err(e) => return Some(Err(e)),
        }
        candidate = next_slot(db, &slot);
    }

    None
}

fn first_occupied_slot<R>(db: &mut Gdbm<R>) -> Option<Result<Slot>>
where
    Gdbm<R>: CacheBucket,
    R: Default + 'static,
{
    let slot = Slot {
        bucket: 0,
        element: 0,
    };
    match db.cache_load_bucket(0) {
        Ok(bucket) => {
            if bucket.tab[0].is_occupied() {
                Some(Ok(slot))
            } else {
                next_occupied_slot(db, &slot)
            }
        }
        Err(e) => Some(Err(e)),
    }
}

struct GDBMIterator<'a, R: 'static> {
    key_or_value: KeyOrValue,
    db: &'a mut Gdbm<R>,
    slot: Option<Result<Slot>>,
}

enum KeyOrValue {
    Key,
    Value,
    Both,
}

impl<'a, R> GDBMIterator<'a, R>
where
    Gdbm<R>: CacheBucket,
    R: Default + 'static,
{
    fn new(db: &'a mut Gdbm<R>, key_or_value: KeyOrValue) -> GDBMIterator<'a, R> {
        let slot = match db.assert_consistent() {
            Ok(()) => first_occupied_slot(db),
            Err(e) => Some(Err(e)),
        };
        Self {
            key_or_value,
            db,
            slot,
        }
    }
}

impl<R> Iterator for GDBMIterator<'_, R>
where
    Gdbm<R>: CacheBucket,
    R: Default + 'static,
{
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.slot.take();
        match slot {
            None => None,
            Some(Err(e)) => Some(Err(e)),
            Some(Ok(slot)) => {
                let data = self
                    .db
                    .cache_load_bucket(slot.bucket)
                    .map(|bucket| {
                        let elem = bucket.tab[slot.element];
                        (elem.data_ofs, elem.key_size as usize, elem.data_size as usize)
                    })
                    .and_then(
                        |(offset, key_length, data_length)| match self.key_or_value {
                            KeyOrValue::Key => read_ofs(&mut self.db.f, offset, key_length)
                                .map(|data| (data, vec![])),
                            KeyOrValue::Value => {
                                read_ofs(&mut self.db.f, offset + key_length as u64, data_length)
                                    .map(|data| (vec![], data))
                            }
                            KeyOrValue::Both => {
                                read_ofs(&mut self.db.f, offset, key_length + data_length).map(
                                    |data| {
                                        let (key, value) = data.split_at(key_length);
                                        (key.to_vec(), value.to_vec())
                                    },
                                )
                            }
                        },
                    );

                match data {
                    Ok(data) => {
                        self.slot = next_occupied_slot(self.db, &slot);
                        Some(Ok(data))
                    }
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }
}
