//
// options.rs -- database open builder
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::path::Path;

use crate::lock::LockWait;
use crate::ser::Alignment;
use crate::{Error, Gdbm, ReadOnly, ReadWrite, Result};

/// Block size policy when creating a database.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum BlockSize {
    /// Use the filesystem's preferred I/O size.
    #[default]
    Filesystem,
    /// Use roughly this size (rounded to a valid block size).
    Roughly(u32),
    /// Use exactly this size, or fail with [`Error::BadBlockSize`].
    Exactly(u32),
}

/// Create-mode parameters.
#[derive(Default, Copy, Clone, Debug)]
pub struct Create {
    pub block_size: BlockSize,
    pub alignment: Option<Alignment>,
    pub no_numsync: bool,
    pub truncate: bool,
}

/// Marker: open will not create a missing database.
#[derive(Default, Copy, Clone, Debug)]
pub struct NotCreate;

/// Marker: open read-only.
#[derive(Copy, Clone, Debug, Default)]
pub struct NotWrite;

/// Write-mode parameters.
#[derive(Copy, Clone, Debug, Default)]
pub struct Write<C> {
    pub sync: bool,
    pub create: C,
}

/// Builder for opening or creating a database.
///
/// The type parameter walks `NotWrite` → `Write<NotCreate>` →
/// `Write<Create>` through [`write()`](OpenOptions::write) and
/// [`create()`](OpenOptions::create); each state only offers the
/// options that make sense there.
///
/// # Examples
/// ```
/// # use tempfile::tempdir;
/// # fn main() -> Result<(), String> {
/// #     let tmp_dir = tempdir().map_err(|e| e.to_string())?;
/// #     let path = tmp_dir.path().join("options-doc-test");
/// #     || -> gdbm_core::Result<()> {
/// let mut db = gdbm_core::OpenOptions::new()
///     .write()
///     .create()
///     .open(&path)?;
/// db.insert("greeting", "hello")?;
/// #         Ok(())
/// #     }().map_err(|e| e.to_string())
/// # }
/// ```
#[derive(Copy, Clone, Debug, Default)]
pub struct OpenOptions<W> {
    /// Bucket cache capacity in buckets; automatic when unset.
    pub cachesize: Option<usize>,
    /// What to do when the advisory lock is contended.
    pub lock_wait: LockWait,
    /// Skip file locking entirely.
    pub no_lock: bool,
    /// Never memory-map the file.
    pub no_mmap: bool,
    /// Bound on the mapped window, in bytes.
    pub mmap_max: Option<usize>,
    /// Advise the kernel to fault the mapped window in up front.
    pub preread: bool,

    pub write: W,
}

impl OpenOptions<NotWrite> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<W> OpenOptions<W> {
    pub fn cachesize(self, cachesize: Option<usize>) -> OpenOptions<W> {
        OpenOptions { cachesize, ..self }
    }

    pub fn lock_wait(self, lock_wait: LockWait) -> OpenOptions<W> {
        OpenOptions { lock_wait, ..self }
    }

    pub fn no_lock(self) -> OpenOptions<W> {
        OpenOptions {
            no_lock: true,
            ..self
        }
    }

    pub fn no_mmap(self) -> OpenOptions<W> {
        OpenOptions {
            no_mmap: true,
            ..self
        }
    }

    pub fn mmap_max(self, mmap_max: Option<usize>) -> OpenOptions<W> {
        OpenOptions { mmap_max, ..self }
    }

    pub fn preread(self) -> OpenOptions<W> {
        OpenOptions {
            preread: true,
            ..self
        }
    }
}

impl OpenOptions<NotWrite> {
    pub fn write(self) -> OpenOptions<Write<NotCreate>> {
        OpenOptions {
            cachesize: self.cachesize,
            lock_wait: self.lock_wait,
            no_lock: self.no_lock,
            no_mmap: self.no_mmap,
            mmap_max: self.mmap_max,
            preread: self.preread,
            write: Write {
                sync: false,
                create: NotCreate,
            },
        }
    }
}

impl<C> OpenOptions<Write<C>> {
    /// Write all metadata and fsync after every mutation.
    pub fn sync(self, sync: bool) -> OpenOptions<Write<C>> {
        OpenOptions {
            write: Write {
                sync,
                create: self.write.create,
            },
            ..self
        }
    }
}

impl OpenOptions<Write<NotCreate>> {
    pub fn create(self) -> OpenOptions<Write<Create>> {
        OpenOptions {
            cachesize: self.cachesize,
            lock_wait: self.lock_wait,
            no_lock: self.no_lock,
            no_mmap: self.no_mmap,
            mmap_max: self.mmap_max,
            preread: self.preread,
            write: Write {
                sync: self.write.sync,
                create: Create::default(),
            },
        }
    }
}

impl OpenOptions<Write<Create>> {
    pub fn block_size(self, block_size: BlockSize) -> Self {
        OpenOptions {
            write: Write {
                sync: self.write.sync,
                create: Create {
                    block_size,
                    ..self.write.create
                },
            },
            ..self
        }
    }

    pub fn alignment(self, alignment: Option<Alignment>) -> Self {
        OpenOptions {
            write: Write {
                sync: self.write.sync,
                create: Create {
                    alignment,
                    ..self.write.create
                },
            },
            ..self
        }
    }

    /// Whether new databases use the numsync format (the default).
    pub fn numsync(self, numsync: bool) -> Self {
        OpenOptions {
            write: Write {
                sync: self.write.sync,
                create: Create {
                    no_numsync: !numsync,
                    ..self.write.create
                },
            },
            ..self
        }
    }

    /// Discard any existing database at the path and start fresh.
    pub fn truncate(self) -> Self {
        OpenOptions {
            write: Write {
                sync: self.write.sync,
                create: Create {
                    truncate: true,
                    ..self.write.create
                },
            },
            ..self
        }
    }
}

impl OpenOptions<NotWrite> {
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Gdbm<ReadOnly>> {
        let path = path.as_ref();
        std::fs::OpenOptions::new()
            .read(true)
            .open(path)
            .map_err(Error::Io)
            .and_then(|f| Gdbm::<ReadOnly>::open(f, Some(path.to_path_buf()), self))
    }
}

impl OpenOptions<Write<NotCreate>> {
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Gdbm<ReadWrite>> {
        let path = path.as_ref();
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::Io)
            .and_then(|f| Gdbm::<ReadWrite>::open(f, Some(path.to_path_buf()), self))
            .map(|mut db| {
                db.set_sync(self.write.sync);
                db
            })
    }
}

impl OpenOptions<Write<Create>> {
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Gdbm<ReadWrite>> {
        let path = path.as_ref();

        if self.write.create.truncate {
            return std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(Error::Io)
                .and_then(|f| Gdbm::create(f, Some(path.to_path_buf()), self));
        }

        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(Error::Io)
            .and_then(|f| {
                Gdbm::<ReadWrite>::open(f, Some(path.to_path_buf()), &(*self).without_create())
            })
            .or_else(|e| match e {
                // only fall through to creation when nothing is there
                Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                    std::fs::OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create_new(true)
                        .open(path)
                        .map_err(Error::Io)
                        .and_then(|f| Gdbm::create(f, Some(path.to_path_buf()), self))
                }
                e => Err(e),
            })
            .map(|mut db| {
                db.set_sync(self.write.sync);
                db
            })
    }

    /// Open an anonymous temporary database, deleted when dropped.
    /// Useful for datasets too large for memory that never need to be
    /// reopened.
    pub fn tempfile(&self) -> Result<Gdbm<ReadWrite>> {
        tempfile::tempfile()
            .map_err(Error::Io)
            .and_then(|f| Gdbm::create(f, None, self))
            .map(|mut db| {
                db.set_sync(self.write.sync);
                db
            })
    }

    fn without_create(self) -> OpenOptions<Write<NotCreate>> {
        OpenOptions {
            cachesize: self.cachesize,
            lock_wait: self.lock_wait,
            no_lock: self.no_lock,
            no_mmap: self.no_mmap,
            mmap_max: self.mmap_max,
            preread: self.preread,
            write: Write {
                sync: self.write.sync,
                create: NotCreate,
            },
        }
    }
}
