//
// error.rs -- the crate error type
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::io;

/// Everything that can go wrong while operating on a database.
///
/// Variants carrying file offsets or sizes report the values actually
/// found so corruption is diagnosable without a hex dump.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to convert stored bytes into the requested type.
    #[error("cannot decode stored bytes: {0}")]
    BadData(String),

    /// First word of the file is not a known magic number.
    #[error("unknown magic number {0:#010x}")]
    BadMagic(u32),

    /// The file was written on a host of opposite endianness.
    #[error("magic {0:#010x} is byte-swapped; foreign byte order is not readable")]
    ByteSwapped(u32),

    /// Block size found in header is impossibly small.
    #[error("header block size {found} is below the minimum {minimum}")]
    BadHeaderBlockSize { found: u32, minimum: u32 },

    /// Directory extent in header puts it outside the file.
    #[error("directory extent {offset}+{size} does not fit the file ({file_size} bytes)")]
    BadHeaderDirectory { offset: u64, size: u32, file_size: u64 },

    /// Directory size and bits in the header are inconsistent.
    #[error("directory size {size} inconsistent with directory depth {bits}")]
    BadHeaderDirectoryBits { size: u32, bits: u32 },

    /// Bucket size in header is impossibly small.
    #[error("header bucket size {found} is below the minimum {minimum}")]
    BadHeaderBucketSize { found: u32, minimum: u32 },

    /// Bucket element count in header inconsistent with bucket size.
    #[error("header claims {elems} bucket elements, bucket size implies {expected}")]
    BadHeaderBucketElems { elems: u32, expected: u32 },

    /// Avail table capacity does not match the block size.
    #[error("avail table capacity {size} does not match block size {block_size}")]
    BadHeaderAvail { size: u32, block_size: u32 },

    /// More avail elements than the table can hold.
    #[error("avail table holds {count} elements but has capacity {size}")]
    BadHeaderAvailCount { count: u32, size: u32 },

    /// An avail element points outside the data area.
    #[error("avail element {index} ({offset}+{size}) lies outside the data area")]
    BadAvailElem { index: usize, offset: u64, size: u32 },

    /// An avail table violated its ordering or bounds invariants.
    #[error("avail table is corrupted")]
    BadAvail,

    /// Numsync extension carries an unknown version.
    #[error("numsync extension version {version} is not supported")]
    BadNumsyncVersion { version: u32 },

    /// A directory entry points at an impossible bucket offset.
    #[error("directory entry {index} points at invalid offset {offset}")]
    BadDirEntry { index: usize, offset: u64 },

    /// A bucket image failed validation.
    #[error(
        "bucket at {offset} is corrupted: {elems} elements (max {max_elems}), \
         depth {bits} (directory depth {dir_bits})"
    )]
    BadBucket {
        offset: u64,
        elems: u32,
        bits: u32,
        max_elems: u32,
        dir_bits: u32,
    },

    /// Could not use the supplied block size and an exact size was required.
    #[error("cannot honor exact block size {requested} (would use {actual})")]
    BadBlockSize { requested: u32, actual: u32 },

    /// The directory cannot double past the hash width.
    #[error("directory cannot grow past the 31-bit hash space")]
    DirOverflow,

    /// Could not obtain a shared lock on the database file.
    #[error("database is locked: cannot become reader")]
    CantBeReader,

    /// Could not obtain an exclusive lock on the database file.
    #[error("database is locked: cannot become writer")]
    CantBeWriter,

    /// A fatal error poisoned the handle; only `recover` may follow.
    #[error("database needs recovery")]
    NeedsRecovery,

    /// Insert-mode store found the key already present.
    #[error("key already exists")]
    CannotReplace,

    /// Recovery hit one of its failure thresholds.
    #[error("recovery gave up: {0}")]
    RecoveryFailed(String),

    /// Could not write the pre-recovery backup copy.
    #[error("could not back up the damaged database: {0}")]
    BackupFailed(io::Error),
}

impl Error {
    /// True for errors that leave the on-disk state untrustworthy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::BadAvail
                | Error::BadAvailElem { .. }
                | Error::BadBucket { .. }
                | Error::BadDirEntry { .. }
                | Error::NeedsRecovery
        )
    }
}
