//
// header.rs -- global file header routines
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::io::{self, Read, Write};

use crate::avail::{AvailBlock, IGNORE_SIZE};
use crate::dir::build_dir_size;
use crate::error::Error;
use crate::magic::Magic;
use crate::ser::{read32, write32, Layout};

/// Minimal acceptable block size.
pub const GDBM_MIN_BLOCK_SIZE: u32 = 512;

// size of the numsync extension header: version, counter, reserve
const EXT_HEADER_SIZE: u32 = 4 + 4 + 24;

/// The database file header: location of the directory, geometry of
/// buckets, the next unallocated offset, and the header-resident avail
/// block.  Numsync databases additionally carry an extension header
/// with a synchronization counter.
#[derive(Debug)]
pub struct Header {
    pub magic: Magic,
    pub layout: Layout,
    pub block_sz: u32,
    pub dir_ofs: u64,
    pub dir_sz: u32,
    pub dir_bits: u32,
    pub bucket_sz: u32,
    pub bucket_elems: u32,
    pub next_block: u64,
    /// Synchronization counter; present on numsync databases.
    pub numsync: Option<u32>,
    pub avail: AvailBlock,

    pub dirty: bool,
}

// core header fields: magic, block size, dir offset/size/bits, bucket
// size/elems, next block
fn core_size(layout: Layout) -> u32 {
    4 + 4 + layout.offset_size() + 4 + 4 + 4 + 4 + layout.offset_size()
}

/// Capacity of the header-resident avail table: whatever is left of the
/// first block after the fixed fields, one extra element for the table
/// base.
pub fn avail_capacity(layout: Layout, block_sz: u32, numsync: bool) -> u32 {
    let ext = if numsync { EXT_HEADER_SIZE } else { 0 };
    let overhead = core_size(layout) + ext + layout.avail_header_size();
    (block_sz - overhead) / layout.avail_elem_size() + 1
}

/// Number of element slots in a bucket of `bucket_sz` bytes.
pub fn bucket_count(layout: Layout, bucket_sz: u32) -> u32 {
    (bucket_sz - layout.bucket_header_size()) / layout.bucket_elem_size()
}

impl Header {
    /// Header for a freshly created database: directory directly after
    /// the header block, one initial bucket after the directory.
    pub fn new(block_sz: u32, layout: Layout, numsync: bool) -> Header {
        let (dir_sz, dir_bits) = build_dir_size(layout.alignment, block_sz);
        let dir_blocks = dir_sz.div_ceil(block_sz);

        let bucket_sz = block_sz;
        let dir_ofs = u64::from(block_sz);
        let next_block = dir_ofs + u64::from(dir_blocks * block_sz) + u64::from(bucket_sz);

        Header {
            magic: Magic::new(layout.alignment, numsync),
            layout,
            block_sz,
            dir_ofs,
            dir_sz,
            dir_bits,
            bucket_sz,
            bucket_elems: bucket_count(layout, bucket_sz),
            next_block,
            numsync: numsync.then_some(0),
            avail: AvailBlock::new(avail_capacity(layout, block_sz, numsync)),
            dirty: true,
        }
    }

    pub fn from_reader(file_len: u64, rdr: &mut impl Read) -> Result<Header, Error> {
        let magic = Magic::from_reader(rdr)?;
        let layout = Layout {
            alignment: magic.alignment(),
            endian: crate::ser::Endian::native(),
        };

        let block_sz = read32(layout.endian, rdr)?;
        let dir_ofs = layout.read_offset(rdr)?;
        let dir_sz = read32(layout.endian, rdr)?;
        let dir_bits = read32(layout.endian, rdr)?;
        let bucket_sz = read32(layout.endian, rdr)?;
        let bucket_elems = read32(layout.endian, rdr)?;
        let next_block = layout.read_offset(rdr)?;

        let min_block = core_size(layout) + layout.avail_header_size() + layout.avail_elem_size();
        if block_sz < min_block {
            return Err(Error::BadHeaderBlockSize {
                found: block_sz,
                minimum: min_block,
            });
        }

        if next_block > file_len {
            // the file is shorter than the header believes
            return Err(Error::NeedsRecovery);
        }

        if dir_ofs == 0
            || dir_sz == 0
            || dir_ofs + u64::from(dir_sz) > file_len
        {
            return Err(Error::BadHeaderDirectory {
                offset: dir_ofs,
                size: dir_sz,
                file_size: file_len,
            });
        }

        let (min_dir_sz, _) = build_dir_size(layout.alignment, block_sz);
        if dir_sz < min_dir_sz
            || dir_bits >= 32
            || u64::from(dir_sz) != (1u64 << dir_bits) * u64::from(layout.offset_size())
        {
            return Err(Error::BadHeaderDirectoryBits {
                size: dir_sz,
                bits: dir_bits,
            });
        }

        let min_bucket = layout.bucket_header_size() + layout.bucket_elem_size();
        if bucket_sz < min_bucket {
            return Err(Error::BadHeaderBucketSize {
                found: bucket_sz,
                minimum: min_bucket,
            });
        }

        if bucket_elems != bucket_count(layout, bucket_sz) {
            return Err(Error::BadHeaderBucketElems {
                elems: bucket_elems,
                expected: bucket_count(layout, bucket_sz),
            });
        }

        let numsync = if magic.is_numsync() {
            let version = read32(layout.endian, rdr)?;
            if version != 0 {
                return Err(Error::BadNumsyncVersion { version });
            }
            let counter = read32(layout.endian, rdr)?;
            let mut reserve = [0u8; 24];
            rdr.read_exact(&mut reserve).map_err(Error::Io)?;
            Some(counter)
        } else {
            None
        };

        let avail = AvailBlock::from_reader(layout, rdr)?;
        if avail.sz < 2 || avail.sz != avail_capacity(layout, block_sz, numsync.is_some()) {
            return Err(Error::BadHeaderAvail {
                size: avail.sz,
                block_size: block_sz,
            });
        }
        if avail.elems.len() > avail.sz as usize {
            return Err(Error::BadHeaderAvailCount {
                count: avail.elems.len() as u32,
                size: avail.sz,
            });
        }
        for (index, elem) in avail.elems.iter().enumerate() {
            if elem.sz <= IGNORE_SIZE
                || elem.addr < u64::from(block_sz)
                || elem.addr + u64::from(elem.sz) > next_block
            {
                return Err(Error::BadAvailElem {
                    index,
                    offset: elem.addr,
                    size: elem.sz,
                });
            }
        }

        Ok(Header {
            magic,
            layout,
            block_sz,
            dir_ofs,
            dir_sz,
            dir_bits,
            bucket_sz,
            bucket_elems,
            next_block,
            numsync,
            avail,
            dirty: false,
        })
    }

    pub fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        let layout = self.layout;

        self.magic.serialize(w)?;
        write32(layout.endian, w, self.block_sz)?;
        layout.write_offset(w, self.dir_ofs)?;
        write32(layout.endian, w, self.dir_sz)?;
        write32(layout.endian, w, self.dir_bits)?;
        write32(layout.endian, w, self.bucket_sz)?;
        write32(layout.endian, w, self.bucket_elems)?;
        layout.write_offset(w, self.next_block)?;

        if let Some(counter) = self.numsync {
            write32(layout.endian, w, 0)?; // extension version
            write32(layout.endian, w, counter)?;
            w.write_all(&[0u8; 24])?;
        }

        self.avail.serialize(layout, w)
    }

    /// First-fit allocation from the header avail table.
    pub fn allocate(&mut self, size: u32) -> Option<(u64, u32)> {
        self.avail.remove(size).map(|elem| {
            self.dirty = true;
            (elem.addr, elem.sz)
        })
    }

    /// Record a freed extent in the header avail table.
    pub fn free(&mut self, addr: u64, sz: u32, coalesce: bool) {
        self.avail
            .insert(crate::avail::AvailElem { sz, addr }, coalesce);
        self.dirty = true;
    }

    pub fn increment_numsync(&mut self) {
        if let Some(counter) = &mut self.numsync {
            *counter = counter.wrapping_add(1);
            self.dirty = true;
        }
    }

    /// Switch between the standard and numsync formats in place.  The
    /// extension header claims (or yields) room at the expense of the
    /// avail table; elements that no longer fit are returned so the
    /// caller can re-free them through the regular path.
    pub fn convert_numsync(&mut self, numsync: bool) -> Vec<(u64, u32)> {
        if numsync == self.numsync.is_some() {
            return Vec::new();
        }

        self.magic = Magic::new(self.layout.alignment, numsync);
        self.numsync = numsync.then_some(0);
        self.avail.sz = avail_capacity(self.layout, self.block_sz, numsync);
        self.dirty = true;

        let mut shaved = Vec::new();
        while self.avail.elems.len() > self.avail.sz as usize {
            // largest elements give the most back per slot
            let elem = self.avail.elems.pop().unwrap();
            shaved.push((elem.addr, elem.sz));
        }

        shaved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ser::{Alignment, Endian};

    fn layout() -> Layout {
        Layout {
            alignment: Alignment::Align64,
            endian: Endian::native(),
        }
    }

    #[test]
    fn geometry_for_common_block_sizes() {
        let header = Header::new(4096, layout(), true);
        assert_eq!(header.bucket_elems, 166);
        assert_eq!(header.dir_bits, 9);
        assert_eq!(header.dir_sz, 4096);
        assert_eq!(header.next_block, 3 * 4096);

        let small = Header::new(512, layout(), false);
        assert_eq!(small.bucket_elems, 16);
        assert_eq!(small.dir_bits, 6);
        assert_eq!(small.next_block, 3 * 512);
    }

    #[test]
    fn numsync_shrinks_avail_capacity() {
        let standard = avail_capacity(layout(), 4096, false);
        let numsync = avail_capacity(layout(), 4096, true);
        assert_eq!(standard - numsync, 2);
    }

    #[test]
    fn round_trip() {
        let header = Header::new(4096, layout(), true);
        let mut buf = Vec::new();
        header.serialize(&mut buf).unwrap();

        let back = Header::from_reader(header.next_block, &mut buf.as_slice()).unwrap();
        assert_eq!(back.magic, header.magic);
        assert_eq!(back.block_sz, 4096);
        assert_eq!(back.dir_ofs, header.dir_ofs);
        assert_eq!(back.dir_bits, header.dir_bits);
        assert_eq!(back.bucket_elems, header.bucket_elems);
        assert_eq!(back.numsync, Some(0));
        assert!(!back.dirty);
    }

    #[test]
    fn truncated_file_needs_recovery() {
        let header = Header::new(4096, layout(), false);
        let mut buf = Vec::new();
        header.serialize(&mut buf).unwrap();

        assert!(matches!(
            Header::from_reader(header.next_block - 1, &mut buf.as_slice()),
            Err(Error::NeedsRecovery)
        ));
    }

    #[test]
    fn corrupt_bucket_elems_rejected() {
        let mut header = Header::new(4096, layout(), false);
        header.bucket_elems += 1;
        let mut buf = Vec::new();
        header.serialize(&mut buf).unwrap();

        assert!(matches!(
            Header::from_reader(header.next_block, &mut buf.as_slice()),
            Err(Error::BadHeaderBucketElems { .. })
        ));
    }

    #[test]
    fn convert_round_trip_preserves_small_tables() {
        let mut header = Header::new(4096, layout(), false);
        header.free(8192, 100, false);

        assert!(header.convert_numsync(true).is_empty());
        assert!(header.magic.is_numsync());
        assert_eq!(header.numsync, Some(0));
        assert_eq!(header.avail.elems.len(), 1);

        assert!(header.convert_numsync(false).is_empty());
        assert!(!header.magic.is_numsync());
        assert_eq!(header.numsync, None);
    }
}
