//
// bucket.rs -- hash bucket routines
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::io::{self, Read, Write};

use crate::avail::{extract_elem, insert_elem, AvailElem};
use crate::hashutil::{hash_key, PartialKey, GDBM_HASH_BITS, KEY_SMALL};
use crate::ser::{read32, write32, Alignment, Layout};

/// Number of distributed avail entries carried by each bucket.
pub const BUCKET_AVAIL: usize = 6;

// on-disk hash_value of an unoccupied slot (-1 as a signed int)
const EMPTY_HASH: u32 = u32::MAX;

/// One slot of a bucket's hash table: the full 31-bit hash, the first
/// few key bytes, and the location of the key record in the file (the
/// value follows the key directly).
#[derive(Debug, Clone, Copy)]
pub struct BucketElement {
    pub hash: u32,
    pub key_start: PartialKey,
    pub data_ofs: u64,
    pub key_size: u32,
    pub data_size: u32,
}

impl BucketElement {
    pub fn new(key: &[u8], data: &[u8], offset: u64) -> Self {
        BucketElement {
            hash: hash_key(key),
            key_start: PartialKey::new(key),
            data_ofs: offset,
            key_size: key.len() as u32,
            data_size: data.len() as u32,
        }
    }

    pub fn empty() -> Self {
        BucketElement {
            hash: EMPTY_HASH,
            key_start: PartialKey::new(&[]),
            data_ofs: 0,
            key_size: 0,
            data_size: 0,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.hash != EMPTY_HASH
    }

    pub fn from_reader(layout: Layout, rdr: &mut impl Read) -> io::Result<Self> {
        let hash = read32(layout.endian, rdr)?;

        let mut key_start = [0u8; KEY_SMALL];
        rdr.read_exact(&mut key_start)?;

        let data_ofs = layout.read_offset(rdr)?;
        let key_size = read32(layout.endian, rdr)?;
        let data_size = read32(layout.endian, rdr)?;

        Ok(BucketElement {
            hash,
            key_start: PartialKey::from_bytes(key_start),
            data_ofs,
            key_size,
            data_size,
        })
    }

    pub fn serialize(&self, layout: Layout, w: &mut impl Write) -> io::Result<()> {
        write32(layout.endian, w, self.hash)?;
        w.write_all(self.key_start.as_bytes())?;
        layout.write_offset(w, self.data_ofs)?;
        write32(layout.endian, w, self.key_size)?;
        write32(layout.endian, w, self.data_size)
    }
}

/// A leaf of the extendible hash: a fixed table of element slots probed
/// linearly from the key's home position, plus a small distributed
/// avail table.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub avail: Vec<AvailElem>,
    /// Local depth: number of hash prefix bits that discriminate this
    /// bucket in the directory.
    pub bits: u32,
    pub count: u32,
    pub tab: Vec<BucketElement>,
}

impl Bucket {
    pub fn new(bits: u32, nelems: usize) -> Bucket {
        Bucket {
            avail: Vec::new(),
            bits,
            count: 0,
            tab: vec![BucketElement::empty(); nelems],
        }
    }

    pub fn is_full(&self) -> bool {
        self.count as usize >= self.tab.len()
    }

    /// Place a new element, probing linearly from its home position.
    /// The caller ensures the bucket is not full.
    pub fn insert(&mut self, elem: BucketElement) {
        debug_assert!(!self.is_full());
        self.place(elem);
        self.count += 1;
    }

    fn place(&mut self, elem: BucketElement) {
        let len = self.tab.len();
        let mut loc = elem.hash as usize % len;
        while self.tab[loc].is_occupied() {
            loc = (loc + 1) % len;
        }
        self.tab[loc] = elem;
    }

    /// Clear the slot at `elem_loc` and re-place every element in the
    /// probe cluster that follows it, so later lookups still terminate
    /// at the first empty slot.
    pub fn remove(&mut self, elem_loc: usize) -> BucketElement {
        let removed = self.tab[elem_loc];
        self.tab[elem_loc] = BucketElement::empty();
        self.count -= 1;

        let len = self.tab.len();
        let mut loc = (elem_loc + 1) % len;
        while self.tab[loc].is_occupied() {
            let elem = self.tab[loc];
            self.tab[loc] = BucketElement::empty();
            self.place(elem);
            loc = (loc + 1) % len;
        }

        removed
    }

    /// Split into two buckets one bit deeper.  Elements move to the new
    /// (upper) bucket when the next hash bit below the shared prefix is
    /// set.  Distributed avail entries stay with the original bucket;
    /// avail rebalancing evens things out over time.
    pub fn split(&self) -> (Bucket, Bucket) {
        let bits = self.bits + 1;
        let mut lower = Bucket::new(bits, self.tab.len());
        let mut upper = Bucket::new(bits, self.tab.len());

        self.tab
            .iter()
            .filter(|elem| elem.is_occupied())
            .for_each(|elem| {
                if (elem.hash >> (GDBM_HASH_BITS - bits)) & 1 == 1 {
                    upper.insert(*elem);
                } else {
                    lower.insert(*elem);
                }
            });

        lower.avail = self.avail.clone();

        (lower, upper)
    }

    /// First-fit allocation from the bucket's own avail table.
    pub fn allocate(&mut self, size: u32) -> Option<(u64, u32)> {
        extract_elem(&mut self.avail, size).map(|elem| (elem.addr, elem.sz))
    }

    /// Record a freed extent in the bucket's avail table.  The caller
    /// checks there is room.
    pub fn free(&mut self, addr: u64, sz: u32, coalesce: bool) {
        debug_assert!(self.avail.len() < BUCKET_AVAIL);
        insert_elem(&mut self.avail, AvailElem { sz, addr }, coalesce);
    }

    pub fn from_reader(bucket_elems: u32, layout: Layout, rdr: &mut impl Read) -> io::Result<Self> {
        let av_count = read32(layout.endian, rdr)?;
        if layout.alignment == Alignment::Align64 {
            let _padding = read32(layout.endian, rdr)?;
        }

        if av_count as usize > BUCKET_AVAIL {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bucket avail count {av_count} exceeds {BUCKET_AVAIL}"),
            ));
        }

        // the avail array is fixed size; slots past av_count are junk
        let mut avail = Vec::with_capacity(av_count as usize);
        for idx in 0..BUCKET_AVAIL as u32 {
            let elem = AvailElem::from_reader(layout, rdr)?;
            if idx < av_count {
                avail.push(elem);
            }
        }
        avail.sort();

        let bits = read32(layout.endian, rdr)?;
        let count = read32(layout.endian, rdr)?;

        let mut tab = Vec::with_capacity(bucket_elems as usize);
        for _ in 0..bucket_elems {
            tab.push(BucketElement::from_reader(layout, rdr)?);
        }

        Ok(Bucket {
            avail,
            bits,
            count,
            tab,
        })
    }

    pub fn serialize(&self, layout: Layout, w: &mut impl Write) -> io::Result<()> {
        write32(layout.endian, w, self.avail.len() as u32)?;
        if layout.alignment == Alignment::Align64 {
            write32(layout.endian, w, 0)?;
        }

        debug_assert!(self.avail.len() <= BUCKET_AVAIL);
        for elem in &self.avail {
            elem.serialize(layout, w)?;
        }
        let dummy = AvailElem { sz: 0, addr: 0 };
        for _ in self.avail.len()..BUCKET_AVAIL {
            dummy.serialize(layout, w)?;
        }

        write32(layout.endian, w, self.bits)?;
        write32(layout.endian, w, self.count)?;

        self.tab
            .iter()
            .try_for_each(|elem| elem.serialize(layout, w))
    }
}
