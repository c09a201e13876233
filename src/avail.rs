//
// avail.rs -- avail (free space) list routines
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::io::{self, Error, ErrorKind, Read, Write};

use crate::ser::{read32, write32, Alignment, Layout};

/// Freed extents of this size or smaller are dropped on the floor
/// rather than tracked.
pub const IGNORE_SIZE: u32 = 4;

/// One unit of reusable file space.
///
/// Derived ordering is by size, then address; avail tables rely on it
/// to stay sorted by size ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct AvailElem {
    pub sz: u32,
    pub addr: u64,
}

impl AvailElem {
    pub fn from_reader(layout: Layout, rdr: &mut impl Read) -> io::Result<Self> {
        let sz = read32(layout.endian, rdr)?;
        if layout.alignment == Alignment::Align64 {
            let _padding = read32(layout.endian, rdr)?;
        }
        let addr = layout.read_offset(rdr)?;

        Ok(AvailElem { sz, addr })
    }

    pub fn serialize(&self, layout: Layout, w: &mut impl Write) -> io::Result<()> {
        write32(layout.endian, w, self.sz)?;
        if layout.alignment == Alignment::Align64 {
            write32(layout.endian, w, 0)?;
        }
        layout.write_offset(w, self.addr)
    }
}

/// Insert `elem` into a size-sorted avail table, optionally merging it
/// with elements adjacent in file space first.
///
/// Elements at or below [`IGNORE_SIZE`] are discarded.  The table is
/// scanned for neighbours on either side (`a.addr + a.sz == b.addr`);
/// merged neighbours are removed and the combined extent is inserted at
/// its binary-searched position.
pub fn insert_elem(table: &mut Vec<AvailElem>, mut elem: AvailElem, coalesce: bool) {
    if elem.sz <= IGNORE_SIZE {
        return;
    }

    if coalesce {
        let mut i = 0;
        while i < table.len() {
            let cur = table[i];
            if cur.addr + u64::from(cur.sz) == elem.addr {
                // right adjacent
                elem = AvailElem {
                    sz: cur.sz + elem.sz,
                    addr: cur.addr,
                };
                table.remove(i);
            } else if elem.addr + u64::from(elem.sz) == cur.addr {
                // left adjacent
                elem.sz += cur.sz;
                table.remove(i);
            } else {
                i += 1;
            }
        }
    }

    let pos = table.partition_point(|e| e.sz < elem.sz);
    table.insert(pos, elem);
}

/// Extract the first (smallest) element able to satisfy `size` bytes.
pub fn extract_elem(table: &mut Vec<AvailElem>, size: u32) -> Option<AvailElem> {
    let pos = table.partition_point(|e| e.sz < size);
    (pos < table.len()).then(|| table.remove(pos))
}

/// A sorted table of avail elements plus the link to the next block on
/// the overflow stack.  The instance embedded in the file header has
/// capacity `sz`; stacked overflow blocks share the same shape.
#[derive(Debug, Clone)]
pub struct AvailBlock {
    /// Table capacity in elements.
    pub sz: u32,
    /// File address of the next avail block on the stack, 0 if none.
    pub next_block: u64,
    pub elems: Vec<AvailElem>,
}

impl AvailBlock {
    pub fn new(sz: u32) -> AvailBlock {
        AvailBlock {
            sz,
            next_block: 0,
            elems: Vec::new(),
        }
    }

    pub fn with(sz: u32, next_block: u64, elems: Vec<AvailElem>) -> AvailBlock {
        AvailBlock {
            sz,
            next_block,
            elems,
        }
    }

    pub fn is_full(&self) -> bool {
        self.elems.len() >= self.sz as usize
    }

    pub fn insert(&mut self, elem: AvailElem, coalesce: bool) {
        insert_elem(&mut self.elems, elem, coalesce);
    }

    pub fn remove(&mut self, size: u32) -> Option<AvailElem> {
        extract_elem(&mut self.elems, size)
    }

    /// Split the table for a push onto the overflow stack: elements at
    /// even positions stay, elements at odd positions move to the new
    /// block.  Both halves remain sorted.
    pub fn partition(&self) -> (Vec<AvailElem>, Vec<AvailElem>) {
        let (keep, moved): (Vec<_>, Vec<_>) = self
            .elems
            .iter()
            .enumerate()
            .partition(|(i, _)| i % 2 == 0);

        (
            keep.into_iter().map(|(_, e)| *e).collect(),
            moved.into_iter().map(|(_, e)| *e).collect(),
        )
    }

    /// On-disk size of the bookkeeping plus `count` table entries.
    pub fn sizeof(layout: Layout, count: u32) -> u32 {
        layout.avail_header_size() + count * layout.avail_elem_size()
    }

    /// Extent allocated for a stacked overflow block of capacity `sz`:
    /// half the table, rounded the way the split leaves it.
    pub fn stack_extent(layout: Layout, sz: u32) -> u32 {
        (sz * layout.avail_elem_size()) / 2 + layout.avail_header_size()
    }

    pub fn from_reader(layout: Layout, rdr: &mut impl Read) -> io::Result<Self> {
        let sz = read32(layout.endian, rdr)?;
        let count = read32(layout.endian, rdr)?;
        let next_block = layout.read_offset(rdr)?;

        if count > sz {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("avail block count {count} exceeds capacity {sz}"),
            ));
        }

        let mut elems = Vec::with_capacity(count as usize);
        for _ in 0..count {
            elems.push(AvailElem::from_reader(layout, rdr)?);
        }

        // maintain the sorted-by-size invariant even if the file does not
        elems.sort();

        Ok(AvailBlock {
            sz,
            next_block,
            elems,
        })
    }

    pub fn serialize(&self, layout: Layout, w: &mut impl Write) -> io::Result<()> {
        write32(layout.endian, w, self.sz)?;
        write32(layout.endian, w, self.elems.len() as u32)?;
        layout.write_offset(w, self.next_block)?;

        self.elems
            .iter()
            .try_for_each(|elem| elem.serialize(layout, w))
    }
}
