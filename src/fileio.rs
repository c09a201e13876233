//
// fileio.rs -- positioned file I/O with an optional mapped read window
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use log::trace;
use memmap2::{Advice, Mmap, MmapOptions};

/// Default bound on the mapped window, in bytes.
pub const DEFAULT_MMAP_MAX: usize = 64 * 1024 * 1024;

// mmap offsets must be page aligned
const MAP_ALIGN: u64 = 4096;

#[derive(Debug)]
struct Window {
    map: Mmap,
    start: u64,
}

impl Window {
    fn covers(&self, ofs: u64, len: usize) -> bool {
        ofs >= self.start && ofs + len as u64 <= self.start + self.map.len() as u64
    }
}

/// Positioned access to the database file.
///
/// Reads and writes retry on short transfers (`read_exact_at` /
/// `write_all_at`).  When mapping is enabled, reads are served from a
/// read-only window that slides so each access is contained; the window
/// never exceeds `map_max` bytes.  Writes always go through the file
/// descriptor, invalidating the window where they overlap it.
#[derive(Debug)]
pub struct DbFile {
    file: File,
    mmap_enabled: bool,
    map_max: usize,
    preread: bool,
    window: Option<Window>,
}

impl DbFile {
    pub fn new(file: File, mmap_enabled: bool, map_max: Option<usize>, preread: bool) -> DbFile {
        DbFile {
            file,
            mmap_enabled,
            map_max: map_max.unwrap_or(DEFAULT_MMAP_MAX).max(MAP_ALIGN as usize),
            preread,
            window: None,
        }
    }

    pub fn len(&self) -> io::Result<u64> {
        self.file.metadata().map(|m| m.len())
    }

    pub fn read_at(&mut self, ofs: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_into(ofs, &mut buf)?;
        Ok(buf)
    }

    pub fn read_into(&mut self, ofs: u64, buf: &mut [u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        if self.mmap_enabled {
            if !matches!(&self.window, Some(w) if w.covers(ofs, buf.len())) {
                self.slide(ofs, buf.len())?;
            }
            if let Some(w) = &self.window {
                if w.covers(ofs, buf.len()) {
                    let lo = (ofs - w.start) as usize;
                    buf.copy_from_slice(&w.map[lo..lo + buf.len()]);
                    return Ok(());
                }
            }
        }

        self.file.read_exact_at(buf, ofs)
    }

    // Move the window so [ofs, ofs+len) is contained, when possible.
    // Accesses past EOF or larger than the window bound fall back to
    // plain positioned reads.
    fn slide(&mut self, ofs: u64, len: usize) -> io::Result<()> {
        let file_len = self.len()?;
        let start = ofs - (ofs % MAP_ALIGN);
        let want = (ofs - start) + len as u64;

        if ofs + len as u64 > file_len || want > self.map_max as u64 {
            self.window = None;
            return Ok(());
        }

        let map_len = (self.map_max as u64).min(file_len - start);
        trace!("sliding mmap window to {start}+{map_len}");

        let map = unsafe {
            MmapOptions::new()
                .offset(start)
                .len(map_len as usize)
                .map(&self.file)?
        };
        if self.preread {
            let _ = map.advise(Advice::WillNeed);
        }

        self.window = Some(Window { map, start });
        Ok(())
    }

    pub fn write_at(&mut self, ofs: u64, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, ofs)?;

        if matches!(&self.window, Some(w)
            if ofs < w.start + w.map.len() as u64 && ofs + data.len() as u64 > w.start)
        {
            self.window = None;
        }

        Ok(())
    }

    pub fn sync_data(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    pub fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.window = None;
        self.file.set_len(len)
    }

    pub fn set_mmap(&mut self, enabled: bool) {
        self.mmap_enabled = enabled;
        if !enabled {
            self.window = None;
        }
    }

    pub fn mmap_enabled(&self) -> bool {
        self.mmap_enabled
    }

    pub fn set_map_max(&mut self, map_max: usize) {
        self.map_max = map_max.max(MAP_ALIGN as usize);
        self.window = None;
    }

    pub fn map_max(&self) -> usize {
        self.map_max
    }

    pub fn invalidate_window(&mut self) {
        self.window = None;
    }

    /// Raw descriptor access for whole-file operations (locking, copy).
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut File {
        self.window = None;
        &mut self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(mmap: bool) -> DbFile {
        DbFile::new(tempfile::tempfile().unwrap(), mmap, None, false)
    }

    #[test]
    fn write_then_read_plain() {
        let mut f = scratch(false);
        f.write_at(100, b"hello").unwrap();
        assert_eq!(f.read_at(100, 5).unwrap(), b"hello");
    }

    #[test]
    fn write_then_read_mapped() {
        let mut f = scratch(true);
        let block = vec![0xabu8; 8192];
        f.write_at(0, &block).unwrap();
        assert_eq!(f.read_at(4000, 200).unwrap(), vec![0xab; 200]);

        // a write overlapping the window invalidates it and reads stay
        // coherent
        f.write_at(4096, b"fresh").unwrap();
        assert_eq!(f.read_at(4096, 5).unwrap(), b"fresh");
    }

    #[test]
    fn window_slides_for_far_reads() {
        let mut f = DbFile::new(tempfile::tempfile().unwrap(), true, Some(4096), false);
        let mut block = vec![0u8; 3 * 4096];
        block[8192] = 7;
        f.write_at(0, &block).unwrap();

        assert_eq!(f.read_at(0, 1).unwrap(), vec![0]);
        assert_eq!(f.read_at(8192, 1).unwrap(), vec![7]);
    }

    #[test]
    fn short_read_reports_eof() {
        let mut f = scratch(true);
        f.write_at(0, b"tiny").unwrap();
        let err = f.read_at(0, 64).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
