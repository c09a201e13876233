//
// magic.rs -- database file magic numbers
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::fmt;
use std::io::{Read, Write};

use crate::error::Error;
use crate::ser::Alignment;

const OMAGIC: u32 = 0x13579ace;
const MAGIC32: u32 = 0x13579acd;
const MAGIC64: u32 = 0x13579acf;
const NUMSYNC_MAGIC32: u32 = 0x13579ad0;
const NUMSYNC_MAGIC64: u32 = 0x13579ad1;

/// Database file variant, stored as the first word of the header.
///
/// The magic is written in the host byte order; a file whose magic reads
/// back byte-swapped was produced on a foreign-endian host and is
/// rejected rather than transparently converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    /// Pre-versioned format with 32-bit offsets.  Readable, never written.
    Old,
    Standard32,
    Standard64,
    Numsync32,
    Numsync64,
}

impl Magic {
    pub fn new(alignment: Alignment, numsync: bool) -> Magic {
        match (alignment, numsync) {
            (Alignment::Align32, false) => Magic::Standard32,
            (Alignment::Align32, true) => Magic::Numsync32,
            (Alignment::Align64, false) => Magic::Standard64,
            (Alignment::Align64, true) => Magic::Numsync64,
        }
    }

    pub fn from_reader(rdr: &mut impl Read) -> Result<Magic, Error> {
        let mut buf = [0u8; 4];
        rdr.read_exact(&mut buf).map_err(Error::Io)?;

        let word = u32::from_ne_bytes(buf);
        match word {
            OMAGIC => Ok(Magic::Old),
            MAGIC32 => Ok(Magic::Standard32),
            MAGIC64 => Ok(Magic::Standard64),
            NUMSYNC_MAGIC32 => Ok(Magic::Numsync32),
            NUMSYNC_MAGIC64 => Ok(Magic::Numsync64),
            _ => match word.swap_bytes() {
                OMAGIC | MAGIC32 | MAGIC64 | NUMSYNC_MAGIC32 | NUMSYNC_MAGIC64 => {
                    Err(Error::ByteSwapped(word))
                }
                _ => Err(Error::BadMagic(word)),
            },
        }
    }

    pub fn serialize(&self, w: &mut impl Write) -> std::io::Result<()> {
        let word = match self {
            Magic::Old => OMAGIC,
            Magic::Standard32 => MAGIC32,
            Magic::Standard64 => MAGIC64,
            Magic::Numsync32 => NUMSYNC_MAGIC32,
            Magic::Numsync64 => NUMSYNC_MAGIC64,
        };
        w.write_all(&word.to_ne_bytes())
    }

    pub fn alignment(&self) -> Alignment {
        match self {
            Magic::Old | Magic::Standard32 | Magic::Numsync32 => Alignment::Align32,
            Magic::Standard64 | Magic::Numsync64 => Alignment::Align64,
        }
    }

    pub fn is_numsync(&self) -> bool {
        matches!(self, Magic::Numsync32 | Magic::Numsync64)
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Magic::Old => "GDBM_OMAGIC",
            Magic::Standard32 => "GDBM_MAGIC32",
            Magic::Standard64 => "GDBM_MAGIC64",
            Magic::Numsync32 => "GDBM_NUMSYNC_MAGIC32",
            Magic::Numsync64 => "GDBM_NUMSYNC_MAGIC64",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for magic in [
            Magic::Old,
            Magic::Standard32,
            Magic::Standard64,
            Magic::Numsync32,
            Magic::Numsync64,
        ] {
            let mut buf = Vec::new();
            magic.serialize(&mut buf).unwrap();
            assert_eq!(Magic::from_reader(&mut buf.as_slice()).unwrap(), magic);
        }
    }

    #[test]
    fn rejects_foreign_byte_order() {
        let swapped = MAGIC64.swap_bytes().to_ne_bytes();
        assert!(matches!(
            Magic::from_reader(&mut swapped.as_slice()),
            Err(Error::ByteSwapped(_))
        ));
    }

    #[test]
    fn rejects_garbage() {
        let junk = 0xdeadbeefu32.to_ne_bytes();
        assert!(matches!(
            Magic::from_reader(&mut junk.as_slice()),
            Err(Error::BadMagic(_))
        ));
    }
}
