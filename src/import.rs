//
// import.rs -- dump file readers
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::io::{self, BufRead, BufReader, Error, ErrorKind, Read};

use base64::Engine;

use crate::ser::{read32, read64, Alignment, Endian};

/// Iterator over the key/value records of an ASCII dump.
pub struct ASCIIImportIterator<'a> {
    buf_reader: BufReader<&'a mut dyn Read>,
}

impl<'a> ASCIIImportIterator<'a> {
    pub fn new(reader: &'a mut dyn Read) -> io::Result<Self> {
        let mut buf_reader = BufReader::new(reader);
        Self::read_header(&mut buf_reader)?;

        Ok(Self { buf_reader })
    }

    fn read_header(buf_reader: &mut BufReader<&'a mut dyn Read>) -> io::Result<Vec<String>> {
        buf_reader
            .lines()
            .map(|line| match line {
                Ok(s) if s.as_str().starts_with('#') => Ok(s),
                Ok(s) => Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("bad header line: {s}"),
                )),
                Err(e) => Err(e),
            })
            .take_while(|l| !l.as_ref().is_ok_and(|s| s == "# End of header"))
            .collect()
    }

    fn read_line(&mut self) -> io::Result<String> {
        self.buf_reader
            .by_ref()
            .lines()
            .next()
            .unwrap_or(Err(Error::new(ErrorKind::UnexpectedEof, "end of input")))
    }

    fn read_base64(&mut self, length: usize) -> io::Result<Vec<u8>> {
        let bytes = self
            .buf_reader
            .by_ref()
            .bytes()
            .filter(|b| {
                !b.as_ref()
                    .map(|b| b.is_ascii_whitespace())
                    .unwrap_or_default()
            })
            .take((4 * length / 3 + 3) & !3) // length of base64 representation
            .collect::<io::Result<Vec<_>>>()?;

        // read past line ending
        self.read_line().and_then(|l| {
            l.is_empty()
                .then_some(())
                .ok_or_else(|| Error::new(ErrorKind::InvalidData, "unexpected data"))
        })?;

        base64::prelude::BASE64_STANDARD
            .decode(bytes)
            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("bad base64: {e}")))
            .and_then(|decoded| {
                (decoded.len() == length)
                    .then_some(decoded)
                    .ok_or_else(|| Error::new(ErrorKind::InvalidData, "length mismatch"))
            })
    }

    fn read_datum(&mut self) -> io::Result<Option<Vec<u8>>> {
        let line = self.read_line()?;
        match line.split_once('=') {
            Some(("#:count", _)) => Ok(None),
            Some(("#:len", length)) => length
                .parse::<usize>()
                .map_err(|e| Error::new(ErrorKind::InvalidData, format!("bad line ({line}): {e}")))
                .and_then(|length| self.read_base64(length))
                .map(Some),
            _ => Err(Error::new(
                ErrorKind::InvalidData,
                format!("bad data ({line})"),
            )),
        }
    }
}

impl Iterator for ASCIIImportIterator<'_> {
    type Item = io::Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_datum() {
            Ok(None) => None,
            Ok(Some(key)) => match self.read_datum() {
                Ok(None) => Some(Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "key without value",
                ))),
                Ok(Some(value)) => Some(Ok((key, value))),
                Err(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(e)),
        }
    }
}

/// Iterator over the records of a binary dump.  Length fields are big
/// endian, 4 or 8 bytes wide depending on the alignment the dump was
/// produced with.
pub struct BinaryImportIterator<'a> {
    alignment: Alignment,
    reader: BufReader<&'a mut dyn Read>,
}

impl<'a> BinaryImportIterator<'a> {
    pub fn new(alignment: Alignment, reader: &'a mut dyn Read) -> io::Result<Self> {
        let mut reader = BufReader::new(reader);

        // skip the text banner: four lines beginning with '!'
        let mut line = String::new();
        for _ in 0..4 {
            line.clear();
            reader.read_line(&mut line)?;
            if !line.starts_with('!') {
                return Err(Error::new(ErrorKind::InvalidData, "bad binary dump header"));
            }
        }

        Ok(Self { alignment, reader })
    }

    fn read_datum(&mut self) -> io::Result<Option<Vec<u8>>> {
        let length = match self.alignment {
            Alignment::Align32 => match read32(Endian::Big, &mut self.reader) {
                Ok(n) => n as usize,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            },
            Alignment::Align64 => match read64(Endian::Big, &mut self.reader) {
                Ok(n) => n as usize,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e),
            },
        };

        let mut data = vec![0u8; length];
        self.reader.read_exact(&mut data)?;
        Ok(Some(data))
    }
}

impl Iterator for BinaryImportIterator<'_> {
    type Item = io::Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_datum() {
            Ok(None) => None,
            Ok(Some(key)) => match self.read_datum() {
                Ok(Some(value)) => Some(Ok((key, value))),
                Ok(None) => Some(Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "key without value",
                ))),
                Err(e) => Some(Err(e)),
            },
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ascii_iterates() {
        let export = "# GDBM dump file created by 1.23
#:version=1.1
#:file=some_file.gdbm
#:format=standard
# End of header
#:len=7
SGVsb
G8sIA==
#:len=6
d29
ybGQh
#:count=2
# End of data";

        let kv = ASCIIImportIterator::new(&mut export.as_bytes())
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
            .into_iter()
            .map(|(k, v)| {
                std::str::from_utf8(&k).unwrap().to_string() + std::str::from_utf8(&v).unwrap()
            })
            .collect::<String>();
        assert_eq!(kv, "Hello, world!");
    }

    #[test]
    fn binary_iterates() {
        let mut dump = Vec::new();
        dump.extend_from_slice(b"!\r\n! GDBM FLAT FILE DUMP -- THIS IS NOT A TEXT FILE\r\n");
        dump.extend_from_slice(b"! 1.23\r\n!\r\n");
        for datum in [&b"key"[..], b"value"] {
            dump.extend_from_slice(&(datum.len() as u32).to_be_bytes());
            dump.extend_from_slice(datum);
        }

        let records = BinaryImportIterator::new(Alignment::Align32, &mut dump.as_slice())
            .unwrap()
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records, vec![(b"key".to_vec(), b"value".to_vec())]);
    }
}
