//
// bytes.rs -- key and value conversion traits
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use crate::error::Error;

/// A byte view of a key or value, borrowed when the source allows it.
pub enum BytesRef<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a [u8]),
}

impl AsRef<[u8]> for BytesRef<'_> {
    fn as_ref(&self) -> &[u8] {
        match self {
            BytesRef::Owned(v) => v.as_ref(),
            BytesRef::Borrowed(r) => r,
        }
    }
}

/// Types usable as keys or values when storing.
pub trait ToBytesRef {
    fn to_bytes_ref(&self) -> BytesRef<'_>;
}

impl ToBytesRef for [u8] {
    fn to_bytes_ref(&self) -> BytesRef<'_> {
        BytesRef::Borrowed(self)
    }
}

impl<const N: usize> ToBytesRef for [u8; N] {
    fn to_bytes_ref(&self) -> BytesRef<'_> {
        BytesRef::Borrowed(self)
    }
}

impl ToBytesRef for Vec<u8> {
    fn to_bytes_ref(&self) -> BytesRef<'_> {
        BytesRef::Borrowed(self)
    }
}

impl ToBytesRef for str {
    fn to_bytes_ref(&self) -> BytesRef<'_> {
        BytesRef::Borrowed(self.as_bytes())
    }
}

impl ToBytesRef for String {
    fn to_bytes_ref(&self) -> BytesRef<'_> {
        BytesRef::Borrowed(self.as_bytes())
    }
}

impl ToBytesRef for u32 {
    fn to_bytes_ref(&self) -> BytesRef<'_> {
        BytesRef::Owned(self.to_be_bytes().to_vec())
    }
}

impl ToBytesRef for u64 {
    fn to_bytes_ref(&self) -> BytesRef<'_> {
        BytesRef::Owned(self.to_be_bytes().to_vec())
    }
}

impl ToBytesRef for usize {
    fn to_bytes_ref(&self) -> BytesRef<'_> {
        BytesRef::Owned(self.to_be_bytes().to_vec())
    }
}

impl<T: ToBytesRef + ?Sized> ToBytesRef for &T {
    fn to_bytes_ref(&self) -> BytesRef<'_> {
        (**self).to_bytes_ref()
    }
}

/// Types recoverable from stored bytes.
pub trait FromBytes: Sized {
    fn from_bytes(bytes: &[u8]) -> Result<Self, Error>;
}

impl FromBytes for Vec<u8> {
    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(bytes.to_vec())
    }
}

impl FromBytes for String {
    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| Error::BadData(e.to_string()))
    }
}

fn exact_array<const N: usize>(bytes: &[u8]) -> Result<[u8; N], Error> {
    bytes
        .try_into()
        .map_err(|_| Error::BadData(format!("expected {N} bytes, found {}", bytes.len())))
}

impl FromBytes for u32 {
    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        exact_array(bytes).map(u32::from_be_bytes)
    }
}

impl FromBytes for u64 {
    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        exact_array(bytes).map(u64::from_be_bytes)
    }
}

impl FromBytes for usize {
    fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        exact_array(bytes).map(usize::from_be_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_round_trip() {
        let bytes = "hello".to_bytes_ref();
        assert_eq!(bytes.as_ref(), b"hello");
        assert_eq!(String::from_bytes(bytes.as_ref()).unwrap(), "hello");
    }

    #[test]
    fn u32_round_trip() {
        let n: u32 = 0xdeadbeef;
        let bytes = n.to_bytes_ref();
        assert_eq!(u32::from_bytes(bytes.as_ref()).unwrap(), n);
    }

    #[test]
    fn wrong_width_is_bad_data() {
        assert!(matches!(u32::from_bytes(b"abc"), Err(Error::BadData(_))));
    }

    #[test]
    fn invalid_utf8_is_bad_data() {
        assert!(matches!(
            String::from_bytes(&[0xff, 0xfe]),
            Err(Error::BadData(_))
        ));
    }
}
