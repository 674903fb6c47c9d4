//! Big-endian field primitives and the command block builder.

use crate::result::{Result, SaneError};
use std::fmt;

/// Write `value` as a `width`-byte big-endian field at `offset`.
///
/// Values that do not fit in `width` bytes and fields running past the end of
/// `buf` are rejected with [`SaneError::Inval`]; `buf` is left untouched then.
pub fn put_be(buf: &mut [u8], offset: usize, value: u64, width: usize) -> Result<()> {
    if width == 0 || width > 8 {
        return Err(SaneError::Inval);
    }

    if width < 8 && value >> (width * 8) != 0 {
        log::warn!("Value {value} does not fit into {width} bytes");
        return Err(SaneError::Inval);
    }

    let field = offset
        .checked_add(width)
        .and_then(|end| buf.get_mut(offset..end))
        .ok_or(SaneError::Inval)?;

    field.copy_from_slice(&value.to_be_bytes()[8 - width..]);

    Ok(())
}

/// Read a `width`-byte big-endian field at `offset`.
pub fn get_be(buf: &[u8], offset: usize, width: usize) -> Option<u64> {
    if width == 0 || width > 8 {
        return None;
    }

    let field = buf.get(offset..offset.checked_add(width)?)?;

    Some(field.iter().fold(0u64, |acc, &b| acc << 8 | b as u64))
}

/// Zero-filled fixed-length byte block assembled field by field.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandBlock(Vec<u8>);

impl CommandBlock {
    pub fn new(len: usize) -> Self {
        Self(vec![0; len])
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// Set a single byte. Offsets past the end are a programming error in a
    /// layout table and are reported as `Inval`.
    pub fn byte(mut self, offset: usize, value: u8) -> Result<Self> {
        *self.0.get_mut(offset).ok_or(SaneError::Inval)? = value;
        Ok(self)
    }

    pub fn field(mut self, offset: usize, width: usize, value: u64) -> Result<Self> {
        put_be(&mut self.0, offset, value, width)?;
        Ok(self)
    }

    pub fn bytes(mut self, offset: usize, value: &[u8]) -> Result<Self> {
        let end = offset.checked_add(value.len()).ok_or(SaneError::Inval)?;
        self.0
            .get_mut(offset..end)
            .ok_or(SaneError::Inval)?
            .copy_from_slice(value);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for CommandBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_put_be_widths() {
        let mut buf = [0u8; 8];

        put_be(&mut buf, 0, 0x0102, 2).unwrap();
        put_be(&mut buf, 2, 0x030405, 3).unwrap();
        put_be(&mut buf, 5, 0x06, 1).unwrap();

        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x00, 0x00]);
    }

    #[test]
    fn test_put_be_rejects_overflow() {
        let mut buf = [0u8; 4];

        assert_eq!(put_be(&mut buf, 0, 0x1_0000, 2), Err(SaneError::Inval));
        assert_eq!(put_be(&mut buf, 0, 0x100, 1), Err(SaneError::Inval));
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn test_put_be_rejects_out_of_bounds() {
        let mut buf = [0u8; 4];

        assert_eq!(put_be(&mut buf, 3, 1, 2), Err(SaneError::Inval));
        assert_eq!(put_be(&mut buf, usize::MAX, 1, 2), Err(SaneError::Inval));
        assert_eq!(put_be(&mut buf, 0, 1, 0), Err(SaneError::Inval));
    }

    #[test]
    fn test_get_be() {
        let buf = [0x00, 0x00, 0x12, 0x34, 0x56];

        assert_eq!(get_be(&buf, 2, 2), Some(0x1234));
        assert_eq!(get_be(&buf, 2, 3), Some(0x123456));
        assert_eq!(get_be(&buf, 4, 2), None);
    }

    #[test]
    fn test_command_block() {
        let block = CommandBlock::new(6)
            .byte(0, 0x15)
            .and_then(|b| b.field(4, 1, 12))
            .unwrap();

        assert_eq!(block.as_bytes(), &[0x15, 0, 0, 0, 12, 0]);
        assert_eq!(CommandBlock::new(2).byte(2, 1), Err(SaneError::Inval));
    }
}
