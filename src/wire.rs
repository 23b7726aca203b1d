//! Bounds-checked little-endian reader
//!
//! Every decoder in the crate reads through [`WireReader`] so that a short or
//! truncated buffer becomes a `ProtocolViolation` instead of a panic. Encoders
//! write with [`bytes::BufMut`].

use bytes::Buf;
use tracing::trace;

use crate::error::{EipError, EipResult};

/// Cursor over a borrowed byte slice, advanced through [`bytes::Buf`]
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    total: usize,
}

impl<'a> WireReader<'a> {
    /// Start reading at the beginning of `data`
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            total: data.len(),
        }
    }

    /// Current offset from the start of the buffer
    #[inline]
    pub fn position(&self) -> usize {
        self.total - self.data.remaining()
    }

    /// Bytes left to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.data.has_remaining()
    }

    /// Fail without advancing unless `len` bytes are left
    fn ensure(&self, len: usize) -> EipResult<()> {
        if self.remaining() >= len {
            return Ok(());
        }
        trace!(
            "Short read: need {} bytes at offset {}, {} left",
            len,
            self.position(),
            self.remaining()
        );
        Err(EipError::protocol(format!(
            "Insufficient data: needed {} bytes at offset {}, {} available",
            len,
            self.position(),
            self.remaining()
        )))
    }

    /// Take the next `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> EipResult<&'a [u8]> {
        self.ensure(len)?;
        let slice = &self.data[..len];
        self.data.advance(len);
        Ok(slice)
    }

    /// Take the next `N` bytes as an array
    pub fn read_array<const N: usize>(&mut self) -> EipResult<[u8; N]> {
        self.ensure(N)?;
        let mut out = [0u8; N];
        self.data.copy_to_slice(&mut out);
        Ok(out)
    }

    #[inline]
    pub fn read_u8(&mut self) -> EipResult<u8> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    #[inline]
    pub fn read_u16(&mut self) -> EipResult<u16> {
        self.ensure(2)?;
        Ok(self.data.get_u16_le())
    }

    #[inline]
    pub fn read_u32(&mut self) -> EipResult<u32> {
        self.ensure(4)?;
        Ok(self.data.get_u32_le())
    }

    #[inline]
    pub fn read_i32(&mut self) -> EipResult<i32> {
        self.ensure(4)?;
        Ok(self.data.get_i32_le())
    }

    #[inline]
    pub fn read_u64(&mut self) -> EipResult<u64> {
        self.ensure(8)?;
        Ok(self.data.get_u64_le())
    }

    /// Network byte order u16 (socket address fields)
    #[inline]
    pub fn read_u16_be(&mut self) -> EipResult<u16> {
        self.ensure(2)?;
        Ok(self.data.get_u16())
    }

    /// Network byte order i16 (socket address family)
    #[inline]
    pub fn read_i16_be(&mut self) -> EipResult<i16> {
        self.ensure(2)?;
        Ok(self.data.get_i16())
    }

    /// Take everything that is left
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.data;
        self.data.advance(rest.len());
        rest
    }

    /// Skip `len` bytes
    pub fn skip(&mut self, len: usize) -> EipResult<()> {
        self.ensure(len)?;
        self.data.advance(len);
        Ok(())
    }

    /// Fail if any bytes are left unread
    pub fn finish(&self, what: &str) -> EipResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(EipError::protocol(format!(
                "{}: {} trailing bytes",
                what,
                self.remaining()
            )))
        }
    }
}

/// Read a little-endian u16 at `offset` without a cursor
pub fn u16_at(data: &[u8], offset: usize) -> EipResult<u16> {
    let mut reader = WireReader::new(data);
    reader.skip(offset)?;
    reader.read_u16()
}

/// Read a little-endian i32 at `offset` without a cursor
pub fn i32_at(data: &[u8], offset: usize) -> EipResult<i32> {
    let mut reader = WireReader::new(data);
    reader.skip(offset)?;
    reader.read_i32()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_reads() {
        let data = [0x01, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xAB];
        let mut reader = WireReader::new(&data);
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0x12345678);
        assert_eq!(reader.remaining(), 1);
        assert_eq!(reader.read_rest(), &[0xAB]);
        assert!(reader.finish("test").is_ok());
    }

    #[test]
    fn test_short_read_is_protocol_violation() {
        let data = [0x01];
        let mut reader = WireReader::new(&data);
        let err = reader.read_u16().unwrap_err();
        assert!(matches!(err, EipError::ProtocolViolation { .. }));
        // Failed reads do not advance
        assert_eq!(reader.position(), 0);
        assert_eq!(reader.remaining(), 1);
    }

    #[test]
    fn test_position_tracks_every_read_kind() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A];
        let mut reader = WireReader::new(&data);
        reader.skip(1).unwrap();
        assert_eq!(reader.position(), 1);
        assert_eq!(reader.read_array::<2>().unwrap(), [0x02, 0x03]);
        assert_eq!(reader.read_bytes(3).unwrap(), &[0x04, 0x05, 0x06]);
        assert_eq!(reader.position(), 6);
        assert!(reader.read_u64().is_err());
        assert_eq!(reader.read_i32().unwrap(), 0x0A090807);
        assert_eq!(reader.position(), 10);
        assert!(reader.is_empty());
        assert!(reader.read_rest().is_empty());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let data = [0x01, 0x02];
        let mut reader = WireReader::new(&data);
        reader.read_u8().unwrap();
        assert!(reader.finish("segment").is_err());
    }

    #[test]
    fn test_big_endian_fields() {
        let data = [0x00, 0x02, 0xAF, 0x12];
        let mut reader = WireReader::new(&data);
        assert_eq!(reader.read_i16_be().unwrap(), 2);
        assert_eq!(reader.read_u16_be().unwrap(), 44818);
    }

    #[test]
    fn test_offset_helpers() {
        let data = [0xA0, 0x02, 0x05, 0x00, 0x00, 0x00];
        assert_eq!(u16_at(&data, 0).unwrap(), 0x02A0);
        assert_eq!(i32_at(&data, 2).unwrap(), 5);
        assert!(i32_at(&data, 4).is_err());
    }
}
