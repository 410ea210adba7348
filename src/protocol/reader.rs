//! Bounds-checked cursor over a received datagram

use bytes::{Buf, Bytes};

use crate::error::PacketError;

/// Reads little-endian fields from a datagram, advancing an explicit cursor.
///
/// Every read checks the remaining length first, so a short datagram turns
/// into `PacketError::Truncated` instead of a panic. Byte slices are returned
/// as `Bytes` views into the original buffer.
#[derive(Debug, Clone)]
pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, field: &'static str, needed: usize) -> Result<(), PacketError> {
        if self.buf.remaining() < needed {
            return Err(PacketError::Truncated {
                field,
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self, field: &'static str) -> Result<u8, PacketError> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_bool(&mut self, field: &'static str) -> Result<bool, PacketError> {
        Ok(self.read_u8(field)? != 0)
    }

    pub fn read_u32(&mut self, field: &'static str) -> Result<u32, PacketError> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_f32(&mut self, field: &'static str) -> Result<f32, PacketError> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_f32_le())
    }

    /// Read a `u32` that is used as a length or count.
    pub fn read_len(&mut self, field: &'static str) -> Result<usize, PacketError> {
        Ok(self.read_u32(field)? as usize)
    }

    pub fn read_bytes(&mut self, field: &'static str, len: usize) -> Result<Bytes, PacketError> {
        self.ensure(field, len)?;
        Ok(self.buf.split_to(len))
    }

    /// Read a `u32` length prefix followed by that many bytes.
    pub fn read_prefixed(&mut self, field: &'static str) -> Result<Bytes, PacketError> {
        let len = self.read_len(field)?;
        self.read_bytes(field, len)
    }

    /// Consume everything left.
    pub fn read_rest(&mut self) -> Bytes {
        let len = self.buf.remaining();
        self.buf.split_to(len)
    }

    /// Read `count` little-endian `u32` values, checking the whole run up front.
    pub fn read_u32_list(
        &mut self,
        field: &'static str,
        count: usize,
    ) -> Result<Vec<u32>, PacketError> {
        self.ensure(field, count.saturating_mul(4))?;
        Ok((0..count).map(|_| self.buf.get_u32_le()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_little_endian() {
        let mut reader = WireReader::new(Bytes::from_static(&[1, 0, 0, 0, 0xFF, 2, 3]));
        assert_eq!(reader.read_u32("a").unwrap(), 1);
        assert!(reader.read_bool("b").unwrap());
        assert_eq!(reader.read_rest().as_ref(), &[2, 3]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_truncated_reports_field() {
        let mut reader = WireReader::new(Bytes::from_static(&[1, 2]));
        let err = reader.read_u32("frame_id").unwrap_err();
        assert_eq!(
            err,
            PacketError::Truncated {
                field: "frame_id",
                needed: 4,
                remaining: 2
            }
        );
        // A failed read leaves the cursor where it was.
        assert_eq!(reader.remaining(), 2);
    }

    #[test]
    fn test_oversized_list_is_rejected_before_reading() {
        let mut reader = WireReader::new(Bytes::from_static(&[0; 8]));
        assert!(reader.read_u32_list("indices", 3).is_err());
        assert_eq!(reader.read_u32_list("indices", 2).unwrap(), vec![0, 0]);
    }
}
