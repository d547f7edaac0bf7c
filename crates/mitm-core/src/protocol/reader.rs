use std::io::{self, Cursor};

use binrw::{BinRead, Endian};
use byteorder::{LittleEndian, ReadBytesExt};

use super::record::Position;
use crate::error::DecodeError;

/// Bounds-checked little-endian cursor over one record's payload.
///
/// Every read either succeeds or reports `TruncatedRecord` with the absolute
/// offset into the buffer being decoded, so the failure can be located in a
/// hex dump.
pub struct FieldReader<'a> {
    cursor: Cursor<&'a [u8]>,
    opcode: u16,
    base: usize,
}

impl<'a> FieldReader<'a> {
    /// `payload` starts right after the opcode; `base` is its offset in the
    /// decoded buffer.
    pub fn new(payload: &'a [u8], opcode: u16, base: usize) -> Self {
        Self {
            cursor: Cursor::new(payload),
            opcode,
            base,
        }
    }

    pub fn consumed(&self) -> usize {
        self.cursor.position() as usize
    }

    pub fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.consumed()
    }

    pub fn peek(&self, len: usize) -> Option<&'a [u8]> {
        let data: &'a [u8] = *self.cursor.get_ref();
        data.get(self.consumed()..self.consumed() + len)
    }

    fn offset(&self) -> usize {
        self.base + self.consumed()
    }

    fn need(&self, needed: usize) -> Result<(), DecodeError> {
        if self.remaining() < needed {
            return Err(DecodeError::TruncatedRecord {
                opcode: self.opcode,
                offset: self.offset(),
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    fn read_with<T>(
        &mut self,
        size: usize,
        read: impl FnOnce(&mut Cursor<&'a [u8]>) -> io::Result<T>,
    ) -> Result<T, DecodeError> {
        self.need(size)?;
        let offset = self.offset();
        let remaining = self.remaining();
        let opcode = self.opcode;
        read(&mut self.cursor).map_err(|_| DecodeError::TruncatedRecord {
            opcode,
            offset,
            needed: size,
            remaining,
        })
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        self.read_with(1, |c| c.read_u8())
    }

    pub fn i8(&mut self) -> Result<i8, DecodeError> {
        self.read_with(1, |c| c.read_i8())
    }

    pub fn bool(&mut self) -> Result<bool, DecodeError> {
        Ok(self.u8()? != 0)
    }

    pub fn i16(&mut self) -> Result<i16, DecodeError> {
        self.read_with(2, |c| c.read_i16::<LittleEndian>())
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        self.read_with(4, |c| c.read_i32::<LittleEndian>())
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        self.read_with(4, |c| c.read_u32::<LittleEndian>())
    }

    pub fn f32(&mut self) -> Result<f32, DecodeError> {
        self.read_with(4, |c| c.read_f32::<LittleEndian>())
    }

    pub fn vec3(&mut self) -> Result<[f32; 3], DecodeError> {
        self.need(12)?;
        Ok([self.f32()?, self.f32()?, self.f32()?])
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.need(len)?;
        let start = self.consumed();
        let data: &'a [u8] = *self.cursor.get_ref();
        self.cursor.set_position((start + len) as u64);
        Ok(&data[start..start + len])
    }

    /// `i16` length prefix followed by that many UTF-8 bytes.
    pub fn string_i16(&mut self) -> Result<String, DecodeError> {
        let prefix_offset = self.offset();
        let len = self.i16()?;
        let len = self.checked_len(len as i64, prefix_offset)?;
        let text_offset = self.offset();
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidString {
            opcode: self.opcode,
            offset: text_offset,
        })
    }

    /// `i8` length prefix followed by that many raw bytes.
    pub fn blob_i8(&mut self) -> Result<&'a [u8], DecodeError> {
        let prefix_offset = self.offset();
        let len = self.i8()?;
        let len = self.checked_len(len as i64, prefix_offset)?;
        self.bytes(len)
    }

    pub fn position(&mut self) -> Result<Position, DecodeError> {
        let size = Position::SIZE;
        self.read_with(size, |c| {
            Position::read_options(c, Endian::Little, ())
                .map_err(|err| io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string()))
        })
    }

    fn checked_len(&self, length: i64, offset: usize) -> Result<usize, DecodeError> {
        usize::try_from(length).map_err(|_| DecodeError::InvalidLength {
            opcode: self.opcode,
            offset,
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_read_reports_absolute_offset() {
        let payload = [0x01, 0x02];
        let mut reader = FieldReader::new(&payload, 0x2B2B, 10);
        let err = reader.u32().unwrap_err();
        assert_eq!(
            err,
            DecodeError::TruncatedRecord {
                opcode: 0x2B2B,
                offset: 10,
                needed: 4,
                remaining: 2,
            }
        );
    }

    #[test]
    fn negative_length_prefix_is_rejected() {
        let payload = (-1i16).to_le_bytes();
        let mut reader = FieldReader::new(&payload, 0x3D71, 2);
        assert!(matches!(
            reader.string_i16(),
            Err(DecodeError::InvalidLength { length: -1, offset: 2, .. })
        ));
    }

    #[test]
    fn position_block_reads_all_twenty_bytes() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1.5f32.to_le_bytes());
        payload.extend_from_slice(&(-2.0f32).to_le_bytes());
        payload.extend_from_slice(&3.25f32.to_le_bytes());
        payload.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        payload.extend_from_slice(&300i16.to_le_bytes());
        payload.extend_from_slice(&[0xff, 0x02]);

        let mut reader = FieldReader::new(&payload, 0x766D, 2);
        let pos = reader.position().unwrap();
        assert_eq!(pos.point.x, 1.5);
        assert_eq!(pos.point.y, -2.0);
        assert_eq!(pos.point.z, 3.25);
        assert_eq!(pos.view, [0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(pos.view_limit, 300);
        assert_eq!(pos.dy, -1);
        assert_eq!(pos.dx, 2);
        assert_eq!(reader.consumed(), Position::SIZE);
    }
}
