use crate::errors::{Error, Result};
use byteorder::ReadBytesExt;
use std::io::{Cursor, Read, Seek, SeekFrom};

/// All-ones sentinel for every width 0..=64, precomputed once.
const MISSING_VALUES: [u64; 65] = {
    let mut table = [0u64; 65];
    let mut width = 1;
    while width < 64 {
        table[width] = (1u64 << width) - 1;
        width += 1;
    }
    table[64] = u64::MAX;
    table
};

/// The all-ones "missing" sentinel for a field of the given bit width.
#[inline]
pub fn missing_value(width: u32) -> u64 {
    MISSING_VALUES[width.min(64) as usize]
}

/// Reads unsigned integers of 1-64 bits from a byte source, MSB-first within
/// each byte, starting at an arbitrary bit offset from a fixed origin. Knows
/// nothing about BUFR.
pub struct BitReader<R> {
    src: R,
    origin: u64,
    bit_pos: u64,
    cur: u8,
    cur_index: u64,
    cur_valid: bool,
}

impl<'a> BitReader<Cursor<&'a [u8]>> {
    pub fn from_slice(data: &'a [u8]) -> Self {
        BitReader::new(Cursor::new(data), 0)
    }
}

impl<R: Read + Seek> BitReader<R> {
    /// `origin` is the byte offset in `src` that bit offset 0 refers to.
    pub fn new(src: R, origin: u64) -> Self {
        BitReader {
            src,
            origin,
            bit_pos: 0,
            cur: 0,
            cur_index: 0,
            cur_valid: false,
        }
    }

    /// Bits consumed so far, relative to the origin.
    pub fn bit_pos(&self) -> u64 {
        self.bit_pos
    }

    /// Reposition to an absolute bit offset. The current byte is dropped and
    /// re-fetched on the next read.
    pub fn set_bit_offset(&mut self, bit: u64) {
        self.bit_pos = bit;
        self.cur_valid = false;
    }

    /// Consume `width` bits (0-64) and return them right-justified.
    pub fn read_bits(&mut self, width: u32) -> Result<u64> {
        if width == 0 {
            return Ok(0);
        }
        if width > 64 {
            return Err(Error::Malformed(format!(
                "bit read width {} exceeds 64",
                width
            )));
        }

        let mut out = 0u64;
        let mut remaining = width;
        while remaining > 0 {
            let byte_index = self.bit_pos / 8;
            let bit_in_byte = (self.bit_pos % 8) as u32;

            if !self.cur_valid || byte_index != self.cur_index {
                self.src.seek(SeekFrom::Start(self.origin + byte_index))?;
                self.cur = self.src.read_u8()?;
                self.cur_index = byte_index;
                self.cur_valid = true;
            }

            let avail = 8 - bit_in_byte;
            let take = remaining.min(avail);
            let shift = avail - take;
            let mask = ((1u16 << take) - 1) as u8;
            let bits = (self.cur >> shift) & mask;

            out = (out << take) | bits as u64;
            self.bit_pos += take as u64;
            remaining -= take;
        }
        Ok(out)
    }

    /// Read `nbytes` consecutive 8-bit values.
    pub fn read_chars(&mut self, nbytes: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(nbytes);
        for _ in 0..nbytes {
            bytes.push(self.read_bits(8)? as u8);
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_values() {
        assert_eq!(missing_value(0), 0);
        assert_eq!(missing_value(1), 1);
        assert_eq!(missing_value(7), 127);
        assert_eq!(missing_value(16), 0xFFFF);
        assert_eq!(missing_value(64), u64::MAX);
    }

    #[test]
    fn test_read_within_byte() {
        let data = [0b1011_0110];
        let mut r = BitReader::from_slice(&data);
        assert_eq!(r.read_bits(3).unwrap(), 0b101);
        assert_eq!(r.read_bits(5).unwrap(), 0b10110);
        assert_eq!(r.bit_pos(), 8);
    }

    #[test]
    fn test_read_across_bytes() {
        let data = [0b0000_0110, 0b0000_0101, 0b0000_0000];
        let mut r = BitReader::from_slice(&data);
        assert_eq!(r.read_bits(7).unwrap(), 3);
        assert_eq!(r.read_bits(10).unwrap(), 10);
        assert_eq!(r.bit_pos(), 17);
    }

    #[test]
    fn test_read_64_bits() {
        let data = [0xFF; 8];
        let mut r = BitReader::from_slice(&data);
        assert_eq!(r.read_bits(64).unwrap(), u64::MAX);
    }

    #[test]
    fn test_reposition() {
        let data = [0xAB, 0xCD];
        let mut r = BitReader::from_slice(&data);
        assert_eq!(r.read_bits(8).unwrap(), 0xAB);
        r.set_bit_offset(4);
        assert_eq!(r.read_bits(8).unwrap(), 0xBC);
        r.set_bit_offset(0);
        assert_eq!(r.read_bits(16).unwrap(), 0xABCD);
    }

    #[test]
    fn test_exhausted_source() {
        let data = [0xFF];
        let mut r = BitReader::from_slice(&data);
        assert_eq!(r.read_bits(8).unwrap(), 0xFF);
        assert!(matches!(r.read_bits(1), Err(Error::Io(_))));
    }

    #[test]
    fn test_width_over_64_rejected() {
        let data = [0u8; 16];
        let mut r = BitReader::from_slice(&data);
        assert!(matches!(r.read_bits(65), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_read_chars() {
        let data = [0x0A, 0x42, 0x43];
        let mut r = BitReader::from_slice(&data);
        r.set_bit_offset(8);
        assert_eq!(r.read_chars(2).unwrap(), vec![0x42, 0x43]);
    }
}
