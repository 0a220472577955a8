//! MSB-first bit reader over a single DST frame.

use crate::error::{ErrorKind, Result};

/// Reads bits most-significant first from a borrowed frame buffer.
///
/// Reading past the end of the buffer fails with
/// [`Eof`](crate::error::ErrorKind::Eof); nothing is zero padded here (the
/// arithmetic decoder does its own padding).
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Number of bits consumed so far.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Total number of bits in the buffer.
    pub fn len_bits(&self) -> usize {
        self.data.len() * 8
    }

    pub fn remaining(&self) -> usize {
        self.len_bits() - self.position
    }

    fn ensure(&self, bits: usize) -> Result<()> {
        if self.position + bits > self.len_bits() {
            exn::bail!(ErrorKind::Eof);
        }
        Ok(())
    }

    #[inline]
    fn next_bit(&mut self) -> u32 {
        let byte = self.data[self.position >> 3];
        let bit = (byte >> (7 - (self.position & 7))) & 1;
        self.position += 1;
        u32::from(bit)
    }

    /// Read `bits` (at most 32) as an unsigned value.
    pub fn read(&mut self, bits: u32) -> Result<u32> {
        debug_assert!(bits <= 32, "cannot read more than 32 bits at once");
        self.ensure(bits as usize)?;
        let mut value = 0u32;
        for _ in 0..bits {
            value = (value << 1) | self.next_bit();
        }
        Ok(value)
    }

    /// Read `bits` as a two's complement signed value.
    pub fn read_signed(&mut self, bits: u32) -> Result<i32> {
        let raw = i64::from(self.read(bits)?);
        if bits == 0 {
            return Ok(0);
        }
        let value = if raw >= 1 << (bits - 1) { raw - (1 << bits) } else { raw };
        Ok(value as i32)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read(1)? == 1)
    }

    /// Fill `out` with whole bytes, eight bits each.
    pub fn read_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        self.ensure(out.len() * 8)?;
        if self.position & 7 == 0 {
            let start = self.position >> 3;
            out.copy_from_slice(&self.data[start..start + out.len()]);
            self.position += out.len() * 8;
            return Ok(());
        }
        for byte in out.iter_mut() {
            *byte = self.read(8)? as u8;
        }
        Ok(())
    }

    /// Take the next `bits` bits, packed MSB-first into bytes (the final
    /// byte is zero padded).
    pub fn take_bits(&mut self, bits: usize) -> Result<Vec<u8>> {
        self.ensure(bits)?;
        let mut out = vec![0u8; bits.div_ceil(8)];
        let whole = bits / 8;
        self.read_bytes(&mut out[..whole])?;
        let tail = (bits % 8) as u32;
        if tail > 0 {
            out[whole] = (self.read(tail)? << (8 - tail)) as u8;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1)]
    #[case(3, 0b101)]
    #[case(8, 0b1010_1100)]
    #[case(12, 0b1010_1100_0101)]
    fn test_read_msb_first(#[case] bits: u32, #[case] expected: u32) {
        let data = [0b1010_1100, 0b0101_0011];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read(bits).unwrap(), expected);
        assert_eq!(reader.position(), bits as usize);
    }

    #[rstest]
    #[case(0b0_1111_1111, 255)]
    #[case(0b1_0000_0000, -256)]
    #[case(0b1_1111_1111, -1)]
    #[case(0b0_0000_0000, 0)]
    fn test_read_signed_nine_bits(#[case] raw: u16, #[case] expected: i32) {
        // Left align the nine bits in two bytes.
        let aligned = raw << 7;
        let data = aligned.to_be_bytes();
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_signed(9).unwrap(), expected);
    }

    #[test]
    fn test_eof() {
        let data = [0xFF];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read(7).unwrap(), 0x7F);
        assert_eq!(reader.read(1).unwrap(), 1);
        let err = reader.read(1).unwrap_err();
        assert_eq!(*err, ErrorKind::Eof);
    }

    #[test]
    fn test_read_bytes_unaligned() {
        let data = [0b0000_0001, 0b1000_0000];
        let mut reader = BitReader::new(&data);
        reader.read(1).unwrap();
        let mut out = [0u8; 1];
        reader.read_bytes(&mut out).unwrap();
        assert_eq!(out, [0b0000_0011]);
    }

    #[test]
    fn test_take_bits_pads_tail() {
        let data = [0b1100_1010, 0b1110_0000];
        let mut reader = BitReader::new(&data);
        reader.read(2).unwrap();
        let taken = reader.take_bits(11).unwrap();
        assert_eq!(taken, vec![0b0010_1011, 0b1000_0000]);
        assert_eq!(reader.remaining(), 3);
    }
}
