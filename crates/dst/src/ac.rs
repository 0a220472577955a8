//! Binary arithmetic decoder.
//!
//! Fixed-point with 8 probability bits and 4 guard bits. The arithmetic here
//! is part of the bitstream definition: any deviation decodes garbage.

/// Probability precision in bits.
pub const PBITS: u32 = 8;
/// Guard bits on top of the probability precision.
pub const NBITS: u32 = 4;
/// Working precision of the interval registers.
pub const ABITS: u32 = PBITS + NBITS;
pub const ONE: u32 = 1 << ABITS;
pub const HALF: u32 = 1 << (ABITS - 1);
/// Right shift applied to |prediction| before indexing a probability table.
pub const AC_QSTEP: u32 = 3;

/// Decodes residual bits from a frame's arithmetic coded payload.
///
/// `A` is the interval width and `C` the offset of the code value inside
/// the interval. Bit 0 of the payload is never consumed; reads past the end
/// of the payload return zeros.
#[derive(Debug, Clone)]
pub struct ArithmeticDecoder<'a> {
    data: &'a [u8],
    len: usize,
    a: u32,
    c: u32,
    cursor: usize,
}

impl<'a> ArithmeticDecoder<'a> {
    /// Initialise over `len` bits of `data` and load the first code bits.
    pub fn new(data: &'a [u8], len: usize) -> Self {
        let mut decoder = Self {
            data,
            len: len.min(data.len() * 8),
            a: ONE - 1,
            c: 0,
            cursor: 1,
        };
        for _ in 1..=ABITS {
            decoder.c = (decoder.c << 1) | decoder.next_bit();
        }
        decoder
    }

    #[inline]
    fn next_bit(&mut self) -> u32 {
        let position = self.cursor;
        self.cursor += 1;
        if position < self.len {
            u32::from((self.data[position >> 3] >> (7 - (position & 7))) & 1)
        } else {
            0
        }
    }

    /// Decode one bit, where `p` (1..=128) is the probability of a zero
    /// scaled to 8 bits.
    #[inline]
    pub fn decode(&mut self, p: u32) -> u32 {
        let ap = ((self.a >> PBITS) | ((self.a >> (PBITS - 1)) & 1)) * p;
        let h = self.a - ap;
        let bit = if self.c >= h {
            self.c -= h;
            self.a = ap;
            0
        } else {
            self.a = h;
            1
        };
        while self.a < HALF {
            self.a <<= 1;
            self.c = (self.c << 1) | self.next_bit();
        }
        bit
    }

    /// Whether the decoder consumed the payload up to its synchronisation
    /// tail. `false` means the frame is corrupt.
    pub fn flush(&self) -> bool {
        self.cursor + 7 >= self.len
    }

    /// Interval width register.
    pub fn a(&self) -> u32 {
        self.a
    }

    /// Code value register.
    pub fn c(&self) -> u32 {
        self.c
    }

    /// Index of the next payload bit to be pulled in.
    pub fn cursor(&self) -> usize {
        self.cursor
    }
}

/// Map a prediction onto a probability table of `len` entries.
#[inline]
pub fn ptable_index(predict: i16, len: usize) -> usize {
    let index = (i32::from(predict).unsigned_abs() >> AC_QSTEP) as usize;
    index.min(len - 1)
}
