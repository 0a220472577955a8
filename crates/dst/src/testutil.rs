//! Bitstream writers used to build fixture frames.

use crate::ac::{ABITS, HALF, ONE, PBITS, ptable_index};
use crate::decoder::reverse7;
use crate::filter::FilterTables;
use crate::header::StreamInfo;

pub struct XorShift(u32);

impl XorShift {
    pub fn new(seed: u32) -> Self {
        Self(seed.wrapping_mul(2_654_435_761).max(1))
    }

    pub fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }
}

/// MSB-first bit writer.
#[derive(Default)]
pub struct BitWriter {
    bits: Vec<u8>,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bit(&mut self, bit: bool) {
        self.bits.push(u8::from(bit));
    }

    pub fn write(&mut self, value: u32, bits: u32) {
        for n in (0..bits).rev() {
            self.bits.push(((value >> n) & 1) as u8);
        }
    }

    pub fn signed(&mut self, value: i32, bits: u32) {
        self.write((value as u32) & ((1 << bits) - 1), bits);
    }

    pub fn extend(&mut self, bits: &[u8]) {
        self.bits.extend_from_slice(bits);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        pack(&self.bits)
    }
}

fn pack(bits: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (n, &bit) in bits.iter().enumerate() {
        bytes[n >> 3] |= bit << (7 - (n & 7));
    }
    bytes
}

/// Arithmetic encoder mirroring [`ArithmeticDecoder`](crate::ac::ArithmeticDecoder).
pub struct ArithmeticEncoder {
    a: u32,
    c: u32,
    bits: Vec<u8>,
}

impl ArithmeticEncoder {
    pub fn new() -> Self {
        // Bit 0 only ever receives a carry out of a full interval, which
        // can't happen, so it stays zero.
        Self {
            a: ONE - 1,
            c: 0,
            bits: vec![0],
        }
    }

    pub fn encode(&mut self, bit: u32, p: u32) {
        let ap = ((self.a >> PBITS) | ((self.a >> (PBITS - 1)) & 1)) * p;
        let h = self.a - ap;
        if bit == 0 {
            self.c += h;
            self.a = ap;
        } else {
            self.a = h;
        }
        if self.c & ONE != 0 {
            let mut n = self.bits.len() - 1;
            while self.bits[n] == 1 {
                self.bits[n] = 0;
                n -= 1;
            }
            self.bits[n] = 1;
            self.c &= ONE - 1;
        }
        while self.a < HALF {
            self.a <<= 1;
            self.bits.push(((self.c >> (ABITS - 1)) & 1) as u8);
            self.c = (self.c << 1) & (ONE - 1);
        }
    }

    pub fn into_bits(mut self) -> Vec<u8> {
        for _ in 0..ABITS {
            self.bits.push(((self.c >> (ABITS - 1)) & 1) as u8);
            self.c = (self.c << 1) & (ONE - 1);
        }
        self.bits
    }

    pub fn finish(self) -> (Vec<u8>, usize) {
        let bits = self.into_bits();
        (pack(&bits), bits.len())
    }
}

/// An uncoded frame carrying `payload` verbatim.
pub fn uncoded_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(0);
    frame.extend_from_slice(payload);
    frame
}

fn log2_round_up(x: u32) -> u32 {
    u32::BITS - x.leading_zeros()
}

/// Parameters of a coded fixture frame. Segmentation is shared by all
/// channels and by filters and probability tables; the mapping is written
/// per channel and shared by filters and probability tables.
pub struct FrameSpec {
    pub resolution: u32,
    /// Explicit segment lengths; a final segment runs to the end of the frame.
    pub segments: Vec<u32>,
    /// `mapping[channel][segment]`, tables numbered in order of first use.
    pub mapping: Vec<Vec<usize>>,
    pub half_prob: Vec<bool>,
    pub filters: Vec<Vec<i16>>,
    pub ptables: Vec<Vec<u8>>,
}

impl FrameSpec {
    /// Build a coded frame that decodes to `dsd`.
    pub fn encode(&self, info: &StreamInfo, dsd: &[u8]) -> Vec<u8> {
        let channels = info.channels();
        let mut writer = BitWriter::new();
        writer.bit(true); // coded

        writer.bit(true); // ptable segmentation as filters
        writer.bit(true); // same for all channels
        let frame_len = info.frame_len() as u32;
        let mut max_seg_size = frame_len - 1024 / 8;
        for (n, &len) in self.segments.iter().enumerate() {
            writer.bit(false);
            if n == 0 {
                writer.write(self.resolution, log2_round_up(frame_len - 1024 / 8));
            }
            writer.write(len, log2_round_up(max_seg_size / self.resolution));
            max_seg_size -= self.resolution * len;
        }
        writer.bit(true);

        writer.bit(true); // ptable mapping as filters
        writer.bit(false); // per channel
        let mut count = 1u32;
        for (channel, tables) in self.mapping.iter().enumerate() {
            for (segment, &table) in tables.iter().enumerate() {
                if channel == 0 && segment == 0 {
                    continue;
                }
                writer.write(table as u32, log2_round_up(count));
                if table as u32 == count {
                    count += 1;
                }
            }
        }
        for &half in &self.half_prob {
            writer.bit(half);
        }

        for filter in &self.filters {
            writer.write(filter.len() as u32 - 1, 7);
            writer.bit(false);
            for &coef in filter {
                writer.signed(i32::from(coef), 9);
            }
        }
        for ptable in &self.ptables {
            writer.write(ptable.len() as u32 - 1, 6);
            if ptable.len() > 1 {
                writer.bit(false);
                for &entry in ptable {
                    writer.write(u32::from(entry) - 1, 7);
                }
            }
        }

        // Per-bit segment lookup.
        let bits_per_channel = info.bits_per_channel();
        let segment_of = |bit: usize| -> usize {
            let mut start = 0usize;
            for (n, &len) in self.segments.iter().enumerate() {
                start += (self.resolution * 8 * len) as usize;
                if bit < start {
                    return n;
                }
            }
            self.segments.len()
        };
        let tables: Vec<FilterTables> = self.filters.iter().map(|f| FilterTables::new(f)).collect();
        let mut status = vec![u128::from_le_bytes([0xAA; 16]); channels];
        let mut encoder = ArithmeticEncoder::new();
        encoder.encode(0, reverse7(self.filters[0][0]));
        for bit in 0..bits_per_channel {
            let segment = segment_of(bit);
            for channel in 0..channels {
                let table = self.mapping[channel][segment];
                let predict = tables[table].predict(status[channel]);
                let half_bits = self.filters[self.mapping[channel][0]].len();
                let p = if self.half_prob[channel] && bit < half_bits {
                    128
                } else {
                    let ptable = &self.ptables[table];
                    u32::from(ptable[ptable_index(predict, ptable.len())])
                };
                let value = u32::from((dsd[(bit >> 3) * channels + channel] >> (7 - (bit & 7))) & 1);
                let residual = value ^ u32::from(predict as u16 >> 15);
                encoder.encode(residual, p);
                status[channel] = (status[channel] << 1) | u128::from(value);
            }
        }
        writer.extend(&encoder.into_bits());
        writer.into_bytes()
    }
}
