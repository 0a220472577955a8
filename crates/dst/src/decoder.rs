//! Single threaded frame decoder.

use crate::ac::{ArithmeticDecoder, ptable_index};
use crate::error::{ErrorKind, Result};
use crate::filter::FilterTables;
use crate::header::{self, CodedFrame, Frame, StreamInfo};

/// Bit history every channel starts a frame with.
const INITIAL_STATUS: u128 = u128::from_le_bytes([0xAA; 16]);

/// Probability for the discarded first symbol of a frame: the 7 LSBs of
/// the first coefficient of the first filter, bit reversed, plus one.
pub(crate) fn reverse7(coefficient: i16) -> u32 {
    u32::from(((coefficient as u8) & 0x7F).reverse_bits() >> 1) + 1
}

/// Decodes DST frames of one stream into channel interleaved DSD.
///
/// Holds scratch buffers between frames, so reuse an instance per stream.
#[derive(Debug)]
pub struct DstDecoder {
    info: StreamInfo,
    frames: u64,
    filter_bits: Vec<Vec<u8>>,
    ptable_bits: Vec<Vec<u8>>,
}

impl DstDecoder {
    /// `fs44` is the sample rate as a multiple of 44.1kHz (64, 128 or 256).
    pub fn new(channels: usize, fs44: u32) -> Result<Self> {
        let info = StreamInfo::new(channels, fs44)?;
        Ok(Self {
            info,
            frames: 0,
            filter_bits: vec![Vec::new(); channels],
            ptable_bits: vec![Vec::new(); channels],
        })
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Bytes written to `out` by every successful [`decode`](Self::decode).
    pub fn dsd_frame_size(&self) -> usize {
        self.info.dsd_frame_size()
    }

    /// Number of frames decoded successfully so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Decode one frame into `out`.
    ///
    /// On error the contents of `out` are unspecified and must be discarded.
    pub fn decode(&mut self, frame: &[u8], out: &mut [u8]) -> Result<()> {
        let size = self.info.dsd_frame_size();
        if out.len() < size {
            exn::bail!(ErrorKind::InvalidStream(format!(
                "output buffer of {} bytes cannot hold a {size} byte frame",
                out.len()
            )));
        }
        match header::parse(&self.info, frame)? {
            Frame::Uncoded(payload) => out[..size].copy_from_slice(payload),
            Frame::Coded(coded) => self.decode_coded(&coded, &mut out[..size])?,
        }
        self.frames += 1;
        Ok(())
    }

    fn decode_coded(&mut self, frame: &CodedFrame, out: &mut [u8]) -> Result<()> {
        let channels = self.info.channels();
        let bits = self.info.bits_per_channel();
        for channel in 0..channels {
            frame.filter_map_for(&self.info, channel, &mut self.filter_bits[channel]);
            frame.ptable_map_for(&self.info, channel, &mut self.ptable_bits[channel]);
        }
        let tables: Vec<FilterTables> = frame
            .filters
            .iter()
            .map(|filter| FilterTables::new(&filter.coefficients))
            .collect();
        let mut status = vec![INITIAL_STATUS; channels];

        let mut ac = ArithmeticDecoder::new(&frame.adata, frame.adata_len);
        ac.decode(reverse7(frame.filters[0].coefficients[0]));

        out.fill(0);
        for bit in 0..bits {
            let row = (bit >> 3) * channels;
            let shift = 7 - (bit & 7);
            for channel in 0..channels {
                let predict = tables[usize::from(self.filter_bits[channel][bit])].predict(status[channel]);
                let p = if frame.half_prob[channel] && bit < frame.half_bits[channel] {
                    128
                } else {
                    let ptable = &frame.ptables[usize::from(self.ptable_bits[channel][bit])];
                    u32::from(ptable[ptable_index(predict, ptable.len())])
                };
                let residual = ac.decode(p);
                let value = (u32::from(predict as u16 >> 15) ^ residual) & 1;
                out[row + channel] |= (value as u8) << shift;
                status[channel] = (status[channel] << 1) | u128::from(value);
            }
        }

        if !ac.flush() {
            tracing::debug!(frame = self.frames + 1, "Arithmetic decoder did not end on its terminal pattern");
            exn::bail!(ErrorKind::Flush);
        }
        Ok(())
    }
}
