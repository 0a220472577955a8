//! Frame header parsing.
//!
//! A coded frame carries, in order: filter and probability table
//! segmentation, the channel/segment to table mapping, half-probability
//! flags, filter coefficients, probability tables and finally the
//! arithmetic coded residual payload.

use crate::bits::BitReader;
use crate::error::{ErrorKind, Result};
use crate::filter::MAX_ORDER;

pub const MAX_CHANNELS: usize = 6;
pub const MAXNROF_FSEGS: usize = 4;
pub const MAXNROF_PSEGS: usize = 8;
pub const MIN_FSEG_LEN: u32 = 1024;
pub const MIN_PSEG_LEN: u32 = 32;

const SIZE_CODEDPREDORDER: u32 = 7;
const SIZE_PREDCOEF: u32 = 9;
const SIZE_RICEMETHOD: u32 = 2;
const SIZE_RICEM: u32 = 3;
const AC_BITS: u32 = 8;
const AC_HISBITS: u32 = 6;

/// Linear predictors for Rice coded filter coefficients, by method.
const FILTER_PREDICTORS: [&[i32]; 3] = [&[-8], &[-16, 8], &[-9, -5, 6]];
/// Linear predictors for Rice coded probability table entries, by method.
const PTABLE_PREDICTORS: [&[i32]; 3] = [&[-8], &[-16, 8], &[-24, 24, -8]];

/// Stream wide parameters every frame is parsed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    channels: usize,
    fs44: u32,
}

impl StreamInfo {
    /// `fs44` is the sample rate as a multiple of 44.1kHz (64, 128 or 256).
    pub fn new(channels: usize, fs44: u32) -> Result<Self> {
        if channels == 0 || channels > MAX_CHANNELS {
            exn::bail!(ErrorKind::InvalidStream(format!("unsupported channel count {channels}")));
        }
        if !matches!(fs44, 64 | 128 | 256) {
            exn::bail!(ErrorKind::InvalidStream(format!("unsupported sample rate {fs44}fs")));
        }
        Ok(Self { channels, fs44 })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn fs44(&self) -> u32 {
        self.fs44
    }

    /// Bytes of DSD per channel in one frame (1/75th of a second).
    pub fn frame_len(&self) -> usize {
        588 * self.fs44 as usize / 8
    }

    pub fn bits_per_channel(&self) -> usize {
        self.frame_len() * 8
    }

    /// Size of one decoded, channel interleaved DSD frame.
    pub fn dsd_frame_size(&self) -> usize {
        self.frame_len() * self.channels
    }

    /// Upper bound on both filters and probability tables per frame.
    pub fn max_tables(&self) -> usize {
        2 * self.channels
    }
}

/// How each channel's frame is cut into segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segmentation {
    /// Unit of segment lengths, in bytes.
    pub resolution: u32,
    /// Per channel segment lengths in units of `resolution`. The last
    /// segment of every channel has length 0 and runs to the end of the frame.
    pub lengths: Vec<Vec<u32>>,
}

impl Segmentation {
    /// Expand into a per-bit table index for `channel` using `tables`
    /// (one index per segment).
    fn expand(&self, channel: usize, tables: &[usize], bits: usize, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(bits);
        let lengths = &self.lengths[channel];
        for (segment, &len) in lengths.iter().enumerate() {
            let table = tables[segment] as u8;
            let end = if segment + 1 == lengths.len() {
                bits
            } else {
                (out.len() + (self.resolution * 8 * len) as usize).min(bits)
            };
            out.resize(end, table);
        }
    }
}

/// Which table every segment of every channel uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// `tables[channel][segment]`
    pub tables: Vec<Vec<usize>>,
    /// Number of distinct tables referenced.
    pub count: usize,
}

/// A prediction filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub coefficients: Vec<i16>,
}

impl Filter {
    pub fn order(&self) -> usize {
        self.coefficients.len()
    }
}

/// Header and payload of an arithmetically coded frame.
#[derive(Debug, Clone)]
pub struct CodedFrame {
    pub filter_segments: Segmentation,
    pub ptable_segments: Segmentation,
    pub filter_map: Mapping,
    pub ptable_map: Mapping,
    pub half_prob: Vec<bool>,
    /// Leading bits per channel coded at a fixed 50% probability when
    /// `half_prob` is set.
    pub half_bits: Vec<usize>,
    pub filters: Vec<Filter>,
    /// Probability tables, entries in 1..=128.
    pub ptables: Vec<Vec<u8>>,
    /// Arithmetic coded payload, MSB-first.
    pub adata: Vec<u8>,
    /// Length of the payload in bits.
    pub adata_len: usize,
}

impl CodedFrame {
    /// Per-bit filter index for `channel`.
    pub fn filter_map_for(&self, info: &StreamInfo, channel: usize, out: &mut Vec<u8>) {
        self.filter_segments
            .expand(channel, &self.filter_map.tables[channel], info.bits_per_channel(), out);
    }

    /// Per-bit probability table index for `channel`.
    pub fn ptable_map_for(&self, info: &StreamInfo, channel: usize, out: &mut Vec<u8>) {
        self.ptable_segments
            .expand(channel, &self.ptable_map.tables[channel], info.bits_per_channel(), out);
    }
}

/// A parsed frame.
#[derive(Debug, Clone)]
pub enum Frame<'a> {
    /// Raw DSD, already channel interleaved.
    Uncoded(&'a [u8]),
    Coded(Box<CodedFrame>),
}

/// Smallest `y` such that `x < 2^y`.
fn log2_round_up(x: u32) -> u32 {
    u32::BITS - x.leading_zeros()
}

/// Parse one frame.
pub fn parse<'a>(info: &StreamInfo, data: &'a [u8]) -> Result<Frame<'a>> {
    let mut reader = BitReader::new(data);
    if !reader.read_bool()? {
        // Reserved bit, then zero stuffing up to the byte boundary.
        reader.read(1)?;
        if reader.read(6)? != 0 {
            exn::bail!(ErrorKind::IllegalStuffing);
        }
        let size = info.dsd_frame_size();
        if reader.remaining() < size * 8 {
            exn::bail!(ErrorKind::Eof);
        }
        return Ok(Frame::Uncoded(&data[1..1 + size]));
    }

    let (filter_segments, ptable_segments) = read_segmentation(&mut reader, info)?;
    let (filter_map, ptable_map) = read_mapping(&mut reader, info, &filter_segments, &ptable_segments)?;
    let half_prob = (0..info.channels())
        .map(|_| reader.read_bool())
        .collect::<Result<Vec<_>>>()?;
    let filters = (0..filter_map.count)
        .map(|_| read_filter(&mut reader))
        .collect::<Result<Vec<_>>>()?;
    let half_bits = filter_map.tables.iter().map(|segments| filters[segments[0]].order()).collect();
    let ptables = (0..ptable_map.count)
        .map(|_| read_ptable(&mut reader))
        .collect::<Result<Vec<_>>>()?;

    let adata_len = reader.remaining();
    let adata = reader.take_bits(adata_len)?;
    if adata_len > 0 && adata[0] & 0x80 != 0 {
        exn::bail!(ErrorKind::ArithmeticData);
    }

    Ok(Frame::Coded(Box::new(CodedFrame {
        filter_segments,
        ptable_segments,
        filter_map,
        ptable_map,
        half_prob,
        half_bits,
        filters,
        ptables,
        adata,
        adata_len,
    })))
}

fn read_segmentation(reader: &mut BitReader<'_>, info: &StreamInfo) -> Result<(Segmentation, Segmentation)> {
    let ptable_same_as_filter = reader.read_bool()?;
    let filter = read_segments(reader, info, MAXNROF_FSEGS, MIN_FSEG_LEN)?;
    let ptable = if ptable_same_as_filter {
        for lengths in &filter.lengths {
            if lengths.len() > MAXNROF_PSEGS {
                exn::bail!(ErrorKind::Segmentation("too many probability table segments".to_string()));
            }
            if lengths.iter().any(|&len| len != 0 && filter.resolution * 8 * len < MIN_PSEG_LEN) {
                exn::bail!(ErrorKind::Segmentation("probability table segment too short".to_string()));
            }
        }
        filter.clone()
    } else {
        read_segments(reader, info, MAXNROF_PSEGS, MIN_PSEG_LEN)?
    };
    Ok((filter, ptable))
}

struct SegmentCursor {
    max_seg_size: u32,
    defined_bits: u64,
}

fn read_segments(reader: &mut BitReader<'_>, info: &StreamInfo, max_segs: usize, min_seg_len: u32) -> Result<Segmentation> {
    let frame_len = info.frame_len() as u32;
    let max_resolution = frame_len - min_seg_len / 8;
    let mut resolution: Option<u32> = None;

    let mut read_one = |reader: &mut BitReader<'_>, cursor: &mut SegmentCursor| -> Result<u32> {
        let resolution = match resolution {
            Some(resolution) => resolution,
            None => {
                let value = reader.read(log2_round_up(max_resolution))?;
                if value == 0 || value > max_resolution {
                    exn::bail!(ErrorKind::Segmentation(format!("resolution {value} out of range")));
                }
                resolution = Some(value);
                value
            },
        };
        let len = reader.read(log2_round_up(cursor.max_seg_size / resolution))?;
        let bits = u64::from(resolution) * 8 * u64::from(len);
        let min_seg_len = u64::from(min_seg_len);
        if bits < min_seg_len || bits > u64::from(frame_len) * 8 - cursor.defined_bits - min_seg_len {
            exn::bail!(ErrorKind::Segmentation(format!("segment length {len} out of range")));
        }
        cursor.defined_bits += bits;
        cursor.max_seg_size -= resolution * len;
        Ok(len)
    };
    let fresh = || SegmentCursor {
        max_seg_size: max_resolution,
        defined_bits: 0,
    };

    let mut lengths = Vec::with_capacity(info.channels());
    if reader.read_bool()? {
        let mut cursor = fresh();
        let mut segments = Vec::new();
        while !reader.read_bool()? {
            if segments.len() >= max_segs {
                exn::bail!(ErrorKind::Segmentation("too many segments".to_string()));
            }
            segments.push(read_one(reader, &mut cursor)?);
        }
        segments.push(0);
        lengths.resize(info.channels(), segments);
    } else {
        for _ in 0..info.channels() {
            let mut cursor = fresh();
            let mut segments = Vec::new();
            loop {
                if segments.len() >= max_segs {
                    exn::bail!(ErrorKind::Segmentation("too many segments".to_string()));
                }
                if reader.read_bool()? {
                    break;
                }
                segments.push(read_one(reader, &mut cursor)?);
            }
            segments.push(0);
            lengths.push(segments);
        }
    }

    Ok(Segmentation {
        resolution: resolution.unwrap_or(1),
        lengths,
    })
}

fn read_mapping(
    reader: &mut BitReader<'_>,
    info: &StreamInfo,
    filter_segments: &Segmentation,
    ptable_segments: &Segmentation,
) -> Result<(Mapping, Mapping)> {
    let ptable_same_as_filter = reader.read_bool()?;
    let filter = read_table_mapping(reader, info, filter_segments)?;
    let ptable = if ptable_same_as_filter {
        let matching = filter_segments
            .lengths
            .iter()
            .zip(&ptable_segments.lengths)
            .all(|(f, p)| f.len() == p.len());
        if !matching {
            exn::bail!(ErrorKind::Mapping(
                "filter and probability table segment counts differ".to_string()
            ));
        }
        filter.clone()
    } else {
        read_table_mapping(reader, info, ptable_segments)?
    };
    Ok((filter, ptable))
}

fn read_table_mapping(reader: &mut BitReader<'_>, info: &StreamInfo, segments: &Segmentation) -> Result<Mapping> {
    let mut count = 1usize;
    let mut read_index = |reader: &mut BitReader<'_>| -> Result<usize> {
        let index = reader.read(log2_round_up(count as u32))? as usize;
        if index == count {
            count += 1;
        } else if index > count {
            exn::bail!(ErrorKind::Mapping(format!("table {index} referenced before table {count}")));
        }
        Ok(index)
    };

    let mut tables: Vec<Vec<usize>> = Vec::with_capacity(info.channels());
    if reader.read_bool()? {
        let segment_count = segments.lengths[0].len();
        let mut first = vec![0usize];
        for _ in 1..segment_count {
            first.push(read_index(reader)?);
        }
        if segments.lengths.iter().any(|lengths| lengths.len() != segment_count) {
            exn::bail!(ErrorKind::Mapping(
                "segment counts differ between channels".to_string()
            ));
        }
        tables.resize(info.channels(), first);
    } else {
        for (channel, lengths) in segments.lengths.iter().enumerate() {
            let mut mapped = Vec::with_capacity(lengths.len());
            for segment in 0..lengths.len() {
                if channel == 0 && segment == 0 {
                    mapped.push(0);
                } else {
                    mapped.push(read_index(reader)?);
                }
            }
            tables.push(mapped);
        }
    }

    if count > info.max_tables() {
        exn::bail!(ErrorKind::Mapping(format!("{count} tables exceed the maximum of {}", info.max_tables())));
    }
    Ok(Mapping { tables, count })
}

fn read_rice(reader: &mut BitReader<'_>, m: u32) -> Result<i32> {
    let mut run = 0i32;
    while !reader.read_bool()? {
        run += 1;
    }
    let lsbs = reader.read(m)? as i32;
    let value = (run << m) + lsbs;
    if value != 0 && reader.read_bool()? {
        return Ok(-value);
    }
    Ok(value)
}

/// Reconstruct one entry from its Rice residual and the predictor
/// applied to the previous entries.
fn predict_residual(residual: i32, predictor: &[i32], previous: &[i32]) -> i32 {
    let n = previous.len();
    let x: i32 = predictor
        .iter()
        .enumerate()
        .map(|(tap, &coef)| coef * previous[n - tap - 1])
        .sum();
    if x >= 0 { residual - (x + 4) / 8 } else { residual + (-x + 3) / 8 }
}

fn read_filter(reader: &mut BitReader<'_>) -> Result<Filter> {
    let order = reader.read(SIZE_CODEDPREDORDER)? as usize + 1;
    debug_assert!(order <= MAX_ORDER);
    let mut coefficients = Vec::with_capacity(order);
    if !reader.read_bool()? {
        for _ in 0..order {
            coefficients.push(reader.read_signed(SIZE_PREDCOEF)?);
        }
    } else {
        let method = reader.read(SIZE_RICEMETHOD)? as usize;
        let Some(predictor) = FILTER_PREDICTORS.get(method) else {
            exn::bail!(ErrorKind::Coefficient(format!("unknown coding method {method}")));
        };
        if predictor.len() >= order {
            exn::bail!(ErrorKind::Coefficient(format!(
                "coding method {method} needs more than {order} coefficients"
            )));
        }
        for _ in 0..predictor.len() {
            coefficients.push(reader.read_signed(SIZE_PREDCOEF)?);
        }
        let m = reader.read(SIZE_RICEM)?;
        let limit = 1 << (SIZE_PREDCOEF - 1);
        for _ in predictor.len()..order {
            let residual = read_rice(reader, m)?;
            let coef = predict_residual(residual, predictor, &coefficients);
            if !(-limit..limit).contains(&coef) {
                exn::bail!(ErrorKind::Coefficient(format!("coefficient {coef} out of range")));
            }
            coefficients.push(coef);
        }
    }
    Ok(Filter {
        coefficients: coefficients.into_iter().map(|c| c as i16).collect(),
    })
}

fn read_ptable(reader: &mut BitReader<'_>) -> Result<Vec<u8>> {
    let len = reader.read(AC_HISBITS)? as usize + 1;
    if len == 1 {
        return Ok(vec![128]);
    }
    let mut entries: Vec<i32> = Vec::with_capacity(len);
    if !reader.read_bool()? {
        for _ in 0..len {
            entries.push(reader.read(AC_BITS - 1)? as i32 + 1);
        }
    } else {
        let method = reader.read(SIZE_RICEMETHOD)? as usize;
        let Some(predictor) = PTABLE_PREDICTORS.get(method) else {
            exn::bail!(ErrorKind::ProbabilityTable(format!("unknown coding method {method}")));
        };
        if predictor.len() >= len {
            exn::bail!(ErrorKind::ProbabilityTable(format!(
                "coding method {method} needs more than {len} entries"
            )));
        }
        for _ in 0..predictor.len() {
            entries.push(reader.read(AC_BITS - 1)? as i32 + 1);
        }
        let m = reader.read(SIZE_RICEM)?;
        for _ in predictor.len()..len {
            let residual = read_rice(reader, m)?;
            let entry = predict_residual(residual, predictor, &entries);
            if !(1..=1 << (AC_BITS - 1)).contains(&entry) {
                exn::bail!(ErrorKind::ProbabilityTable(format!("entry {entry} out of range")));
            }
            entries.push(entry);
        }
    }
    Ok(entries.into_iter().map(|e| e as u8).collect())
}
