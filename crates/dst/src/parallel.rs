//! Pipelined multi-threaded decoding.
//!
//! Frames are handed round-robin to a fixed ring of slots, each backed by a
//! worker thread with its own [`DstDecoder`]. A slot holds at most one frame
//! in flight. Submitting a frame returns the oldest in-flight result, so
//! output trails input by one rotation of the ring and comes back in
//! submission order.

use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::{self, JoinHandle};

use exn::ResultExt;
use lark_config::DstConfig;

use crate::decoder::DstDecoder;
use crate::error::{ErrorKind, Result};

/// Byte substituted for every sample of a frame that failed to decode.
pub const SILENCE: u8 = 0xAA;

struct Slot {
    work: Option<SyncSender<Vec<u8>>>,
    results: Receiver<Vec<u8>>,
    thread: Option<JoinHandle<()>>,
    in_flight: bool,
}

/// A ring of DST decoders running on their own threads.
pub struct ParallelDecoder {
    slots: Vec<Slot>,
    current: usize,
    dsd_frame_size: usize,
}

impl ParallelDecoder {
    /// Spawn `slots` worker threads for a stream of `channels` at `fs44`.
    pub fn new(channels: usize, fs44: u32, slots: usize) -> Result<Self> {
        if slots == 0 {
            exn::bail!(ErrorKind::InvalidStream("at least one decoder slot is required".to_string()));
        }
        let mut ring = Vec::with_capacity(slots);
        let mut dsd_frame_size = 0;
        for n in 0..slots {
            let decoder = DstDecoder::new(channels, fs44)?;
            dsd_frame_size = decoder.dsd_frame_size();
            let (work, frames) = sync_channel::<Vec<u8>>(1);
            let (done, results) = sync_channel::<Vec<u8>>(1);
            let thread = thread::Builder::new()
                .name(format!("dst-decoder-{n}"))
                .spawn(move || run_slot(decoder, frames, done))
                .or_raise(|| ErrorKind::InvalidStream(format!("failed to spawn decoder thread {n}")))?;
            ring.push(Slot {
                work: Some(work),
                results,
                thread: Some(thread),
                in_flight: false,
            });
        }
        tracing::debug!(slots, channels, fs44, "Started parallel DST decoder");
        Ok(Self {
            slots: ring,
            current: 0,
            dsd_frame_size,
        })
    }

    /// Like [`new`](Self::new), with as many slots as `config` asks for.
    pub fn from_config(channels: usize, fs44: u32, config: &DstConfig) -> Result<Self> {
        Self::new(channels, fs44, config.threads)
    }

    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    pub fn dsd_frame_size(&self) -> usize {
        self.dsd_frame_size
    }

    /// Submit `frame` and collect the result of the frame submitted one
    /// rotation earlier, if any.
    ///
    /// An empty frame submits nothing; feed empty frames to drain the ring
    /// at end of stream. Frames that fail to decode come back as silence.
    pub fn decode(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let slot = &mut self.slots[self.current];
        if frame.is_empty() {
            slot.in_flight = false;
        } else {
            if let Some(work) = &slot.work
                && work.send(frame.to_vec()).is_err()
            {
                tracing::error!(slot = self.current, "DST decoder thread is gone");
            }
            slot.in_flight = true;
        }

        self.current = (self.current + 1) % self.slots.len();
        let slot = &mut self.slots[self.current];
        if !slot.in_flight {
            return None;
        }
        slot.in_flight = false;
        Some(slot.results.recv().unwrap_or_else(|_| vec![SILENCE; self.dsd_frame_size]))
    }

    /// Collect every frame still in flight, in submission order.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        (0..self.slots.len()).filter_map(|_| self.decode(&[])).collect()
    }

    /// Drain the ring and stop every worker, returning the drained frames.
    pub fn finish(mut self) -> Vec<Vec<u8>> {
        let frames = self.drain();
        self.shutdown();
        frames
    }

    fn shutdown(&mut self) {
        for slot in &mut self.slots {
            slot.work.take();
        }
        for (n, slot) in self.slots.iter_mut().enumerate() {
            if let Some(thread) = slot.thread.take()
                && thread.join().is_err()
            {
                tracing::error!(slot = n, "DST decoder thread panicked");
            }
        }
    }
}

impl Drop for ParallelDecoder {
    fn drop(&mut self) {
        if self.slots.iter().any(|slot| slot.thread.is_some()) {
            self.drain();
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for ParallelDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelDecoder")
            .field("slots", &self.slots.len())
            .field("current", &self.current)
            .field("dsd_frame_size", &self.dsd_frame_size)
            .finish()
    }
}

fn run_slot(mut decoder: DstDecoder, frames: Receiver<Vec<u8>>, results: SyncSender<Vec<u8>>) {
    let size = decoder.dsd_frame_size();
    while let Ok(frame) = frames.recv() {
        let mut out = vec![0u8; size];
        if let Err(err) = decoder.decode(&frame, &mut out) {
            tracing::warn!(frame = decoder.frames(), error = %err, "DST frame failed to decode, substituting silence");
            out.fill(SILENCE);
        }
        if results.send(out).is_err() {
            break;
        }
    }
}
