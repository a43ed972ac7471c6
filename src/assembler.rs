//! JPEG frame assembler.
//!
//! The peripheral writes back-to-back JPEG images with no length prefix, so the
//! only framing available is the Start-Of-Image (`FF D8`) / End-Of-Image
//! (`FF D9`) marker pair. `FrameAssembler` accumulates arbitrary read chunks in
//! a fixed-capacity arena and extracts complete marker-delimited frames.
//!
//! Invariants:
//! - `buf[0..pos)` always holds the most recent `pos` bytes of the ingested
//!   stream; `buf[pos..)` is stale.
//! - The arena is allocated once and never grows. Compaction is a
//!   `copy_within` down to offset 0.
//! - `pos` never exceeds the overflow threshold once `ingest` returns.
//!
//! Frames are yielded lazily through [`Ingest::next_frame`]. A yielded
//! [`Frame`] borrows the arena and is only valid until the next call, which
//! compacts the consumed bytes away.

use std::ops::RangeInclusive;

/// Start-Of-Image marker.
pub const SOI: [u8; 2] = [0xFF, 0xD8];
/// End-Of-Image marker.
pub const EOI: [u8; 2] = [0xFF, 0xD9];

pub const DEFAULT_CAPACITY: usize = 512 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Arena size in bytes.
    pub capacity: usize,
    /// Accumulated bytes above this are discarded before scanning.
    pub overflow_threshold: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            overflow_threshold: DEFAULT_CAPACITY / 2,
        }
    }
}

/// Location of a candidate frame inside the arena. Both ends are inclusive:
/// `start` is the `FF` of SOI, `end` is the `D9` of EOI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSpan {
    pub start: usize,
    pub end: usize,
}

impl FrameSpan {
    /// Frame size in bytes, both markers included.
    pub fn byte_len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn range(&self) -> RangeInclusive<usize> {
        self.start..=self.end
    }
}

/// A frame extracted from the arena.
#[derive(Debug)]
pub struct Frame<'a> {
    pub span: FrameSpan,
    /// Offset of the SOI marker counted from the first byte ever ingested.
    pub stream_offset: u64,
    bytes: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub frames: u64,
    pub overflow_resets: u64,
    pub wraps: u64,
    pub discarded_bytes: u64,
}

pub struct FrameAssembler {
    buf: Box<[u8]>,
    pos: usize,
    overflow_threshold: usize,
    /// Total bytes handed to `ingest`, used to derive stream offsets.
    total_in: u64,
    stats: AssemblerStats,
}

impl FrameAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        let capacity = config.capacity.max(2);
        let overflow_threshold = config.overflow_threshold.clamp(2, capacity);
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            overflow_threshold,
            total_in: 0,
            stats: AssemblerStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Current write cursor; the number of accumulated, unconsumed bytes.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    /// Discard everything accumulated. The arena is kept.
    pub fn reset(&mut self) {
        self.discard(self.pos);
    }

    /// Append `incoming` and return a lazy sequence of the frames now complete.
    ///
    /// Frames not pulled from the returned [`Ingest`] stay in the arena and
    /// are found again by the next call.
    pub fn ingest(&mut self, incoming: &[u8]) -> Ingest<'_> {
        self.append(incoming);
        if self.pos > self.overflow_threshold {
            log::warn!(
                "stream buffer reached {} bytes without a frame, clearing to resync",
                self.pos
            );
            self.stats.overflow_resets += 1;
            self.reset();
        }
        Ingest {
            assembler: self,
            pending_consume: None,
            finished: false,
        }
    }

    fn append(&mut self, incoming: &[u8]) {
        let capacity = self.buf.len();
        self.total_in += incoming.len() as u64;
        if self.pos + incoming.len() <= capacity {
            self.buf[self.pos..self.pos + incoming.len()].copy_from_slice(incoming);
            self.pos += incoming.len();
            return;
        }

        // Bounded circular write. Whatever was accumulated is lost; the
        // logical window restarts at offset 0 with the tail of `incoming`.
        let to_end = capacity - self.pos;
        self.buf[self.pos..].copy_from_slice(&incoming[..to_end]);
        let mut tail = &incoming[to_end..];
        if tail.len() > capacity {
            tail = &tail[tail.len() - capacity..];
        }
        self.buf[..tail.len()].copy_from_slice(tail);
        let lost = (self.pos + incoming.len() - tail.len()) as u64;
        self.stats.discarded_bytes += lost;
        self.stats.wraps += 1;
        self.pos = tail.len();
    }

    /// Index of the first `marker` starting in `[from, pos - 1)`.
    fn find_marker(&self, marker: [u8; 2], from: usize) -> Option<usize> {
        if self.pos < 2 || from >= self.pos - 1 {
            return None;
        }
        self.buf[from..self.pos]
            .windows(2)
            .position(|w| w[0] == marker[0] && w[1] == marker[1])
            .map(|i| from + i)
    }

    /// Drop the first `count` accumulated bytes, shifting the rest to offset 0.
    fn shift_down(&mut self, count: usize) {
        let count = count.min(self.pos);
        if count == 0 {
            return;
        }
        self.buf.copy_within(count..self.pos, 0);
        self.pos -= count;
    }

    fn discard(&mut self, count: usize) {
        self.stats.discarded_bytes += count.min(self.pos) as u64;
        self.shift_down(count);
    }

    fn stream_offset(&self, index: usize) -> u64 {
        self.total_in - self.pos as u64 + index as u64
    }
}

/// Frames made available by one [`FrameAssembler::ingest`] call.
pub struct Ingest<'a> {
    assembler: &'a mut FrameAssembler,
    /// Bytes up to and including the last yielded EOI, compacted lazily.
    pending_consume: Option<usize>,
    finished: bool,
}

impl<'a> Ingest<'a> {
    pub fn next_frame(&mut self) -> Option<Frame<'_>> {
        self.consume_pending();
        if self.finished {
            return None;
        }
        let asm = &mut *self.assembler;
        if asm.pos < 2 {
            self.finished = true;
            return None;
        }

        let Some(soi) = asm.find_marker(SOI, 0) else {
            // Keep the last byte: it may be the FF of a marker split across reads.
            let keep_from = asm.pos - 1;
            asm.discard(keep_from);
            self.finished = true;
            return None;
        };

        let Some(eoi) = asm.find_marker(EOI, soi + 2) else {
            if soi > 0 {
                asm.discard(soi);
            }
            self.finished = true;
            return None;
        };

        let span = FrameSpan {
            start: soi,
            end: eoi + 1,
        };
        asm.stats.frames += 1;
        self.pending_consume = Some(span.end + 1);
        let asm = &*self.assembler;
        Some(Frame {
            span,
            stream_offset: asm.stream_offset(soi),
            bytes: &asm.buf[span.range()],
        })
    }

    /// Pull every remaining frame as owned bytes.
    pub fn collect_owned(mut self) -> Vec<(FrameSpan, Vec<u8>)> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push((frame.span, frame.to_vec()));
        }
        frames
    }

    fn consume_pending(&mut self) {
        if let Some(consumed) = self.pending_consume.take() {
            self.assembler.shift_down(consumed);
        }
    }
}

impl Drop for Ingest<'_> {
    fn drop(&mut self) {
        self.consume_pending();
    }
}
