//! Minimal MPEG-TS muxer
//!
//! Packs opaque elementary-stream access units into 188-byte transport
//! stream packets: PAT/PMT program tables at each segment start, PES
//! framing with 90 kHz PTS/DTS, PCR on the clock track, adaptation-field
//! stuffing and per-PID continuity counters. Payload bits are never
//! inspected; codec identity only selects the PMT stream type.
//!
//! The muxer does not own an output. Every write goes through a
//! [`TsWriteTarget`], whose `alloc`/`commit` pair lets the caller batch
//! packets into a fixed in-memory buffer and flush to disk only when that
//! buffer fills; that is the segmenting sink's I/O strategy.

pub mod crc;
pub mod muxer;

pub use muxer::{TsMuxer, TS_PACKET_SIZE};

/// Destination for muxed transport-stream bytes.
///
/// `alloc(size)` returns a scratch slice of exactly `size` bytes to build
/// the next packet in; `commit(written)` accounts for the bytes actually
/// produced. An implementation backed by a bounded buffer flushes its
/// contents downstream inside `alloc` whenever the requested span no
/// longer fits.
pub trait TsWriteTarget {
    /// Hand out a writable span of exactly `size` bytes.
    fn alloc(&mut self, size: usize) -> std::io::Result<&mut [u8]>;

    /// Record that `written` bytes of the last allocated span are in use.
    fn commit(&mut self, written: usize);
}

/// Growable in-memory target, mainly for tests and probing.
#[derive(Default)]
pub struct VecTarget {
    buf: Vec<u8>,
    span_start: usize,
}

impl VecTarget {
    /// Create an empty target
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed bytes so far
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the target, returning the committed bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl TsWriteTarget for VecTarget {
    fn alloc(&mut self, size: usize) -> std::io::Result<&mut [u8]> {
        self.span_start = self.buf.len();
        self.buf.resize(self.span_start + size, 0);
        Ok(&mut self.buf[self.span_start..])
    }

    fn commit(&mut self, written: usize) {
        self.buf.truncate(self.span_start + written);
    }
}
