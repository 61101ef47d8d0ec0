//! Reorder buffer for sequence-numbered packets
//!
//! Buffers out-of-order arrivals and hands them to a registered handler in
//! strictly increasing, wrap-aware sequence order. Loss is accepted once a
//! gap has been outstanding past the configured window, capacity, or
//! timeout; stale and duplicate sequences are discarded silently. None of
//! these conditions surface as errors; the contract is entirely the
//! ordering of handler invocations.
//!
//! Delivery happens under the internal lock, which is what makes
//! `set_handler(None)` a synchronization barrier: once it returns, no
//! previous handler runs again, even if a push is racing in from the
//! receive thread. No delivery is guaranteed past detach.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::seq;

/// Ordered-delivery callback installed with [`JitterBuffer::set_handler`]
pub type Handler<P> = Box<dyn FnMut(P) + Send>;

/// Tuning knobs for the reorder buffer
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Maximum forward distance a packet may sit ahead of the next
    /// expected sequence before the gap is written off as loss
    pub window: u16,

    /// Maximum number of buffered out-of-order packets
    pub capacity: usize,

    /// How long a gap may stay open before the next push force-advances
    pub gap_timeout: Duration,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            window: 512,
            capacity: 1024,
            gap_timeout: Duration::from_millis(300),
        }
    }
}

/// Counters for monitoring reorder behaviour
#[derive(Debug, Default, Clone)]
pub struct JitterStats {
    /// Packets pushed
    pub received: u64,
    /// Packets handed to the delivery callback
    pub delivered: u64,
    /// Stale or duplicate packets discarded
    pub dropped_stale: u64,
    /// Sequence numbers written off as lost by forced advancement
    pub lost: u64,
}

struct Inner<P> {
    config: JitterConfig,
    /// Next sequence owed to the handler; `None` until the first push
    /// (and again after a flush) so any starting sequence is accepted.
    next: Option<u16>,
    buffered: HashMap<u16, P>,
    handler: Option<Handler<P>>,
    /// When the currently open gap was first observed
    gap_since: Option<Instant>,
    stats: JitterStats,
}

/// Reorder engine for one ingest stream
pub struct JitterBuffer<P> {
    inner: Mutex<Inner<P>>,
}

impl<P: Send> JitterBuffer<P> {
    /// Create a buffer with the given tuning
    pub fn new(config: JitterConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                config,
                next: None,
                buffered: HashMap::new(),
                handler: None,
                gap_since: None,
                stats: JitterStats::default(),
            }),
        }
    }

    /// Install or detach the ordered-delivery handler.
    ///
    /// After `set_handler(None)` returns, no previously installed handler
    /// will be invoked again; this is the teardown barrier.
    pub fn set_handler(&self, handler: Option<Handler<P>>) {
        let mut inner = self.inner.lock().unwrap();
        inner.handler = handler;
    }

    /// Record or immediately deliver one packet.
    ///
    /// Single producer: only one thread may call `push`, but it may race
    /// with `flush` and `set_handler` during shutdown.
    pub fn push(&self, seq: u16, pkt: P) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.received += 1;

        let next = match inner.next {
            // First packet establishes the stream position.
            None => {
                inner.deliver(seq, pkt);
                return;
            }
            Some(n) => n,
        };

        if seq == next {
            inner.deliver(seq, pkt);
            inner.drain_contiguous();
            return;
        }

        if seq::is_behind(next, seq) || inner.buffered.contains_key(&seq) {
            inner.stats.dropped_stale += 1;
            tracing::trace!(seq, next, "discarding stale or duplicate packet");
            return;
        }

        // Ahead of the expected sequence: hold it until the gap closes.
        let gap_expired = inner
            .gap_since
            .is_some_and(|since| since.elapsed() >= inner.config.gap_timeout);
        inner.buffered.insert(seq, pkt);
        if inner.gap_since.is_none() {
            inner.gap_since = Some(Instant::now());
        }

        if seq::distance(next, seq) > inner.config.window
            || inner.buffered.len() > inner.config.capacity
            || gap_expired
        {
            inner.force_advance();
        }
    }

    /// Deliver every buffered packet in ascending wrap-aware order, then
    /// clear the stream position. Used at shutdown so tail packets held
    /// behind a gap are not discarded.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        while !inner.buffered.is_empty() {
            inner.force_advance();
        }
        inner.next = None;
        inner.gap_since = None;
    }

    /// Snapshot of the reorder counters
    pub fn stats(&self) -> JitterStats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Number of packets currently held out of order
    pub fn buffered_len(&self) -> usize {
        self.inner.lock().unwrap().buffered.len()
    }
}

impl<P> Inner<P> {
    fn deliver(&mut self, seq: u16, pkt: P) {
        self.next = Some(seq.wrapping_add(1));
        self.stats.delivered += 1;
        if self.buffered.is_empty() {
            self.gap_since = None;
        }
        if let Some(handler) = self.handler.as_mut() {
            handler(pkt);
        }
    }

    fn drain_contiguous(&mut self) {
        while let Some(next) = self.next {
            match self.buffered.remove(&next) {
                Some(pkt) => self.deliver(next, pkt),
                None => break,
            }
        }
    }

    /// Advance to the wrap-aware smallest buffered sequence, accepting the
    /// skipped range as loss, and deliver the now-contiguous run.
    fn force_advance(&mut self) {
        let base = self.next.unwrap_or(0);
        let smallest = self
            .buffered
            .keys()
            .copied()
            .min_by_key(|&s| seq::distance(base, s));
        if let Some(smallest) = smallest {
            let skipped = seq::distance(base, smallest);
            if self.next.is_some() && skipped > 0 {
                self.stats.lost += u64::from(skipped);
                tracing::debug!(from = base, to = smallest, skipped, "gap accepted as loss");
            }
            let pkt = self.buffered.remove(&smallest).unwrap();
            self.deliver(smallest, pkt);
            self.drain_contiguous();
        }
    }
}
