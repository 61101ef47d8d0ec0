//! Metrics collection for the relay gateway
//!
//! Provides basic counters for monitoring ingest and output health.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Gateway metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Streams published since startup
    streams_started: AtomicU64,

    /// Streams closed since startup
    streams_ended: AtomicU64,

    /// Raw ingest payloads entering stream actors
    payloads_received: AtomicU64,

    /// Elementary-stream packets dispatched to sinks
    frames_dispatched: AtomicU64,

    /// Segments flushed to disk
    segments_written: AtomicU64,

    /// Segments deleted by playlist eviction
    segments_deleted: AtomicU64,

    /// Playlist consumers released with content
    consumers_released: AtomicU64,

    /// Playlist consumers notified empty at close
    consumers_unserved: AtomicU64,
}

impl Metrics {
    /// Record a stream being published
    pub fn stream_started(&self) {
        self.streams_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stream ending
    pub fn stream_ended(&self) {
        self.streams_ended.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a raw payload reaching a stream actor
    pub fn payload_received(&self) {
        self.payloads_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an elementary-stream packet dispatched to sinks
    pub fn frame_dispatched(&self) {
        self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a segment flushed to disk
    pub fn segment_written(&self) {
        self.segments_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a segment removed by eviction
    pub fn segment_deleted(&self) {
        self.segments_deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pending consumer released with a playlist
    pub fn consumer_released(&self) {
        self.consumers_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pending consumer notified empty at close
    pub fn consumer_unserved(&self) {
        self.consumers_unserved.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            streams_started: self.streams_started.load(Ordering::Relaxed),
            streams_ended: self.streams_ended.load(Ordering::Relaxed),
            payloads_received: self.payloads_received.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            segments_written: self.segments_written.load(Ordering::Relaxed),
            segments_deleted: self.segments_deleted.load(Ordering::Relaxed),
            consumers_released: self.consumers_released.load(Ordering::Relaxed),
            consumers_unserved: self.consumers_unserved.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the gateway counters
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub streams_started: u64,
    pub streams_ended: u64,
    pub payloads_received: u64,
    pub frames_dispatched: u64,
    pub segments_written: u64,
    pub segments_deleted: u64,
    pub consumers_released: u64,
    pub consumers_unserved: u64,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Process-wide metrics instance
pub fn global_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::default)
}
