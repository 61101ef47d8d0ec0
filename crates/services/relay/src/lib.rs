//! Live-media relay gateway
//!
//! Accepts RTP ingest, reorders it into a strict per-stream sequence, and
//! republishes through segmenting outputs: HLS/MPEG-TS on disk with a
//! bounded live playlist.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        streamgate-relay                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────────┐      ┌─────────────────────────────────┐   │
//! │  │  RTP/UDP source  │─────▶│  StreamActor (one task/stream)  │   │
//! │  │  (pool + jitter) │      │  serialized: demux ▶ sinks      │   │
//! │  └──────────────────┘      └──────────────┬──────────────────┘   │
//! │                                           │ input()              │
//! │  ┌──────────────────┐      ┌──────────────▼──────────────────┐   │
//! │  │  OutputRegistry  │─────▶│  HlsTransStream                 │   │
//! │  │  (typed factory) │      │  muxer ▶ segments ▶ playlist    │   │
//! │  └──────────────────┘      └─────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every stream owns one serialized execution context: the actor task is
//! the only writer of muxer, segment, and playlist state, so none of it
//! needs a lock. The only synchronization point is the bounded channel
//! the ingest adapter feeds.

pub mod config;
pub mod hls;
pub mod hub;
pub mod metrics;
pub mod registry;
pub mod sink;
