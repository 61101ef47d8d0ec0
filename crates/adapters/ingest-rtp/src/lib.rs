//! RTP ingestion adapter
//!
//! Turns an unreliable, out-of-order UDP packet stream into a strictly
//! ordered byte stream for one live source:
//!
//! ```text
//! socket thread ──▶ BlockPool copy ──▶ JitterBuffer ──▶ ordered handler
//!                                                          │ blocking_send
//!                                                          ▼
//!                                            per-stream actor (tokio task)
//! ```
//!
//! The block pool is the backpressure point: when every block is checked
//! out, the receive thread parks until downstream processing recycles one.
//! The jitter buffer only ever inspects the 16-bit RTP sequence number;
//! payload semantics stay opaque to this crate.

pub mod jitter;
pub mod pool;
pub mod seq;
pub mod source;
pub mod tcp;

pub use jitter::{JitterBuffer, JitterConfig, JitterStats};
pub use pool::{Block, BlockPool};
pub use source::{RtpPacket, RtpSourceConfig, RtpUdpSource, SourceError};
pub use tcp::RtpTcpSource;
