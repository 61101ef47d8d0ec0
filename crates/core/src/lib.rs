//! Core media model for streamgate
//!
//! Shared, dependency-light types used by ingest adapters and output
//! stages alike: elementary-stream packets with their timestamps, track
//! descriptions, and the crate-wide error type. Everything here is
//! protocol-agnostic; wire formats live in the adapter crates.

pub mod error;
pub mod packet;
pub mod track;

pub use error::{Error, Result};
pub use packet::{rescale, CodecId, MediaPacket, MediaType, MPEG_TIMEBASE};
pub use track::Track;
