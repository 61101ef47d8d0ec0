//! Elementary-stream packets
//!
//! A `MediaPacket` is one timestamped access unit of one track, after any
//! transport framing has been stripped. Timestamps stay in the timebase the
//! source declared; output stages that need the fixed MPEG clock call the
//! `pts_90k`/`dts_90k` helpers at the boundary.

use bytes::Bytes;

/// The fixed 90 kHz reference clock used by MPEG outputs
pub const MPEG_TIMEBASE: u32 = 90_000;

/// Media type of a track or packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// Audio elementary stream
    Audio,
    /// Video elementary stream
    Video,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Audio => write!(f, "audio"),
            MediaType::Video => write!(f, "video"),
        }
    }
}

/// Codec identifiers the gateway can carry
///
/// This is the pass-through set: payload bits are never parsed, so a codec
/// only needs an identity here (and a stream type in the muxer) to flow
/// end-to-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    /// H.264 / AVC video
    H264,
    /// H.265 / HEVC video
    H265,
    /// AAC audio (ADTS framed)
    Aac,
    /// G.711 A-law audio
    G711a,
    /// G.711 mu-law audio
    G711u,
}

impl CodecId {
    /// Media type this codec belongs to
    pub fn media_type(&self) -> MediaType {
        match self {
            CodecId::H264 | CodecId::H265 => MediaType::Video,
            CodecId::Aac | CodecId::G711a | CodecId::G711u => MediaType::Audio,
        }
    }

    /// Canonical lowercase name, used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            CodecId::H264 => "h264",
            CodecId::H265 => "h265",
            CodecId::Aac => "aac",
            CodecId::G711a => "g711a",
            CodecId::G711u => "g711u",
        }
    }
}

/// One elementary-stream access unit flowing through a stream's pipeline
#[derive(Debug, Clone)]
pub struct MediaPacket {
    /// Index of the track this packet belongs to
    pub track_index: usize,

    /// Audio or video
    pub media_type: MediaType,

    /// Codec of the carrying track
    pub codec: CodecId,

    /// Keyframe flag; always true for audio
    pub key: bool,

    /// Presentation timestamp in `timebase` ticks
    pub pts: i64,

    /// Decode timestamp in `timebase` ticks
    pub dts: i64,

    /// Ticks per second of `pts`/`dts`
    pub timebase: u32,

    /// Opaque payload bytes
    pub payload: Bytes,
}

impl MediaPacket {
    /// Presentation timestamp rescaled to the 90 kHz reference clock
    pub fn pts_90k(&self) -> i64 {
        rescale(self.pts, self.timebase, MPEG_TIMEBASE)
    }

    /// Decode timestamp rescaled to the 90 kHz reference clock
    pub fn dts_90k(&self) -> i64 {
        rescale(self.dts, self.timebase, MPEG_TIMEBASE)
    }
}

/// Rescale a timestamp from one tick rate to another.
///
/// Widens through i128 so large timestamps cannot overflow the
/// intermediate product.
pub fn rescale(ts: i64, from: u32, to: u32) -> i64 {
    if from == to || from == 0 {
        return ts;
    }
    ((ts as i128 * to as i128) / from as i128) as i64
}
