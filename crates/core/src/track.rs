//! Track descriptions
//!
//! A `Track` describes one elementary stream within a source and carries the
//! rolling timestamp state output stages read when they need the latest
//! position or a nominal frame duration.

use bytes::Bytes;

use crate::packet::{CodecId, MediaType};

/// One elementary stream (audio or video) of a source
#[derive(Debug, Clone)]
pub struct Track {
    /// Codec identity
    pub codec: CodecId,

    /// Audio or video (derived from the codec at construction)
    pub media_type: MediaType,

    /// Out-of-band codec parameters (e.g. SPS/PPS for H.264), opaque here
    pub extra_data: Bytes,

    /// Ticks per second of this track's timestamps
    pub timebase: u32,

    /// Latest presentation timestamp seen, in `timebase` ticks
    pub pts: i64,

    /// Latest decode timestamp seen, in `timebase` ticks
    pub dts: i64,

    /// Nominal duration of a single frame in `timebase` ticks, 0 if unknown
    pub frame_duration: i64,
}

impl Track {
    /// Create a track positioned at the given initial timestamps
    pub fn new(codec: CodecId, extra_data: Bytes, timebase: u32, pts: i64, dts: i64) -> Self {
        Self {
            codec,
            media_type: codec.media_type(),
            extra_data,
            timebase,
            pts,
            dts,
            frame_duration: 0,
        }
    }

    /// Record the timestamps of a packet just seen on this track
    pub fn observe(&mut self, pts: i64, dts: i64) {
        // Frame duration is estimated from consecutive decode timestamps;
        // a backwards jump resets nothing and keeps the last estimate.
        if dts > self.dts && self.dts != 0 {
            self.frame_duration = dts - self.dts;
        }
        self.pts = pts;
        self.dts = dts;
    }
}
