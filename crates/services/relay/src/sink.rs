//! Output stage contract
//!
//! Every output protocol attaches to a stream through the same seam: a
//! `TransStream` that receives tracks, then ordered elementary-stream
//! packets, all from the stream's single serialized actor. Implementations
//! therefore never need internal locking.

use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use streamgate_core::{MediaPacket, Result, Track};

use crate::hls::playlist::PlaylistWriter;

/// Opaque identifier of an attached consumer
pub type SinkId = Uuid;

/// Playlist text shared between the writing sink and its consumers.
///
/// Updated only from the owning stream's serialized context; consumers
/// hold the `Arc` and read through it.
pub type SharedPlaylist = Arc<RwLock<String>>;

/// One-shot delivery channel for a playlist attach request. `None` means
/// the sink closed before it had anything to serve.
pub type PlaylistReply = oneshot::Sender<Option<SharedPlaylist>>;

/// What one `input` (or `close`) call produced
#[derive(Debug, Default)]
pub struct InputResult {
    /// Muxed chunks for in-memory consumers; disk-backed sinks leave
    /// this empty
    pub chunks: Vec<Bytes>,

    /// Presentation timestamp of `chunks`, -1 when not applicable
    pub pts: i64,

    /// Whether the call produced sink output (in memory or on disk)
    pub produced: bool,
}

impl InputResult {
    /// The packet was consumed and written through to the sink's backing
    pub fn consumed() -> Self {
        Self {
            chunks: Vec::new(),
            pts: -1,
            produced: true,
        }
    }

    /// Nothing was produced
    pub fn none() -> Self {
        Self {
            chunks: Vec::new(),
            pts: -1,
            produced: false,
        }
    }
}

/// Playlist state carried across sink instances when the same stream id
/// is re-published, so segment numbering and live consumers survive the
/// hand-off.
pub struct StreamEndState {
    /// Bounded playlist as it stood at close
    pub playlist: PlaylistWriter,

    /// The shared text buffer live consumers still hold
    pub playlist_text: SharedPlaylist,

    /// Sequence of the last segment written
    pub last_sequence: u64,
}

/// One output stage attached to a stream
pub trait TransStream: Send {
    /// Register an elementary stream, returning its index within this
    /// output. Fails if the underlying muxer rejects the codec.
    fn add_track(&mut self, track: Track) -> Result<usize>;

    /// Open the output (for segmenting sinks: the first segment).
    fn write_header(&mut self) -> Result<()>;

    /// Consume one ordered elementary-stream packet.
    fn input(&mut self, packet: &MediaPacket) -> Result<InputResult>;

    /// Register interest in this output's live playlist. Sinks without a
    /// playlist answer empty immediately.
    fn attach_consumer(&mut self, _id: SinkId, reply: PlaylistReply) {
        let _ = reply.send(None);
    }

    /// Flush and release the output. Must be idempotent-safe; after it
    /// returns no further write happens and every still-pending consumer
    /// has been notified.
    fn close(&mut self) -> Result<InputResult>;

    /// Resumable state for stream hand-off, if this output keeps any.
    /// Only meaningful after `close`.
    fn end_state(&mut self) -> Option<StreamEndState> {
        None
    }
}
