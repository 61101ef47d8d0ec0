//! Error types shared across the streamgate crates

use thiserror::Error;

/// Result type alias for streamgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the media pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (segment creation, playlist persistence)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A packet referenced a track index the muxer does not know
    #[error("track {index} not available")]
    TrackNotFound {
        /// Track index carried by the offending packet
        index: usize,
    },

    /// The muxer rejected a track's codec or parameters
    #[error("codec {codec} not supported by {output} output")]
    UnsupportedCodec {
        /// Codec name as registered
        codec: String,
        /// Output stage that rejected it
        output: String,
    },

    /// Container muxing failed
    #[error("mux error: {0}")]
    Mux(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The per-stream processing channel is gone
    #[error("stream channel closed")]
    ChannelClosed,

    /// Generic error
    #[error("{0}")]
    Other(String),
}
