//! Output factory registry
//!
//! An explicit, typed mapping from protocol tag to constructor, built
//! once at startup. Creating a sink for an unregistered protocol is an
//! error, not a silent no-op.

use std::collections::HashMap;

use streamgate_core::{Error, Result};

use crate::sink::{StreamEndState, TransStream};

/// Output protocols the gateway can republish to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputProtocol {
    Hls,
    Rtmp,
    Flv,
    Rtsp,
    WebRtc,
}

impl std::fmt::Display for OutputProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputProtocol::Hls => write!(f, "hls"),
            OutputProtocol::Rtmp => write!(f, "rtmp"),
            OutputProtocol::Flv => write!(f, "flv"),
            OutputProtocol::Rtsp => write!(f, "rtsp"),
            OutputProtocol::WebRtc => write!(f, "webrtc"),
        }
    }
}

/// Everything a factory may need to construct a sink for one stream
pub struct OutputContext {
    /// Stream id the sink belongs to
    pub stream_id: String,

    /// Prior sink state when this stream id is being re-published;
    /// factories that support hand-off take it
    pub resume: Option<StreamEndState>,
}

/// Constructor capability for one output protocol
pub type TransStreamFactory =
    Box<dyn Fn(&mut OutputContext) -> Result<Box<dyn TransStream>> + Send + Sync>;

/// Registry of output constructors, keyed by protocol tag
#[derive(Default)]
pub struct OutputRegistry {
    factories: HashMap<OutputProtocol, TransStreamFactory>,
}

impl OutputRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for a protocol, replacing any previous one
    pub fn register(&mut self, protocol: OutputProtocol, factory: TransStreamFactory) {
        self.factories.insert(protocol, factory);
    }

    /// Construct a sink for `protocol`
    pub fn create(
        &self,
        protocol: OutputProtocol,
        ctx: &mut OutputContext,
    ) -> Result<Box<dyn TransStream>> {
        let factory = self
            .factories
            .get(&protocol)
            .ok_or_else(|| Error::Config(format!("no output factory registered for {protocol}")))?;
        factory(ctx)
    }

    /// Whether a constructor exists for `protocol`
    pub fn contains(&self, protocol: OutputProtocol) -> bool {
        self.factories.contains_key(&protocol)
    }

    /// Protocols with a registered constructor
    pub fn registered(&self) -> Vec<OutputProtocol> {
        self.factories.keys().copied().collect()
    }
}
