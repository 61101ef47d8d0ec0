//! Per-stream serialized execution
//!
//! Every published stream owns exactly one actor task. Ingest threads
//! enqueue into its bounded channel; the actor dequeues and runs demux,
//! sink muxing, rotation, and playlist mutation strictly one event at a
//! time. That single-writer discipline is what lets every sink run
//! lock-free. Disk writes during rotation block the actor briefly, which
//! is accepted: rotation happens at segment granularity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use streamgate_core::{CodecId, MediaPacket, Track};
use streamgate_ingest_rtp::RtpPacket;

use crate::metrics::global_metrics;
use crate::registry::{OutputContext, OutputProtocol, OutputRegistry};
use crate::sink::{PlaylistReply, SharedPlaylist, SinkId, StreamEndState, TransStream};

/// Everything a stream actor can be asked to do
pub enum StreamEvent {
    /// Raw ordered bytes from an ingest adapter
    Payload(RtpPacket),

    /// One parsed elementary-stream packet
    Frame(MediaPacket),

    /// Declare a track; only valid before the first frame
    AddTrack(Track),

    /// Register interest in an output's live playlist
    AttachPlaylistConsumer {
        protocol: OutputProtocol,
        id: SinkId,
        reply: PlaylistReply,
    },

    /// Stop the stream; sinks flush and close
    Close,
}

impl From<RtpPacket> for StreamEvent {
    fn from(pkt: RtpPacket) -> Self {
        StreamEvent::Payload(pkt)
    }
}

/// External collaborator that turns raw ordered transport payloads into
/// elementary-stream packets.
///
/// Real depacketizers (PS, JT/1078, RTP payload formats) are protocol
/// plumbing outside this crate; the gateway only defines the seam they
/// plug into.
pub trait Depacketizer: Send {
    /// Consume one ordered payload, returning any completed packets.
    fn on_payload(&mut self, payload: &[u8]) -> Vec<MediaPacket>;
}

/// Stand-in depacketizer: forwards each RTP payload as one opaque access
/// unit of a fixed codec, timestamped from the RTP header. Useful for
/// wiring tests and transports whose payload is already one access unit
/// per packet.
pub struct OpaqueDepacketizer {
    codec: CodecId,
    timebase: u32,
}

impl OpaqueDepacketizer {
    /// Create a depacketizer emitting packets of `codec` with timestamps
    /// in `timebase` ticks per second.
    pub fn new(codec: CodecId, timebase: u32) -> Self {
        Self { codec, timebase }
    }
}

impl Depacketizer for OpaqueDepacketizer {
    fn on_payload(&mut self, payload: &[u8]) -> Vec<MediaPacket> {
        // Fixed RTP header plus any CSRC entries; payload follows.
        if payload.len() < 12 {
            return Vec::new();
        }
        let csrc_count = usize::from(payload[0] & 0x0F);
        let header_len = 12 + csrc_count * 4;
        if payload.len() <= header_len {
            return Vec::new();
        }
        let timestamp = i64::from(u32::from_be_bytes([
            payload[4], payload[5], payload[6], payload[7],
        ]));
        vec![MediaPacket {
            track_index: 0,
            media_type: self.codec.media_type(),
            codec: self.codec,
            key: true,
            pts: timestamp,
            dts: timestamp,
            timebase: self.timebase,
            payload: Bytes::copy_from_slice(&payload[header_len..]),
        }]
    }
}

/// Hub-level errors
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("stream {0} is already published")]
    AlreadyPublished(String),

    #[error("stream {0} not found")]
    NotFound(String),

    #[error("no output protocols requested")]
    NoOutputs,

    #[error("failed to create {protocol} output: {source}")]
    CreateOutput {
        protocol: OutputProtocol,
        source: streamgate_core::Error,
    },
}

struct StreamHandle {
    tx: mpsc::Sender<StreamEvent>,
    task: tokio::task::JoinHandle<()>,
}

/// Manager of all live streams
pub struct StreamHub {
    registry: Arc<OutputRegistry>,
    streams: tokio::sync::Mutex<HashMap<String, StreamHandle>>,
    /// Resumable sink state from closed streams, keyed by stream id
    ended: Arc<Mutex<HashMap<String, StreamEndState>>>,
    queue_capacity: usize,
}

impl StreamHub {
    /// Create a hub that constructs sinks through `registry`
    pub fn new(registry: Arc<OutputRegistry>, queue_capacity: usize) -> Self {
        Self {
            registry,
            streams: tokio::sync::Mutex::new(HashMap::new()),
            ended: Arc::new(Mutex::new(HashMap::new())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Publish a stream: construct one sink per requested output, declare
    /// `tracks` on each, and spawn the serialized actor. Returns the
    /// sender ingest adapters feed.
    pub async fn publish(
        &self,
        stream_id: &str,
        outputs: &[OutputProtocol],
        tracks: Vec<Track>,
        depacketizer: Box<dyn Depacketizer>,
    ) -> Result<mpsc::Sender<StreamEvent>, HubError> {
        if outputs.is_empty() {
            return Err(HubError::NoOutputs);
        }

        let mut streams = self.streams.lock().await;
        if streams.contains_key(stream_id) {
            return Err(HubError::AlreadyPublished(stream_id.to_string()));
        }

        let mut ctx = OutputContext {
            stream_id: stream_id.to_string(),
            resume: self.ended.lock().unwrap().remove(stream_id),
        };
        let mut sinks: Vec<(OutputProtocol, Box<dyn TransStream>)> = Vec::new();
        for &protocol in outputs {
            let mut sink = self
                .registry
                .create(protocol, &mut ctx)
                .map_err(|source| HubError::CreateOutput { protocol, source })?;
            for track in &tracks {
                sink.add_track(track.clone())
                    .map_err(|source| HubError::CreateOutput { protocol, source })?;
            }
            sinks.push((protocol, sink));
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let task = tokio::spawn(run_stream(
            stream_id.to_string(),
            rx,
            sinks,
            depacketizer,
            Arc::clone(&self.ended),
        ));
        streams.insert(stream_id.to_string(), StreamHandle { tx: tx.clone(), task });

        global_metrics().stream_started();
        tracing::info!(stream_id, outputs = outputs.len(), "stream published");
        Ok(tx)
    }

    /// Sender for an already-published stream
    pub async fn sender(&self, stream_id: &str) -> Option<mpsc::Sender<StreamEvent>> {
        self.streams
            .lock()
            .await
            .get(stream_id)
            .map(|handle| handle.tx.clone())
    }

    /// Register a playlist consumer on one of a stream's outputs. The
    /// returned receiver resolves with the shared playlist once it is
    /// playable, or `None` if the sink closes first.
    pub async fn attach_playlist_consumer(
        &self,
        stream_id: &str,
        protocol: OutputProtocol,
        id: SinkId,
    ) -> Result<oneshot::Receiver<Option<SharedPlaylist>>, HubError> {
        let sender = self
            .sender(stream_id)
            .await
            .ok_or_else(|| HubError::NotFound(stream_id.to_string()))?;
        let (reply, rx) = oneshot::channel();
        sender
            .send(StreamEvent::AttachPlaylistConsumer { protocol, id, reply })
            .await
            .map_err(|_| HubError::NotFound(stream_id.to_string()))?;
        Ok(rx)
    }

    /// Close one stream, waiting for its actor to flush and stop.
    pub async fn close_stream(&self, stream_id: &str) -> Result<(), HubError> {
        let handle = self
            .streams
            .lock()
            .await
            .remove(stream_id)
            .ok_or_else(|| HubError::NotFound(stream_id.to_string()))?;
        let _ = handle.tx.send(StreamEvent::Close).await;
        let _ = handle.task.await;
        Ok(())
    }

    /// Close every stream; used at gateway shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, StreamHandle)> =
            self.streams.lock().await.drain().collect();
        for (stream_id, handle) in handles {
            tracing::info!(stream_id = %stream_id, "closing stream");
            let _ = handle.tx.send(StreamEvent::Close).await;
            let _ = handle.task.await;
        }
    }

    /// Number of currently published streams
    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }
}

/// The serialized per-stream event loop.
async fn run_stream(
    stream_id: String,
    mut rx: mpsc::Receiver<StreamEvent>,
    mut sinks: Vec<(OutputProtocol, Box<dyn TransStream>)>,
    mut depacketizer: Box<dyn Depacketizer>,
    ended: Arc<Mutex<HashMap<String, StreamEndState>>>,
) {
    let mut started = false;

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Payload(pkt) => {
                global_metrics().payload_received();
                let frames = depacketizer.on_payload(pkt.payload());
                // The pool block rides in `pkt` and recycles here.
                drop(pkt);
                for frame in frames {
                    dispatch_frame(&stream_id, &mut sinks, &mut started, &frame);
                }
            }
            StreamEvent::Frame(frame) => {
                dispatch_frame(&stream_id, &mut sinks, &mut started, &frame);
            }
            StreamEvent::AddTrack(track) => {
                if started {
                    tracing::warn!(stream_id = %stream_id, "track declared after first frame, ignoring");
                    continue;
                }
                sinks.retain_mut(|(protocol, sink)| match sink.add_track(track.clone()) {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::error!(stream_id = %stream_id, %protocol, error = %e, "track rejected, detaching sink");
                        let _ = sink.close();
                        false
                    }
                });
            }
            StreamEvent::AttachPlaylistConsumer { protocol, id, reply } => {
                match sinks.iter_mut().find(|(p, _)| *p == protocol) {
                    Some((_, sink)) => sink.attach_consumer(id, reply),
                    None => {
                        // No such output on this stream; answer empty.
                        let _ = reply.send(None);
                    }
                }
            }
            StreamEvent::Close => break,
        }
    }

    for (protocol, sink) in sinks.iter_mut() {
        if let Err(e) = sink.close() {
            tracing::error!(stream_id = %stream_id, %protocol, error = %e, "sink close failed");
        }
        if let Some(state) = sink.end_state() {
            ended.lock().unwrap().insert(stream_id.clone(), state);
        }
    }
    global_metrics().stream_ended();
    tracing::debug!(stream_id = %stream_id, "stream actor stopped");
}

fn dispatch_frame(
    stream_id: &str,
    sinks: &mut Vec<(OutputProtocol, Box<dyn TransStream>)>,
    started: &mut bool,
    frame: &MediaPacket,
) {
    if !*started {
        sinks.retain_mut(|(protocol, sink)| match sink.write_header() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(stream_id, %protocol, error = %e, "write_header failed, detaching sink");
                let _ = sink.close();
                false
            }
        });
        *started = true;
    }

    global_metrics().frame_dispatched();
    sinks.retain_mut(|(protocol, sink)| match sink.input(frame) {
        Ok(_) => true,
        Err(e) => {
            // Non-retryable sink failures detach just that output; the
            // stream keeps feeding the others.
            tracing::error!(stream_id, %protocol, error = %e, "sink input failed, detaching");
            let _ = sink.close();
            false
        }
    });
}
