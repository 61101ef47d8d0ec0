//! HLS segmenting output
//!
//! Consumes ordered elementary-stream packets for one stream, muxes them
//! into MPEG-TS, rotates segment files on a duration/keyframe policy, and
//! maintains a bounded live playlist on disk. Late-joining consumers are
//! parked until the playlist holds two segments (one segment stutters on
//! most players) and are always answered, with an empty result if the
//! sink closes first.
//!
//! Everything here runs on the stream's serialized actor, so there is no
//! locking around muxer, segment, or playlist state; the shared playlist
//! text is the one read-mostly value consumers hold a reference to.

pub mod playlist;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use streamgate_core::{Error, MediaPacket, MediaType, Result, Track, MPEG_TIMEBASE};
use streamgate_mpegts::{TsMuxer, TsWriteTarget};

use crate::config::HlsConfig;
use crate::metrics::global_metrics;
use crate::registry::{OutputContext, OutputProtocol, OutputRegistry};
use crate::sink::{
    InputResult, PlaylistReply, SharedPlaylist, SinkId, StreamEndState, TransStream,
};
use playlist::{PlaylistWriter, SegmentEntry};

/// In-memory write buffer per open segment; batches muxer output so the
/// file sees large writes instead of one per TS packet.
const WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Playlist file name inside each stream's directory
const PLAYLIST_FILE_NAME: &str = "playlist.m3u8";

/// Buffered writer for the segment currently on disk
struct SegmentBuffer {
    buf: Box<[u8]>,
    fill: usize,
    file: File,
}

impl SegmentBuffer {
    fn new(file: File) -> Self {
        Self {
            buf: vec![0u8; WRITE_BUFFER_SIZE].into_boxed_slice(),
            fill: 0,
            file,
        }
    }

    /// Write out any buffered bytes and close the file.
    fn finish(mut self) -> std::io::Result<()> {
        if self.fill > 0 {
            self.file.write_all(&self.buf[..self.fill])?;
            self.fill = 0;
        }
        self.file.flush()
    }
}

impl TsWriteTarget for SegmentBuffer {
    fn alloc(&mut self, size: usize) -> std::io::Result<&mut [u8]> {
        debug_assert!(size <= self.buf.len());
        // Not enough room left: flush what we have and start over at the
        // front of the buffer.
        if self.buf.len() - self.fill < size {
            self.file.write_all(&self.buf[..self.fill])?;
            self.fill = 0;
        }
        Ok(&mut self.buf[self.fill..self.fill + size])
    }

    fn commit(&mut self, written: usize) {
        self.fill += written;
    }
}

/// State of the segment currently being written
struct SegmentContext {
    sequence: u64,
    path: PathBuf,
    url: String,
    buffer: SegmentBuffer,
}

/// HLS segmenting sink for one stream
pub struct HlsTransStream {
    stream_id: String,
    dir: PathBuf,
    segment_prefix: String,
    url_prefix: String,
    segment_duration_ticks: i64,

    muxer: TsMuxer,
    tracks: Vec<Track>,
    has_video: bool,

    /// Exactly one open segment at a time; `None` before `write_header`
    /// and after `close`
    context: Option<SegmentContext>,

    playlist: PlaylistWriter,
    playlist_text: SharedPlaylist,
    playlist_file: Option<File>,

    /// Consumers waiting for the playlist to become playable
    pending: HashMap<SinkId, PlaylistReply>,

    last_sequence: u64,

    /// Set on non-retryable I/O failure and at close; refuses further input
    failed: bool,
}

impl HlsTransStream {
    /// Create the sink for `stream_id`, preparing its directory and
    /// playlist file. `resume` carries playlist state across a republish
    /// of the same stream id.
    pub fn new(
        stream_id: &str,
        config: &HlsConfig,
        resume: Option<StreamEndState>,
    ) -> Result<Self> {
        let dir = Path::new(&config.root_dir).join(stream_id);
        fs::create_dir_all(&dir)?;

        let playlist_path = dir.join(PLAYLIST_FILE_NAME);
        let playlist_file = match OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&playlist_path)
        {
            Ok(file) => Some(file),
            Err(e) => {
                // The stream can still serve consumers from memory.
                tracing::warn!(
                    error = %e,
                    path = %playlist_path.display(),
                    "playlist file unavailable, serving from memory only"
                );
                None
            }
        };

        let (playlist, playlist_text, last_sequence) = match resume {
            Some(state) => {
                tracing::info!(
                    stream_id,
                    last_sequence = state.last_sequence,
                    "resuming playlist from a previous publish"
                );
                (state.playlist, state.playlist_text, state.last_sequence)
            }
            None => (
                PlaylistWriter::new(config.playlist_length),
                Arc::new(RwLock::new(String::new())),
                0,
            ),
        };

        Ok(Self {
            stream_id: stream_id.to_string(),
            dir,
            segment_prefix: config.segment_prefix.clone(),
            url_prefix: config.url_prefix.clone(),
            segment_duration_ticks: i64::from(config.segment_duration_secs)
                * i64::from(MPEG_TIMEBASE),
            muxer: TsMuxer::new(),
            tracks: Vec::new(),
            has_video: false,
            context: None,
            playlist,
            playlist_text,
            playlist_file,
            pending: HashMap::new(),
            last_sequence,
            failed: false,
        })
    }

    /// Open the next segment: reset the muxer, pick the next free file
    /// name, and write the program tables.
    ///
    /// A name collision (leftover file from a crashed run) advances the
    /// sequence and retries; any other creation error is non-retryable
    /// and stops the sink.
    fn create_segment(&mut self) -> Result<()> {
        self.muxer.reset();

        let mut sequence = self.last_sequence + 1;
        loop {
            let name = format!("{}{:05}.ts", self.segment_prefix, sequence);
            let path = self.dir.join(&name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    let url = format!("{}{}", self.url_prefix, name);
                    let mut buffer = SegmentBuffer::new(file);
                    if let Err(e) = self.muxer.write_header(&mut buffer) {
                        // The half-open file closes on drop; the next
                        // attempt will skip its name.
                        self.failed = true;
                        return Err(e);
                    }
                    self.last_sequence = sequence;
                    self.context = Some(SegmentContext {
                        sequence,
                        path,
                        url,
                        buffer,
                    });
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tracing::warn!(
                        stream_id = %self.stream_id,
                        path = %path.display(),
                        "segment name collision, advancing sequence"
                    );
                    sequence += 1;
                }
                Err(e) => {
                    tracing::error!(
                        stream_id = %self.stream_id,
                        error = %e,
                        path = %path.display(),
                        "segment creation failed"
                    );
                    self.failed = true;
                    return Err(e.into());
                }
            }
        }
    }

    /// Close the current segment and publish it: flush buffered bytes,
    /// append to the playlist (deleting whatever falls off the far end),
    /// persist the playlist file, and release pending consumers once two
    /// segments exist.
    fn flush_segment(&mut self) -> Result<()> {
        let Some(context) = self.context.take() else {
            return Ok(());
        };
        let SegmentContext {
            sequence,
            path,
            url,
            buffer,
        } = context;

        if let Err(e) = buffer.finish() {
            self.failed = true;
            return Err(e.into());
        }

        let duration = self.muxer.duration() as f32 / MPEG_TIMEBASE as f32;
        if let Some(evicted) = self.playlist.push(SegmentEntry {
            sequence,
            duration,
            url,
            path,
        }) {
            match fs::remove_file(&evicted.path) {
                Ok(()) => global_metrics().segment_deleted(),
                Err(e) => tracing::warn!(
                    error = %e,
                    path = %evicted.path.display(),
                    "failed to delete evicted segment"
                ),
            }
        }
        global_metrics().segment_written();

        let text = self.playlist.render();
        *self.playlist_text.write().unwrap() = text.clone();

        // Playlist entries already appended stay appended even if
        // persisting fails below; the in-memory list is the source of
        // truth and is never rolled back.
        if let Some(file) = self.playlist_file.as_mut() {
            if let Err(e) = rewrite_in_place(file, &text) {
                self.failed = true;
                return Err(e.into());
            }
        }

        if self.playlist.len() > 1 && !self.pending.is_empty() {
            tracing::debug!(
                stream_id = %self.stream_id,
                waiters = self.pending.len(),
                "playlist playable, releasing pending consumers"
            );
            for (_, reply) in self.pending.drain() {
                if reply.send(Some(Arc::clone(&self.playlist_text))).is_ok() {
                    global_metrics().consumer_released();
                }
            }
        }

        Ok(())
    }
}

impl TransStream for HlsTransStream {
    fn add_track(&mut self, track: Track) -> Result<usize> {
        if self.context.is_some() {
            return Err(Error::Mux(
                "cannot add tracks after the first segment is open".into(),
            ));
        }
        let index = self.muxer.add_track(track.codec, track.extra_data.clone())?;
        if track.media_type == MediaType::Video {
            self.has_video = true;
        }
        self.tracks.push(track);
        Ok(index)
    }

    fn write_header(&mut self) -> Result<()> {
        if self.failed {
            return Err(Error::Mux("hls sink is stopped".into()));
        }
        if self.context.is_some() {
            return Ok(());
        }
        self.create_segment()
    }

    fn input(&mut self, packet: &MediaPacket) -> Result<InputResult> {
        if self.failed {
            return Err(Error::Mux("hls sink is stopped".into()));
        }
        if packet.track_index >= self.muxer.track_count() {
            return Err(Error::TrackNotFound {
                index: packet.track_index,
            });
        }

        // Rotate once the muxed duration crosses the target. With a video
        // track only a keyframe may cut, so every segment starts
        // independently decodable; audio-only streams cut anywhere.
        let duration_reached = self.muxer.duration() >= self.segment_duration_ticks;
        let may_cut = !self.has_video || (packet.media_type == MediaType::Video && packet.key);
        if duration_reached && may_cut {
            if self.context.is_some() {
                self.flush_segment()?;
            }
            self.create_segment()?;
        }

        let pts = packet.pts_90k();
        let dts = packet.dts_90k();
        let context = self
            .context
            .as_mut()
            .ok_or_else(|| Error::Mux("no open segment; write_header not called".into()))?;
        self.muxer.input(
            &mut context.buffer,
            packet.track_index,
            &packet.payload,
            pts,
            dts,
            packet.key,
        )?;
        if let Some(track) = self.tracks.get_mut(packet.track_index) {
            track.observe(packet.pts, packet.dts);
        }

        Ok(InputResult::consumed())
    }

    fn attach_consumer(&mut self, id: SinkId, reply: PlaylistReply) {
        if self.playlist.len() > 1 {
            if reply.send(Some(Arc::clone(&self.playlist_text))).is_ok() {
                global_metrics().consumer_released();
            }
        } else {
            self.pending.insert(id, reply);
        }
    }

    fn close(&mut self) -> Result<InputResult> {
        let mut result: Result<()> = Ok(());
        if self.context.is_some() {
            result = self.flush_segment();
        }
        self.playlist_file = None;
        self.failed = true;

        // Whoever is still waiting gets an empty answer, never a hang.
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(None);
            global_metrics().consumer_unserved();
        }

        result.map(|_| InputResult::none())
    }

    fn end_state(&mut self) -> Option<StreamEndState> {
        Some(StreamEndState {
            playlist: self.playlist.clone(),
            playlist_text: Arc::clone(&self.playlist_text),
            last_sequence: self.last_sequence,
        })
    }
}

fn rewrite_in_place(file: &mut File, text: &str) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    file.write_all(text.as_bytes())
}

/// Register the HLS output factory with `registry`.
pub fn register_hls_output(registry: &mut OutputRegistry, config: HlsConfig) {
    registry.register(
        OutputProtocol::Hls,
        Box::new(move |ctx: &mut OutputContext| {
            let resume = ctx.resume.take();
            let sink = HlsTransStream::new(&ctx.stream_id, &config, resume)?;
            Ok(Box::new(sink) as Box<dyn TransStream>)
        }),
    );
}

/// Best-effort removal of numbered segment files left behind by a
/// previous run of the same stream. Returns how many were deleted.
pub fn remove_stale_segments(dir: &Path, prefix: &str) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(prefix)
            && name.ends_with(".ts")
            && fs::remove_file(entry.path()).is_ok()
        {
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "removed stale segments");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use streamgate_core::CodecId;
    use streamgate_mpegts::TS_PACKET_SIZE;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn test_config(root: &Path, duration_secs: u32, playlist_length: usize) -> HlsConfig {
        HlsConfig {
            root_dir: root.to_string_lossy().into_owned(),
            segment_duration_secs: duration_secs,
            playlist_length,
            segment_prefix: "seg_".to_string(),
            url_prefix: String::new(),
        }
    }

    fn video_packet(dts: i64, key: bool) -> MediaPacket {
        MediaPacket {
            track_index: 0,
            media_type: MediaType::Video,
            codec: CodecId::H264,
            key,
            pts: dts,
            dts,
            timebase: MPEG_TIMEBASE,
            payload: Bytes::from_static(&[0x65; 256]),
        }
    }

    fn audio_packet(dts: i64) -> MediaPacket {
        MediaPacket {
            track_index: 0,
            media_type: MediaType::Audio,
            codec: CodecId::Aac,
            key: true,
            pts: dts,
            dts,
            timebase: MPEG_TIMEBASE,
            payload: Bytes::from_static(&[0xFF; 64]),
        }
    }

    fn video_sink(config: &HlsConfig) -> HlsTransStream {
        let mut sink = HlsTransStream::new("cam-1", config, None).unwrap();
        sink.add_track(Track::new(CodecId::H264, Bytes::new(), MPEG_TIMEBASE, 0, 0))
            .unwrap();
        sink.write_header().unwrap();
        sink
    }

    fn audio_sink(config: &HlsConfig) -> HlsTransStream {
        let mut sink = HlsTransStream::new("mic-1", config, None).unwrap();
        sink.add_track(Track::new(CodecId::Aac, Bytes::new(), MPEG_TIMEBASE, 0, 0))
            .unwrap();
        sink.write_header().unwrap();
        sink
    }

    const FRAME_TICKS: i64 = 18_000; // 0.2 s at 90 kHz

    #[test]
    fn rotation_waits_for_keyframes() {
        let dir = tempdir().unwrap();
        // Keyframe every 10 frames of 0.2 s = one keyframe per 2 s,
        // which is exactly the segment duration.
        let config = test_config(dir.path(), 2, 10);
        let mut sink = video_sink(&config);

        let mut rotations = Vec::new();
        for frame in 0..30i64 {
            let before = sink.playlist.len();
            sink.input(&video_packet(frame * FRAME_TICKS, frame % 10 == 0))
                .unwrap();
            if sink.playlist.len() > before {
                rotations.push(frame);
            }
        }

        // Each keyframe past the threshold cut exactly once; nothing else
        // did, even though the duration stayed past the threshold for
        // every non-keyframe that followed it.
        assert_eq!(rotations, vec![10, 20]);

        sink.close().unwrap();
        assert_eq!(sink.playlist.len(), 3);
    }

    #[test]
    fn rotation_deferred_past_threshold_until_keyframe() {
        let dir = tempdir().unwrap();
        // Segment duration shorter than the keyframe interval: the
        // threshold is crossed mid-GOP but the cut waits for the keyframe.
        let config = test_config(dir.path(), 1, 10);
        let mut sink = video_sink(&config);

        let mut rotations = Vec::new();
        for frame in 0..25i64 {
            let before = sink.playlist.len();
            sink.input(&video_packet(frame * FRAME_TICKS, frame % 10 == 0))
                .unwrap();
            if sink.playlist.len() > before {
                rotations.push(frame);
            }
        }

        assert_eq!(rotations, vec![10, 20]);
        sink.close().unwrap();
    }

    #[test]
    fn audio_only_rotates_without_keyframe_gate() {
        let dir = tempdir().unwrap();
        // Concrete scenario: segment duration 2 units, packets every
        // 0.25 units for 4 units of presentation time.
        let config = test_config(dir.path(), 2, 5);
        let mut sink = audio_sink(&config);

        let quarter = i64::from(MPEG_TIMEBASE) / 4;
        let mut mid_stream_rotations = 0;
        for i in 0..16i64 {
            let before = sink.playlist.len();
            sink.input(&audio_packet(i * quarter)).unwrap();
            if sink.playlist.len() > before {
                mid_stream_rotations += 1;
            }
        }
        sink.close().unwrap();

        assert_eq!(mid_stream_rotations + 1, 2, "exactly two rotations");
        assert_eq!(sink.playlist.len(), 2);
    }

    #[test]
    fn retention_bound_deletes_oldest_file() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 1, 3);
        let mut sink = audio_sink(&config);

        // One packet per second: every other packet crosses the duration
        // threshold, so 13 packets produce 7 segments against a bound of 3.
        for i in 0..13i64 {
            sink.input(&audio_packet(i * i64::from(MPEG_TIMEBASE)))
                .unwrap();
        }
        sink.close().unwrap();

        assert_eq!(sink.playlist.len(), 3);
        let stream_dir = dir.path().join("mic-1");
        for evicted in [1u64, 2, 3, 4] {
            assert!(
                !stream_dir.join(format!("seg_{evicted:05}.ts")).exists(),
                "evicted segment {evicted} still on disk"
            );
        }
        for retained in [5u64, 6, 7] {
            assert!(
                stream_dir.join(format!("seg_{retained:05}.ts")).exists(),
                "retained segment {retained} missing"
            );
        }
    }

    #[test]
    fn pending_consumer_released_on_second_segment() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 1, 5);
        let mut sink = audio_sink(&config);

        let (reply, mut rx) = tokio::sync::oneshot::channel();
        sink.attach_consumer(Uuid::new_v4(), reply);

        // First segment completes: consumer still waiting.
        sink.input(&audio_packet(0)).unwrap();
        sink.input(&audio_packet(90_000)).unwrap();
        sink.input(&audio_packet(180_000)).unwrap(); // rotation #1
        assert!(rx.try_recv().is_err(), "released after a single segment");

        // Second segment completes: released exactly once with content.
        sink.input(&audio_packet(270_000)).unwrap();
        sink.input(&audio_packet(360_000)).unwrap(); // rotation #2
        let playlist = rx
            .try_recv()
            .expect("consumer not released")
            .expect("expected playlist content");
        let text = playlist.read().unwrap().clone();
        assert!(text.contains("seg_00001.ts"));
        assert!(text.contains("seg_00002.ts"));

        // A consumer attaching now is served immediately.
        let (reply, mut rx) = tokio::sync::oneshot::channel();
        sink.attach_consumer(Uuid::new_v4(), reply);
        assert!(rx.try_recv().unwrap().is_some());

        sink.close().unwrap();
    }

    #[test]
    fn close_before_ready_answers_empty() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 2, 5);
        let mut sink = audio_sink(&config);

        let (reply, mut rx) = tokio::sync::oneshot::channel();
        sink.attach_consumer(Uuid::new_v4(), reply);

        sink.input(&audio_packet(0)).unwrap();
        sink.close().unwrap();

        assert!(
            rx.try_recv().expect("consumer left hanging").is_none(),
            "expected an empty notification"
        );

        // Close is idempotent-safe and the sink refuses further input.
        sink.close().unwrap();
        assert!(sink.input(&audio_packet(90_000)).is_err());
    }

    #[test]
    fn unknown_track_is_rejected_without_state_change() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 2, 5);
        let mut sink = audio_sink(&config);
        sink.input(&audio_packet(0)).unwrap();

        let duration_before = sink.muxer.duration();
        let mut bad = audio_packet(22_500);
        bad.track_index = 7;
        let err = sink.input(&bad).unwrap_err();
        assert!(matches!(err, Error::TrackNotFound { index: 7 }));
        assert_eq!(sink.muxer.duration(), duration_before);
        assert_eq!(sink.playlist.len(), 0);

        // The sink keeps running for valid packets.
        sink.input(&audio_packet(22_500)).unwrap();
        sink.close().unwrap();
    }

    #[test]
    fn playlist_file_is_persisted() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 1, 5);
        let mut sink = audio_sink(&config);
        for i in 0..4i64 {
            sink.input(&audio_packet(i * i64::from(MPEG_TIMEBASE)))
                .unwrap();
        }
        sink.close().unwrap();

        let text = fs::read_to_string(dir.path().join("mic-1").join(PLAYLIST_FILE_NAME)).unwrap();
        assert!(text.starts_with("#EXTM3U"));
        assert!(text.contains("#EXTINF:"));
        assert!(text.contains("seg_00001.ts"));
    }

    #[test]
    fn segment_bytes_are_transport_packets() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 1, 5);
        let mut sink = audio_sink(&config);
        for i in 0..3i64 {
            sink.input(&audio_packet(i * i64::from(MPEG_TIMEBASE)))
                .unwrap();
        }
        sink.close().unwrap();

        let bytes = fs::read(dir.path().join("mic-1").join("seg_00001.ts")).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(bytes.len() % TS_PACKET_SIZE, 0);
        assert_eq!(bytes[0], 0x47);
    }

    #[test]
    fn name_collision_advances_sequence() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 2, 5);

        let stream_dir = dir.path().join("cam-1");
        fs::create_dir_all(&stream_dir).unwrap();
        fs::write(stream_dir.join("seg_00001.ts"), b"leftover").unwrap();

        let sink = video_sink(&config);
        assert_eq!(sink.context.as_ref().unwrap().sequence, 2);
        // The leftover file was not clobbered.
        assert_eq!(fs::read(stream_dir.join("seg_00001.ts")).unwrap(), b"leftover");
    }

    #[test]
    fn republish_resumes_sequence_numbering() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 1, 5);

        let mut first = audio_sink(&config);
        for i in 0..3i64 {
            first
                .input(&audio_packet(i * i64::from(MPEG_TIMEBASE)))
                .unwrap();
        }
        first.close().unwrap();
        let state = first.end_state().unwrap();
        let resumed_from = state.last_sequence;
        assert!(resumed_from >= 2);

        let mut second = HlsTransStream::new("mic-1", &config, Some(state)).unwrap();
        second
            .add_track(Track::new(CodecId::Aac, Bytes::new(), MPEG_TIMEBASE, 0, 0))
            .unwrap();
        second.write_header().unwrap();
        assert_eq!(
            second.context.as_ref().unwrap().sequence,
            resumed_from + 1,
            "republish must continue numbering"
        );
        // Prior entries are still in the shared playlist.
        assert!(!second.playlist.is_empty());
        second.close().unwrap();
    }

    #[test]
    fn stale_segments_are_removed() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("seg_00001.ts"), b"a").unwrap();
        fs::write(dir.path().join("seg_00002.ts"), b"b").unwrap();
        fs::write(dir.path().join("other.bin"), b"c").unwrap();

        assert_eq!(remove_stale_segments(dir.path(), "seg_"), 2);
        assert!(dir.path().join("other.bin").exists());
    }
}
