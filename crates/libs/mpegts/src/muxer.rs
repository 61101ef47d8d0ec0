//! Transport-stream packetization

use bytes::Bytes;
use streamgate_core::{CodecId, Error, MediaType, Result};

use crate::crc::crc32_mpeg2;
use crate::TsWriteTarget;

/// Fixed size of every transport-stream packet
pub const TS_PACKET_SIZE: usize = 188;

/// Payload capacity of a packet with no adaptation field
const PAYLOAD_MAX: usize = TS_PACKET_SIZE - 4;

const PID_PAT: u16 = 0x0000;
const PID_PMT: u16 = 0x1000;
const PID_ES_BASE: u16 = 0x0100;
const PROGRAM_NUMBER: u16 = 1;

/// ISO 13818-1 stream types for the codecs the gateway carries
fn stream_type(codec: CodecId) -> Option<u8> {
    match codec {
        CodecId::H264 => Some(0x1B),
        CodecId::H265 => Some(0x24),
        CodecId::Aac => Some(0x0F),
        // G.711 has no standard TS mapping; callers route it elsewhere.
        CodecId::G711a | CodecId::G711u => None,
    }
}

struct TsTrack {
    media_type: MediaType,
    stream_type: u8,
    /// PES stream id (0xE0 video, 0xC0 audio)
    stream_id: u8,
    pid: u16,
    continuity: u8,
    /// Out-of-band parameters prepended to every keyframe payload so each
    /// segment is decodable from its first access unit
    extra: Bytes,
}

/// MPEG-TS muxer for one segmented output
pub struct TsMuxer {
    tracks: Vec<TsTrack>,
    pat_continuity: u8,
    pmt_continuity: u8,
    /// First and latest decode timestamps muxed since the last reset,
    /// plus the last positive dts increment, all in 90 kHz ticks
    first_dts: Option<i64>,
    last_dts: i64,
    last_delta: i64,
}

impl TsMuxer {
    /// Create an empty muxer
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            pat_continuity: 0,
            pmt_continuity: 0,
            first_dts: None,
            last_dts: 0,
            last_delta: 0,
        }
    }

    /// Register a track, returning its index.
    ///
    /// Fails when the codec has no transport-stream mapping.
    pub fn add_track(&mut self, codec: CodecId, extra: Bytes) -> Result<usize> {
        let stream_type = stream_type(codec).ok_or_else(|| Error::UnsupportedCodec {
            codec: codec.name().to_string(),
            output: "mpegts".to_string(),
        })?;
        let index = self.tracks.len();
        let media_type = codec.media_type();
        let stream_id = match media_type {
            MediaType::Video => 0xE0,
            MediaType::Audio => 0xC0,
        };
        self.tracks.push(TsTrack {
            media_type,
            stream_type,
            stream_id,
            pid: PID_ES_BASE + index as u16,
            continuity: 0,
            extra,
        });
        Ok(index)
    }

    /// Number of registered tracks
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Whether any registered track is video
    pub fn has_video(&self) -> bool {
        self.tracks
            .iter()
            .any(|t| t.media_type == MediaType::Video)
    }

    /// Muxed duration since the last reset, in 90 kHz ticks.
    ///
    /// Spans first to latest decode timestamp plus the last frame's own
    /// duration, so N frames at a fixed interval report N intervals.
    pub fn duration(&self) -> i64 {
        match self.first_dts {
            Some(first) => self.last_dts - first + self.last_delta,
            None => 0,
        }
    }

    /// Zero the duration accounting for a fresh segment. Tracks and
    /// continuity counters carry over.
    pub fn reset(&mut self) {
        self.first_dts = None;
        self.last_dts = 0;
        self.last_delta = 0;
    }

    /// Write the program tables (PAT + PMT) that open a segment.
    pub fn write_header(&mut self, target: &mut dyn TsWriteTarget) -> Result<()> {
        if self.tracks.is_empty() {
            return Err(Error::Mux("write_header with no tracks".into()));
        }
        self.write_pat(target)?;
        self.write_pmt(target)?;
        Ok(())
    }

    /// Mux one access unit.
    ///
    /// Timestamps are 90 kHz. Fails with `TrackNotFound` before touching
    /// any state when `track_index` was never registered.
    pub fn input(
        &mut self,
        target: &mut dyn TsWriteTarget,
        track_index: usize,
        payload: &[u8],
        pts: i64,
        dts: i64,
        key: bool,
    ) -> Result<()> {
        if track_index >= self.tracks.len() {
            return Err(Error::TrackNotFound { index: track_index });
        }

        let pcr_pid = self.pcr_pid();
        let has_video = self.has_video();
        let (pid, stream_id, media_type, extra) = {
            let track = &self.tracks[track_index];
            (track.pid, track.stream_id, track.media_type, track.extra.clone())
        };

        let body_extra: &[u8] = if key && !extra.is_empty() { &extra } else { &[] };
        let mut pes = Vec::with_capacity(payload.len() + body_extra.len() + 19);
        write_pes_header(
            &mut pes,
            stream_id,
            body_extra.len() + payload.len(),
            pts,
            dts,
            media_type == MediaType::Video,
        );
        pes.extend_from_slice(body_extra);
        pes.extend_from_slice(payload);

        // PCR rides the clock track: every keyframe when video exists,
        // every access unit otherwise.
        let carries_pcr = pid == pcr_pid && (!has_video || key);
        let pcr = carries_pcr.then(|| dts.max(0) as u64);

        let mut remaining = &pes[..];
        let mut first = true;
        while !remaining.is_empty() {
            let dst = target.alloc(TS_PACKET_SIZE)?;
            let written = build_ts_packet(
                dst,
                pid,
                &mut self.tracks[track_index].continuity,
                first,
                if first { pcr } else { None },
                first && key,
                &mut remaining,
            );
            debug_assert_eq!(written, TS_PACKET_SIZE);
            target.commit(written);
            first = false;
        }

        // Duration accounting only after the access unit is fully muxed.
        match self.first_dts {
            None => {
                self.first_dts = Some(dts);
                self.last_dts = dts;
            }
            Some(_) if dts > self.last_dts => {
                self.last_delta = dts - self.last_dts;
                self.last_dts = dts;
            }
            Some(_) => {}
        }

        Ok(())
    }

    fn pcr_pid(&self) -> u16 {
        self.tracks
            .iter()
            .find(|t| t.media_type == MediaType::Video)
            .or(self.tracks.first())
            .map(|t| t.pid)
            .unwrap_or(PID_ES_BASE)
    }

    fn write_pat(&mut self, target: &mut dyn TsWriteTarget) -> Result<()> {
        let mut section = Vec::with_capacity(16);
        section.push(0x00); // table_id: PAT
        let body_len = 13u16; // fixed: header tail + one program + CRC
        section.push(0xB0 | (body_len >> 8) as u8);
        section.push(body_len as u8);
        section.extend_from_slice(&1u16.to_be_bytes()); // transport_stream_id
        section.push(0xC1); // version 0, current_next = 1
        section.push(0x00); // section_number
        section.push(0x00); // last_section_number
        section.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
        section.push(0xE0 | (PID_PMT >> 8) as u8);
        section.push(PID_PMT as u8);
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());

        self.write_psi(target, PID_PAT, &section, true)
    }

    fn write_pmt(&mut self, target: &mut dyn TsWriteTarget) -> Result<()> {
        let mut section = Vec::with_capacity(16 + self.tracks.len() * 5);
        section.push(0x02); // table_id: PMT
        let body_len = (13 + self.tracks.len() * 5) as u16;
        section.push(0xB0 | (body_len >> 8) as u8);
        section.push(body_len as u8);
        section.extend_from_slice(&PROGRAM_NUMBER.to_be_bytes());
        section.push(0xC1);
        section.push(0x00);
        section.push(0x00);
        let pcr_pid = self.pcr_pid();
        section.push(0xE0 | (pcr_pid >> 8) as u8);
        section.push(pcr_pid as u8);
        section.push(0xF0); // program_info_length = 0
        section.push(0x00);
        for track in &self.tracks {
            section.push(track.stream_type);
            section.push(0xE0 | (track.pid >> 8) as u8);
            section.push(track.pid as u8);
            section.push(0xF0); // ES_info_length = 0
            section.push(0x00);
        }
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());

        self.write_psi(target, PID_PMT, &section, false)
    }

    fn write_psi(
        &mut self,
        target: &mut dyn TsWriteTarget,
        pid: u16,
        section: &[u8],
        pat: bool,
    ) -> Result<()> {
        let dst = target.alloc(TS_PACKET_SIZE)?;
        let continuity = if pat {
            &mut self.pat_continuity
        } else {
            &mut self.pmt_continuity
        };
        dst[0] = 0x47;
        dst[1] = 0x40 | (pid >> 8) as u8; // payload_unit_start
        dst[2] = pid as u8;
        dst[3] = 0x10 | (*continuity & 0x0F);
        *continuity = continuity.wrapping_add(1);
        dst[4] = 0x00; // pointer_field
        dst[5..5 + section.len()].copy_from_slice(section);
        // PSI packets pad to the packet boundary with 0xFF.
        for byte in dst[5 + section.len()..].iter_mut() {
            *byte = 0xFF;
        }
        target.commit(TS_PACKET_SIZE);
        Ok(())
    }
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

/// Append a PES header carrying PTS (and DTS when it differs) to `out`.
fn write_pes_header(
    out: &mut Vec<u8>,
    stream_id: u8,
    body_len: usize,
    pts: i64,
    dts: i64,
    video: bool,
) {
    let both = dts != pts;
    let header_data_len: usize = if both { 10 } else { 5 };

    out.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
    let pes_len = body_len + 3 + header_data_len;
    if pes_len > 0xFFFF && video {
        // Unbounded PES length is only legal for video elementary streams.
        out.extend_from_slice(&[0x00, 0x00]);
    } else {
        out.extend_from_slice(&(pes_len.min(0xFFFF) as u16).to_be_bytes());
    }
    out.push(0x80); // marker bits
    out.push(if both { 0xC0 } else { 0x80 });
    out.push(header_data_len as u8);
    if both {
        write_pes_timestamp(out, 0x30, pts);
        write_pes_timestamp(out, 0x10, dts);
    } else {
        write_pes_timestamp(out, 0x20, pts);
    }
}

/// Encode a 33-bit timestamp in the 5-byte marker-bit format.
fn write_pes_timestamp(out: &mut Vec<u8>, prefix: u8, ts: i64) {
    let ts = ts.max(0) as u64 & 0x1_FFFF_FFFF;
    out.push(prefix | (((ts >> 30) as u8 & 0x07) << 1) | 1);
    out.push((ts >> 22) as u8);
    out.push((((ts >> 15) as u8 & 0x7F) << 1) | 1);
    out.push((ts >> 7) as u8);
    out.push(((ts as u8 & 0x7F) << 1) | 1);
}

/// Assemble one 188-byte packet, consuming from `remaining`. Returns the
/// bytes written (always the full packet size).
fn build_ts_packet(
    dst: &mut [u8],
    pid: u16,
    continuity: &mut u8,
    payload_start: bool,
    pcr: Option<u64>,
    random_access: bool,
    remaining: &mut &[u8],
) -> usize {
    // Adaptation field body (bytes after its length byte)
    let mut af: Vec<u8> = Vec::new();
    if pcr.is_some() || random_access {
        let mut flags = 0u8;
        if random_access {
            flags |= 0x40;
        }
        if pcr.is_some() {
            flags |= 0x10;
        }
        af.push(flags);
        if let Some(base) = pcr {
            af.extend_from_slice(&[
                (base >> 25) as u8,
                (base >> 17) as u8,
                (base >> 9) as u8,
                (base >> 1) as u8,
                (((base as u8) & 0x01) << 7) | 0x7E, // ext high bit + reserved
                0x00,
            ]);
        }
    }
    let mut af_present = !af.is_empty();

    let mut available = PAYLOAD_MAX - if af_present { 1 + af.len() } else { 0 };
    if remaining.len() < available {
        // Grow the adaptation field with stuffing so the payload lands
        // flush against the packet boundary.
        let mut deficit = available - remaining.len();
        if !af_present {
            af_present = true;
            deficit -= 1; // the length byte itself
            if deficit > 0 {
                af.push(0x00); // flags, nothing set
                deficit -= 1;
            }
        }
        af.extend(std::iter::repeat(0xFF).take(deficit));
        available = remaining.len();
    }

    dst[0] = 0x47;
    dst[1] = (if payload_start { 0x40 } else { 0x00 }) | (pid >> 8) as u8;
    dst[2] = pid as u8;
    dst[3] = (if af_present { 0x30 } else { 0x10 }) | (*continuity & 0x0F);
    *continuity = continuity.wrapping_add(1);

    let mut cursor = 4;
    if af_present {
        dst[cursor] = af.len() as u8;
        cursor += 1;
        dst[cursor..cursor + af.len()].copy_from_slice(&af);
        cursor += af.len();
    }
    let take = remaining.len().min(available);
    dst[cursor..cursor + take].copy_from_slice(&remaining[..take]);
    *remaining = &remaining[take..];

    TS_PACKET_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VecTarget;

    fn pid_of(packet: &[u8]) -> u16 {
        (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2])
    }

    fn assert_sync_aligned(bytes: &[u8]) {
        assert_eq!(bytes.len() % TS_PACKET_SIZE, 0, "not packet aligned");
        for packet in bytes.chunks(TS_PACKET_SIZE) {
            assert_eq!(packet[0], 0x47, "missing sync byte");
        }
    }

    #[test]
    fn header_emits_pat_then_pmt() {
        let mut muxer = TsMuxer::new();
        muxer.add_track(CodecId::H264, Bytes::new()).unwrap();
        muxer.add_track(CodecId::Aac, Bytes::new()).unwrap();

        let mut target = VecTarget::new();
        muxer.write_header(&mut target).unwrap();

        let bytes = target.bytes();
        assert_eq!(bytes.len(), 2 * TS_PACKET_SIZE);
        assert_sync_aligned(bytes);
        assert_eq!(pid_of(&bytes[..TS_PACKET_SIZE]), PID_PAT);
        assert_eq!(pid_of(&bytes[TS_PACKET_SIZE..]), PID_PMT);
        // PMT lists both stream types
        let pmt = &bytes[TS_PACKET_SIZE..];
        assert!(pmt.windows(1).any(|w| w[0] == 0x1B));
        assert!(pmt.windows(1).any(|w| w[0] == 0x0F));
    }

    #[test]
    fn header_without_tracks_is_an_error() {
        let mut muxer = TsMuxer::new();
        let mut target = VecTarget::new();
        assert!(muxer.write_header(&mut target).is_err());
    }

    #[test]
    fn g711_is_rejected() {
        let mut muxer = TsMuxer::new();
        let err = muxer.add_track(CodecId::G711a, Bytes::new()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCodec { .. }));
    }

    #[test]
    fn access_units_are_packetized_and_aligned() {
        let mut muxer = TsMuxer::new();
        let video = muxer.add_track(CodecId::H264, Bytes::new()).unwrap();
        let mut target = VecTarget::new();
        muxer.write_header(&mut target).unwrap();

        let payload = vec![0xABu8; 1000];
        muxer
            .input(&mut target, video, &payload, 3600, 3600, true)
            .unwrap();

        let bytes = target.bytes();
        assert_sync_aligned(bytes);

        // First ES packet starts a PES: PUSI set, video PID, start code
        // right after the adaptation field.
        let es_packets: Vec<&[u8]> = bytes
            .chunks(TS_PACKET_SIZE)
            .filter(|p| pid_of(p) == PID_ES_BASE)
            .collect();
        assert!(!es_packets.is_empty());
        let first = es_packets[0];
        assert_eq!(first[1] & 0x40, 0x40, "missing payload_unit_start");
        let af_len = if first[3] & 0x20 != 0 {
            1 + first[4] as usize
        } else {
            0
        };
        let payload_start = 4 + af_len;
        assert_eq!(
            &first[payload_start..payload_start + 4],
            &[0x00, 0x00, 0x01, 0xE0]
        );
        // Continuation packets do not restart a PES
        for packet in &es_packets[1..] {
            assert_eq!(packet[1] & 0x40, 0);
        }
    }

    #[test]
    fn keyframes_carry_extra_data_in_band() {
        let extra = Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x42]);
        let mut muxer = TsMuxer::new();
        let video = muxer.add_track(CodecId::H264, extra.clone()).unwrap();
        let mut target = VecTarget::new();
        muxer.write_header(&mut target).unwrap();
        muxer
            .input(&mut target, video, &[0xAA; 32], 0, 0, true)
            .unwrap();

        // The parameter-set bytes appear ahead of the frame payload.
        let bytes = target.bytes();
        let found = bytes
            .windows(extra.len())
            .any(|window| window == &extra[..]);
        assert!(found, "extra data not muxed in-band for keyframe");
    }

    #[test]
    fn unknown_track_fails_without_output() {
        let mut muxer = TsMuxer::new();
        muxer.add_track(CodecId::Aac, Bytes::new()).unwrap();
        let mut target = VecTarget::new();

        let err = muxer
            .input(&mut target, 9, &[0u8; 16], 0, 0, false)
            .unwrap_err();
        assert!(matches!(err, Error::TrackNotFound { index: 9 }));
        assert!(target.bytes().is_empty(), "failed input must not write");
        assert_eq!(muxer.duration(), 0);
    }

    #[test]
    fn duration_spans_first_to_last_plus_frame() {
        let mut muxer = TsMuxer::new();
        let track = muxer.add_track(CodecId::Aac, Bytes::new()).unwrap();
        let mut target = VecTarget::new();

        for i in 0..4i64 {
            muxer
                .input(&mut target, track, &[0u8; 64], i * 1800, i * 1800, false)
                .unwrap();
        }
        // 4 frames at 1800 ticks: 3 intervals + one trailing frame
        assert_eq!(muxer.duration(), 3 * 1800 + 1800);

        muxer.reset();
        assert_eq!(muxer.duration(), 0);
    }

    #[test]
    fn small_payload_fits_one_stuffed_packet() {
        let mut muxer = TsMuxer::new();
        let track = muxer.add_track(CodecId::Aac, Bytes::new()).unwrap();
        let mut target = VecTarget::new();
        muxer
            .input(&mut target, track, &[0x55; 8], 1234, 1234, false)
            .unwrap();

        let bytes = target.bytes();
        assert_eq!(bytes.len(), TS_PACKET_SIZE);
        assert_sync_aligned(bytes);
        // Audio-only stream: the PES start carries a PCR.
        assert_eq!(bytes[3] & 0x20, 0x20, "expected adaptation field");
        assert_eq!(bytes[5] & 0x10, 0x10, "expected PCR flag");
    }
}
