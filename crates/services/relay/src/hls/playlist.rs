//! Bounded live playlist
//!
//! Holds the most recent completed segments and renders them as an HLS
//! media playlist. Appending past the bound evicts the oldest entry and
//! returns it so the caller can pair the eviction with deleting the
//! segment file.

use std::collections::VecDeque;
use std::path::PathBuf;

/// One completed segment retained in the live playlist
#[derive(Debug, Clone)]
pub struct SegmentEntry {
    /// Monotonic segment sequence number
    pub sequence: u64,

    /// Muxed duration in seconds
    pub duration: f32,

    /// URL the playlist references the segment by
    pub url: String,

    /// Absolute path of the segment file on disk
    pub path: PathBuf,
}

/// Bounded, ordered list of completed segments
#[derive(Debug, Clone)]
pub struct PlaylistWriter {
    capacity: usize,
    segments: VecDeque<SegmentEntry>,
}

impl PlaylistWriter {
    /// Create a playlist bounded to `capacity` segments
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            segments: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a completed segment; returns the evicted oldest entry when
    /// the playlist was already at capacity.
    pub fn push(&mut self, entry: SegmentEntry) -> Option<SegmentEntry> {
        self.segments.push_back(entry);
        if self.segments.len() > self.capacity {
            self.segments.pop_front()
        } else {
            None
        }
    }

    /// Number of retained segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the playlist holds no segments yet
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Entry at `index`, oldest first
    pub fn get(&self, index: usize) -> Option<&SegmentEntry> {
        self.segments.get(index)
    }

    /// Sequence number of the newest retained segment
    pub fn last_sequence(&self) -> Option<u64> {
        self.segments.back().map(|s| s.sequence)
    }

    /// Render the playlist as m3u8 text
    pub fn render(&self) -> String {
        let target_duration = self
            .segments
            .iter()
            .map(|s| s.duration.ceil() as u32)
            .max()
            .unwrap_or(1);
        let media_sequence = self.segments.front().map(|s| s.sequence).unwrap_or(0);

        let mut out = String::with_capacity(128 + self.segments.len() * 64);
        out.push_str("#EXTM3U\n");
        out.push_str("#EXT-X-VERSION:3\n");
        out.push_str(&format!("#EXT-X-TARGETDURATION:{target_duration}\n"));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}\n"));
        for segment in &self.segments {
            out.push_str(&format!("#EXTINF:{:.3},\n", segment.duration));
            out.push_str(&segment.url);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sequence: u64) -> SegmentEntry {
        SegmentEntry {
            sequence,
            duration: 2.0,
            url: format!("seg_{sequence:05}.ts"),
            path: PathBuf::from(format!("/tmp/seg_{sequence:05}.ts")),
        }
    }

    #[test]
    fn bound_is_enforced_with_eviction() {
        let mut playlist = PlaylistWriter::new(3);
        for sequence in 1..=3 {
            assert!(playlist.push(entry(sequence)).is_none());
        }
        assert_eq!(playlist.len(), 3);

        let evicted = playlist.push(entry(4)).expect("oldest entry evicted");
        assert_eq!(evicted.sequence, 1);
        assert_eq!(playlist.len(), 3);
        assert_eq!(playlist.get(0).unwrap().sequence, 2);
        assert_eq!(playlist.last_sequence(), Some(4));
    }

    #[test]
    fn render_lists_segments_in_order() {
        let mut playlist = PlaylistWriter::new(5);
        playlist.push(SegmentEntry {
            sequence: 7,
            duration: 2.5,
            url: "seg_00007.ts".to_string(),
            path: PathBuf::from("seg_00007.ts"),
        });
        playlist.push(SegmentEntry {
            sequence: 8,
            duration: 1.96,
            url: "seg_00008.ts".to_string(),
            path: PathBuf::from("seg_00008.ts"),
        });

        let text = playlist.render();
        assert!(text.starts_with("#EXTM3U\n"));
        assert!(text.contains("#EXT-X-TARGETDURATION:3\n"));
        assert!(text.contains("#EXT-X-MEDIA-SEQUENCE:7\n"));
        assert!(text.contains("#EXTINF:2.500,\nseg_00007.ts\n"));
        assert!(text.contains("#EXTINF:1.960,\nseg_00008.ts\n"));
        let pos7 = text.find("seg_00007").unwrap();
        let pos8 = text.find("seg_00008").unwrap();
        assert!(pos7 < pos8);
    }

    #[test]
    fn media_sequence_advances_as_entries_fall_off() {
        let mut playlist = PlaylistWriter::new(2);
        for sequence in 1..=4 {
            playlist.push(entry(sequence));
        }
        assert!(playlist.render().contains("#EXT-X-MEDIA-SEQUENCE:3\n"));
    }
}
