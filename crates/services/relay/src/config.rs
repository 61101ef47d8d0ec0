//! Configuration for the relay gateway
//!
//! Configuration can be loaded from a TOML file and/or environment
//! variables. Reorder-window and gap-timeout tuning deliberately lives
//! here rather than in code: the right values depend on the network the
//! gateway is deployed against.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use streamgate_ingest_rtp::{JitterConfig, RtpSourceConfig};

/// Main configuration for the relay gateway
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// RTP ingest configuration
    #[serde(default)]
    pub ingest: IngestConfig,

    /// HLS output configuration
    #[serde(default)]
    pub hls: HlsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind ingest sockets to
    #[serde(default = "default_host")]
    pub host: String,

    /// Capacity of each stream's serialized input queue
    #[serde(default = "default_stream_queue")]
    pub stream_queue: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_stream_queue() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            stream_queue: default_stream_queue(),
        }
    }
}

/// RTP ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// UDP port the default ingest stream listens on
    #[serde(default = "default_rtp_port")]
    pub rtp_port: u16,

    /// Stream id published by the default ingest listener
    #[serde(default = "default_stream_id")]
    pub stream_id: String,

    /// Size of each receive-pool block; sized to the transport MTU
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Number of receive-pool blocks
    #[serde(default = "default_block_count")]
    pub block_count: usize,

    /// Reorder window in sequence numbers
    #[serde(default = "default_reorder_window")]
    pub reorder_window: u16,

    /// Maximum packets buffered out of order
    #[serde(default = "default_reorder_capacity")]
    pub reorder_capacity: usize,

    /// How long a sequence gap may stay open, in milliseconds
    #[serde(default = "default_gap_timeout_ms")]
    pub gap_timeout_ms: u64,
}

fn default_rtp_port() -> u16 {
    30000
}

fn default_stream_id() -> String {
    "live".to_string()
}

fn default_block_size() -> usize {
    1500
}

fn default_block_count() -> usize {
    300
}

fn default_reorder_window() -> u16 {
    512
}

fn default_reorder_capacity() -> usize {
    1024
}

fn default_gap_timeout_ms() -> u64 {
    300
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            rtp_port: default_rtp_port(),
            stream_id: default_stream_id(),
            block_size: default_block_size(),
            block_count: default_block_count(),
            reorder_window: default_reorder_window(),
            reorder_capacity: default_reorder_capacity(),
            gap_timeout_ms: default_gap_timeout_ms(),
        }
    }
}

impl IngestConfig {
    /// Adapter-level configuration derived from this section
    pub fn source_config(&self) -> RtpSourceConfig {
        RtpSourceConfig {
            block_size: self.block_size,
            block_count: self.block_count,
            jitter: JitterConfig {
                window: self.reorder_window,
                capacity: self.reorder_capacity,
                gap_timeout: Duration::from_millis(self.gap_timeout_ms),
            },
        }
    }
}

/// HLS output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsConfig {
    /// Directory that holds one subdirectory per stream
    #[serde(default = "default_root_dir")]
    pub root_dir: String,

    /// Target duration of one segment, in seconds
    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u32,

    /// Maximum number of segments retained in the live playlist
    #[serde(default = "default_playlist_length")]
    pub playlist_length: usize,

    /// Segment file name prefix; files are `{prefix}{seq:05}.ts`
    #[serde(default = "default_segment_prefix")]
    pub segment_prefix: String,

    /// Prefix for segment URLs in the playlist; empty means relative
    #[serde(default)]
    pub url_prefix: String,
}

fn default_root_dir() -> String {
    "./hls".to_string()
}

fn default_segment_duration() -> u32 {
    2
}

fn default_playlist_length() -> usize {
    5
}

fn default_segment_prefix() -> String {
    "seg_".to_string()
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            segment_duration_secs: default_segment_duration(),
            playlist_length: default_playlist_length(),
            segment_prefix: default_segment_prefix(),
            url_prefix: String::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(host) = std::env::var("STREAMGATE_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("STREAMGATE_RTP_PORT") {
            if let Ok(p) = port.parse() {
                config.ingest.rtp_port = p;
            }
        }
        if let Ok(id) = std::env::var("STREAMGATE_STREAM_ID") {
            config.ingest.stream_id = id;
        }
        if let Ok(dir) = std::env::var("STREAMGATE_HLS_DIR") {
            config.hls.root_dir = dir;
        }
        if let Ok(duration) = std::env::var("STREAMGATE_SEGMENT_DURATION") {
            if let Ok(d) = duration.parse() {
                config.hls.segment_duration_secs = d;
            }
        }
        if let Ok(length) = std::env::var("STREAMGATE_PLAYLIST_LENGTH") {
            if let Ok(l) = length.parse() {
                config.hls.playlist_length = l;
            }
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ingest.rtp_port, 30000);
        assert_eq!(config.ingest.reorder_window, 512);
        assert_eq!(config.hls.segment_duration_secs, 2);
        assert_eq!(config.hls.playlist_length, 5);
        assert_eq!(config.hls.segment_prefix, "seg_");
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
[server]
stream_queue = 64

[ingest]
rtp_port = 31000
reorder_window = 128
gap_timeout_ms = 150

[hls]
root_dir = "/var/lib/streamgate/hls"
segment_duration_secs = 4
playlist_length = 8
url_prefix = "https://cdn.example.com/live/"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.stream_queue, 64);
        assert_eq!(config.ingest.rtp_port, 31000);
        assert_eq!(config.ingest.reorder_window, 128);
        assert_eq!(config.hls.segment_duration_secs, 4);
        assert_eq!(config.hls.playlist_length, 8);
        assert_eq!(config.hls.url_prefix, "https://cdn.example.com/live/");
        // Untouched sections keep their defaults
        assert_eq!(config.ingest.block_size, 1500);
    }

    #[test]
    fn test_source_config_conversion() {
        let mut config = Config::default();
        config.ingest.reorder_window = 64;
        config.ingest.gap_timeout_ms = 50;

        let source = config.ingest.source_config();
        assert_eq!(source.jitter.window, 64);
        assert_eq!(source.jitter.gap_timeout, Duration::from_millis(50));
        assert_eq!(source.block_size, 1500);
    }
}
