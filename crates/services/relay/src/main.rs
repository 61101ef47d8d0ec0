//! Relay gateway binary
//!
//! Entry point for the streamgate relay service.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streamgate_core::CodecId;
use streamgate_ingest_rtp::RtpUdpSource;
use streamgate_relay::{
    config::Config,
    hls::{register_hls_output, remove_stale_segments},
    hub::{OpaqueDepacketizer, StreamHub},
    metrics::global_metrics,
    registry::{OutputProtocol, OutputRegistry},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting streamgate relay...");

    // Load configuration
    let config_path = std::env::var("STREAMGATE_CONFIG").ok();
    let config = Config::load(config_path.as_deref())?;
    let config = Arc::new(config);

    tracing::info!(
        "Configuration: rtp_port={}, stream_id={}, hls_dir={}, segment_duration={}s, playlist_length={}",
        config.ingest.rtp_port,
        config.ingest.stream_id,
        config.hls.root_dir,
        config.hls.segment_duration_secs,
        config.hls.playlist_length
    );

    // Build the output registry once, up front
    let mut registry = OutputRegistry::new();
    register_hls_output(&mut registry, config.hls.clone());
    let registry = Arc::new(registry);

    let hub = Arc::new(StreamHub::new(
        Arc::clone(&registry),
        config.server.stream_queue,
    ));

    // Drop leftover segments from a previous run of the default stream
    let stream_dir =
        std::path::Path::new(&config.hls.root_dir).join(&config.ingest.stream_id);
    remove_stale_segments(&stream_dir, &config.hls.segment_prefix);

    // Publish the default ingest stream. The opaque depacketizer stands
    // in where a protocol-specific payload parser would plug in.
    let input_tx = hub
        .publish(
            &config.ingest.stream_id,
            &[OutputProtocol::Hls],
            vec![streamgate_core::Track::new(
                CodecId::Aac,
                bytes::Bytes::new(),
                streamgate_core::MPEG_TIMEBASE,
                0,
                0,
            )],
            Box::new(OpaqueDepacketizer::new(
                CodecId::Aac,
                streamgate_core::MPEG_TIMEBASE,
            )),
        )
        .await?;

    // Bind the RTP listener; its receive thread feeds the stream actor.
    let bind_addr: SocketAddr =
        format!("{}:{}", config.server.host, config.ingest.rtp_port).parse()?;
    let source = RtpUdpSource::bind(bind_addr, config.ingest.source_config(), input_tx)?;

    tracing::info!(addr = %source.local_addr(), "relay ready");

    // Run until SIGTERM/SIGINT
    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining streams...");

    // Teardown order: flush the reorder buffer and detach its handler
    // first, then stop the per-stream actors so no delivery lands in a
    // closed sink.
    let stats = source.jitter_stats();
    tokio::task::spawn_blocking(move || source.close()).await?;
    hub.shutdown().await;

    let snapshot = global_metrics().snapshot();
    tracing::info!(
        received = stats.received,
        delivered = stats.delivered,
        lost = stats.lost,
        segments_written = snapshot.segments_written,
        "streamgate relay shutdown complete"
    );
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
