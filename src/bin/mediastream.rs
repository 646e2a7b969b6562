//! Media Stream Application
//!
//! Runs one audio (or, with `--video`, one video) stream against the remote
//! described in the configuration file until Ctrl+C.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_stream_engine::{
    config::{EngineConfig, StreamConfig},
    rtp,
    video::{HeadlessPlatform, MemoryBitmap, RenderTarget},
    MediaStream, StreamFilters, StreamKind,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut kind = StreamKind::Audio;
    let mut path: Option<PathBuf> = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--video" => kind = StreamKind::Video,
            _ => path = Some(PathBuf::from(arg)),
        }
    }

    let config = load_config(path)?;
    let mut stream_config = match kind {
        StreamKind::Audio => config.audio.clone(),
        StreamKind::Video => config.video.clone(),
    };
    if !stream_config.ipv6 {
        stream_config.ipv6 = rtp::is_ipv6(&stream_config.remote_host);
    }

    tracing::info!("Starting {} stream to {}", kind, stream_config.remote_host);
    let mut stream = build_stream(kind, &stream_config)?;

    if let Some(srtp) = &config.srtp {
        stream
            .enable_srtp_from_config(srtp)
            .context("Failed to enable SRTP")?;
    }

    tracing::info!("Streaming - press Ctrl+C to stop");
    let mut interval = tokio::time::interval(Duration::from_millis(50));
    let mut last_report = tokio::time::Instant::now();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                stream.iterate();
                if last_report.elapsed() >= Duration::from_secs(10) {
                    let stats = serde_json::to_string(&stream.local_rtp_stats())?;
                    tracing::info!("RTP stats: {}", stats);
                    last_report = tokio::time::Instant::now();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    stream.free();
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    let path = path.or_else(EngineConfig::default_path);
    match path {
        Some(path) if path.exists() => EngineConfig::load(&path)
            .with_context(|| format!("Failed to load {}", path.display())),
        Some(path) => {
            let config = EngineConfig::default();
            match config.save(&path) {
                Ok(()) => tracing::info!("Wrote default configuration to {}", path.display()),
                Err(e) => tracing::warn!("Could not write {}: {}", path.display(), e),
            }
            Ok(config)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn build_stream(kind: StreamKind, config: &StreamConfig) -> Result<MediaStream> {
    let mut stream = match kind {
        StreamKind::Audio => MediaStream::new_audio(config)?,
        StreamKind::Video => MediaStream::new_video(config)?,
    };

    let filters = match kind {
        StreamKind::Audio => audio_filters(config)?,
        StreamKind::Video => StreamFilters::video_default(config, Arc::new(HeadlessPlatform)),
    };
    stream.start(
        &config.remote_host,
        config.remote_rtp_port,
        config.remote_rtcp_port,
        filters,
    )?;

    if kind == StreamKind::Video {
        let window: Arc<dyn RenderTarget> = Arc::new(MemoryBitmap::new(
            config.video_size.width,
            config.video_size.height,
        ));
        stream.set_native_window(Some(window))?;
    }
    Ok(stream)
}

#[cfg(feature = "opus-codec")]
fn audio_filters(config: &StreamConfig) -> Result<StreamFilters> {
    Ok(StreamFilters::audio_default(config)?)
}

#[cfg(not(feature = "opus-codec"))]
fn audio_filters(_config: &StreamConfig) -> Result<StreamFilters> {
    anyhow::bail!("audio streams need the opus-codec feature")
}
