//! # Media Stream Engine
//!
//! Real-time audio/video streaming over RTP with a tick-driven filter graph.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         MediaStream (stream)                              │
//! │                                                                          │
//! │   ┌──────────────────────── FilterGraph (graph) ───────────────────────┐ │
//! │   │                                                                    │ │
//! │   │  ┌────────┐   ┌─────────┐   ┌──────────┐                           │ │
//! │   │  │ Source │──▶│ Encoder │──▶│ RTP send │──┐                        │ │
//! │   │  └────────┘   └─────────┘   └──────────┘  │                        │ │
//! │   │                                           ▼                        │ │
//! │   │                                   ┌──────────────┐   UDP (RTP)     │ │
//! │   │                                   │  RtpSession  │◀═══════════════▶│ │
//! │   │                                   │  (rtp)       │   UDP (RTCP)    │ │
//! │   │                                   └──────────────┘                 │ │
//! │   │                                    │  ▲ SRTP transports (srtp)     │ │
//! │   │                                    ▼  │                            │ │
//! │   │  ┌────────┐   ┌─────────┐   ┌──────────┐                           │ │
//! │   │  │  Sink  │◀──│ Decoder │◀──│ RTP recv │                           │ │
//! │   │  └────────┘   └─────────┘   └──────────┘                           │ │
//! │   └────────────────────────────────────────────────────────────────────┘ │
//! │          ▲                                                               │
//! │          │ process() every period                                        │
//! │   ┌──────┴──────┐        ┌─────────────┐        ┌──────────────────────┐ │
//! │   │   Ticker    │        │ EventQueue  │───────▶│ AdaptiveController   │ │
//! │   │  (ticker)   │        │ (rtp)       │ RTCP   │ (control)            │ │
//! │   └─────────────┘        └─────────────┘        └──────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod filter;
pub mod filters;
pub mod graph;
pub mod rtp;
pub mod srtp;
pub mod stream;
pub mod ticker;
pub mod video;

pub use error::{Error, Result};
pub use filter::{Filter, FilterHandle, FilterMethod, MediaUnit};
pub use graph::FilterGraph;
pub use stream::{MediaStream, StreamFilters, StreamKind, StreamState};
pub use ticker::{Ticker, TickerPriority};

/// Engine-wide constants
pub mod constants {
    /// Largest RTP packet we receive or send
    pub const MAX_RTP_SIZE: usize = 1500;

    /// Capacity of every filter input queue (in media units)
    pub const QUEUE_CAPACITY: usize = 256;

    /// Default ticker period in milliseconds
    pub const DEFAULT_TICKER_PERIOD_MS: u64 = 10;

    /// RTCP report interval right after the session starts
    pub const RTCP_STARTUP_INTERVAL_MS: u64 = 2500;

    /// RTCP report interval once the startup reports are sent
    pub const RTCP_DEFAULT_INTERVAL_MS: u64 = 5000;

    /// Number of reports sent at the startup interval
    pub const RTCP_STARTUP_REPORTS: u32 = 2;

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (mono voice)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_AUDIO_BITRATE: u32 = 32_000;

    /// Default packet duration in milliseconds
    pub const DEFAULT_PTIME_MS: u32 = 20;

    /// RTP clock rate for video payloads
    pub const VIDEO_CLOCK_RATE: u32 = 90_000;

    /// Default video frame rate
    pub const DEFAULT_FPS: u32 = 15;

    /// Default jitter compensation in milliseconds
    pub const DEFAULT_JITTER_COMP_MS: u32 = 60;

    /// Dynamic payload type used for Opus
    pub const OPUS_PAYLOAD_TYPE: u8 = 111;

    /// Dynamic payload type used for raw test video
    pub const RAW_VIDEO_PAYLOAD_TYPE: u8 = 96;

    /// Port used when probing a host's address family
    pub const RESOLVE_PROBE_PORT: u16 = 8000;
}
