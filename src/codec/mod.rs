//! Codec filters
//!
//! Opus for audio (behind the `opus-codec` feature) and an uncompressed
//! picture packetizer for video.

#[cfg(feature = "opus-codec")]
pub mod decoder;
#[cfg(feature = "opus-codec")]
pub mod encoder;
pub mod raw_video;

#[cfg(feature = "opus-codec")]
pub use decoder::{OpusDecoder, OpusDecoderFilter};
#[cfg(feature = "opus-codec")]
pub use encoder::{OpusEncoder, OpusEncoderFilter, OpusParams};
pub use raw_video::{fragment_count, RawVideoDecoder, RawVideoEncoder};
