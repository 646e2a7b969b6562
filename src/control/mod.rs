//! Adaptive bitrate and jitter control
//!
//! Turns RTCP reception reports from the peer into encoder and session
//! adjustments.

pub mod adaptive;

pub use adaptive::{AdaptiveConfig, AdaptiveController, ControlAction};
