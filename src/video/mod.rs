//! Video pictures, scaling and display
//!
//! Geometry and layout helpers, the YUV420P to RGB565 scaler, render target
//! abstractions, and the two video filters that use them: a color bar
//! source and a display sink.

pub mod display;
pub mod geometry;
pub mod scale;
pub mod target;
pub mod test_pattern;

pub use display::DisplayFilter;
pub use geometry::{fit_centered, PixelFormat, Rect, VideoGeometry};
pub use scale::{yuv_to_rgb565, ScaleContext};
pub use target::{
    HeadlessPlatform, MemoryBitmap, PixelGuard, PlatformContext, RenderTarget, TargetInfo,
};
pub use test_pattern::TestPatternSource;
