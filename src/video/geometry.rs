//! Video geometry and layout helpers

use serde::{Deserialize, Serialize};

/// Pixel formats understood by the video filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Planar YUV 4:2:0 (Y plane, then U plane, then V plane)
    Yuv420p,
    /// 16-bit packed RGB (5-6-5), little endian
    Rgb565,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Yuv420p => None,
            PixelFormat::Rgb565 => Some(2),
        }
    }
}

/// Picture dimensions plus row stride (in bytes for packed formats,
/// luma bytes for planar ones)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
}

impl VideoGeometry {
    /// CIF, the default display size
    pub const CIF: VideoGeometry = VideoGeometry::new(352, 288);

    /// QCIF
    pub const QCIF: VideoGeometry = VideoGeometry::new(176, 144);

    /// VGA
    pub const VGA: VideoGeometry = VideoGeometry::new(640, 480);

    /// Geometry with a tightly packed luma stride
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            stride: width,
        }
    }

    pub const fn with_stride(width: u32, height: u32, stride: u32) -> Self {
        Self {
            width,
            height,
            stride,
        }
    }

    /// Whether the geometry can hold a YUV 4:2:0 picture
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.width % 2 == 0
            && self.height % 2 == 0
            && self.stride >= self.width
    }

    /// Same visible size, ignoring stride
    pub fn same_size(&self, other: &VideoGeometry) -> bool {
        self.width == other.width && self.height == other.height
    }

    /// Buffer size of a YUV 4:2:0 picture with this geometry
    pub fn yuv420p_len(&self) -> usize {
        let luma = self.stride as usize * self.height as usize;
        let chroma = (self.stride as usize / 2) * (self.height as usize / 2);
        luma + 2 * chroma
    }
}

impl Default for VideoGeometry {
    fn default() -> Self {
        Self::CIF
    }
}

/// Rectangle inside a window, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Fit a picture into a window keeping its aspect ratio, centered.
///
/// Resulting width and height are rounded down to even values so the
/// scaler can walk 2x2 chroma blocks.
pub fn fit_centered(window: (u32, u32), picture: (u32, u32)) -> Rect {
    let (ww, wh) = window;
    let (pw, ph) = picture;

    if ww == 0 || wh == 0 || pw == 0 || ph == 0 {
        return Rect::default();
    }

    // Compare aspect ratios with cross multiplication
    let (mut w, mut h) = if (pw as u64) * (wh as u64) >= (ph as u64) * (ww as u64) {
        let h = ((ph as u64 * ww as u64) / pw as u64) as u32;
        (ww, h)
    } else {
        let w = ((pw as u64 * wh as u64) / ph as u64) as u32;
        (w, wh)
    };
    w &= !1;
    h &= !1;

    Rect {
        x: (ww - w) / 2,
        y: (wh - h) / 2,
        width: w,
        height: h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv_len() {
        let g = VideoGeometry::new(4, 2);
        assert_eq!(g.yuv420p_len(), 8 + 2 + 2);
        assert_eq!(VideoGeometry::CIF.yuv420p_len(), 352 * 288 * 3 / 2);
    }

    #[test]
    fn test_validity() {
        assert!(VideoGeometry::CIF.is_valid());
        assert!(!VideoGeometry::new(0, 288).is_valid());
        assert!(!VideoGeometry::new(351, 288).is_valid());
        assert!(!VideoGeometry::with_stride(352, 288, 100).is_valid());
    }

    #[test]
    fn test_fit_letterbox() {
        // 4:3 picture in a 16:9 window: pillarbox
        let rect = fit_centered((1280, 720), (640, 480));
        assert_eq!(rect.height, 720);
        assert_eq!(rect.width, 960);
        assert_eq!(rect.x, 160);
        assert_eq!(rect.y, 0);

        // 16:9 picture in a square window: letterbox
        let rect = fit_centered((400, 400), (1280, 720));
        assert_eq!(rect.width, 400);
        assert_eq!(rect.height, 224);
        assert_eq!(rect.y, 88);
    }

    #[test]
    fn test_fit_degenerate() {
        assert_eq!(fit_centered((0, 10), (10, 10)), Rect::default());
    }
}
