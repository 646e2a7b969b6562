//! YUV420P to RGB565 scaling

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::FilterError;
use crate::video::VideoGeometry;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Convert one BT.601 YUV sample to packed RGB565.
///
/// Fixed-point coefficients are scaled by 1024.
#[inline]
pub fn yuv_to_rgb565(y: u8, u: u8, v: u8) -> u16 {
    let y = y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;

    let r = (y + ((1436 * v) >> 10)).clamp(0, 255) as u16;
    let g = (y - ((352 * u + 731 * v) >> 10)).clamp(0, 255) as u16;
    let b = (y + ((1815 * u) >> 10)).clamp(0, 255) as u16;

    ((r >> 3) << 11) | ((g >> 2) << 5) | (b >> 3)
}

/// Scaling context for one source geometry and one destination size.
///
/// Row and column lookup tables are computed once; a context must be
/// discarded as soon as either side changes.
#[derive(Debug)]
pub struct ScaleContext {
    id: u64,
    src: VideoGeometry,
    dst_width: u32,
    dst_height: u32,
    x_map: Vec<u32>,
    y_map: Vec<u32>,
}

impl ScaleContext {
    pub fn new(src: VideoGeometry, dst_width: u32, dst_height: u32) -> Result<Self, FilterError> {
        if !src.is_valid() {
            return Err(FilterError::Conversion(format!(
                "invalid source geometry {}x{} stride {}",
                src.width, src.height, src.stride
            )));
        }
        if dst_width == 0 || dst_height == 0 {
            return Err(FilterError::Conversion(format!(
                "invalid destination size {}x{}",
                dst_width, dst_height
            )));
        }

        let x_map = (0..dst_width)
            .map(|x| (x as u64 * src.width as u64 / dst_width as u64) as u32)
            .collect();
        let y_map = (0..dst_height)
            .map(|y| (y as u64 * src.height as u64 / dst_height as u64) as u32)
            .collect();

        Ok(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            src,
            dst_width,
            dst_height,
            x_map,
            y_map,
        })
    }

    /// Unique id of this context
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source(&self) -> VideoGeometry {
        self.src
    }

    pub fn destination(&self) -> (u32, u32) {
        (self.dst_width, self.dst_height)
    }

    /// Whether the context converts exactly this geometry to this size
    pub fn matches(&self, src: &VideoGeometry, dst_width: u32, dst_height: u32) -> bool {
        self.src == *src && self.dst_width == dst_width && self.dst_height == dst_height
    }

    /// Scale a YUV420P picture into an RGB565 buffer at (`x`, `y`)
    pub fn scale_into(
        &self,
        yuv: &[u8],
        dst: &mut [u8],
        dst_stride: usize,
        x: u32,
        y: u32,
    ) -> Result<(), FilterError> {
        let needed = self.src.yuv420p_len();
        if yuv.len() < needed {
            return Err(FilterError::InvalidArgument(format!(
                "picture has {} bytes, expected {}",
                yuv.len(),
                needed
            )));
        }
        let last_row = (y + self.dst_height) as usize;
        let row_bytes = (x + self.dst_width) as usize * 2;
        if row_bytes > dst_stride || last_row * dst_stride > dst.len() {
            return Err(FilterError::RenderTarget(format!(
                "{}x{} at ({}, {}) does not fit the target",
                self.dst_width, self.dst_height, x, y
            )));
        }

        let stride = self.src.stride as usize;
        let chroma_stride = stride / 2;
        let u_plane = stride * self.src.height as usize;
        let v_plane = u_plane + chroma_stride * (self.src.height as usize / 2);

        for (row, &sy) in self.y_map.iter().enumerate() {
            let sy = sy as usize;
            let luma_row = sy * stride;
            let chroma_row = (sy / 2) * chroma_stride;
            let out = (y as usize + row) * dst_stride + x as usize * 2;

            for (col, &sx) in self.x_map.iter().enumerate() {
                let sx = sx as usize;
                let pixel = yuv_to_rgb565(
                    yuv[luma_row + sx],
                    yuv[u_plane + chroma_row + sx / 2],
                    yuv[v_plane + chroma_row + sx / 2],
                );
                let at = out + col * 2;
                dst[at..at + 2].copy_from_slice(&pixel.to_le_bytes());
            }
        }
        Ok(())
    }
}
