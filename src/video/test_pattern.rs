//! Moving color bar source

use bytes::Bytes;

use crate::constants::{DEFAULT_FPS, VIDEO_CLOCK_RATE};
use crate::error::FilterError;
use crate::filter::{
    Filter, FilterCategory, FilterDesc, FilterId, FilterMethod, MediaUnit, MethodReply,
    ProcessContext,
};
use crate::video::{PixelFormat, VideoGeometry};

static DESC: FilterDesc = FilterDesc {
    id: FilterId::TestPattern,
    name: "TestPattern",
    category: FilterCategory::Source,
    ninputs: 0,
    noutputs: 1,
};

/// BT.601 YUV of white, yellow, cyan, green, magenta, red, blue, black
const BARS: [(u8, u8, u8); 8] = [
    (235, 128, 128),
    (210, 16, 146),
    (170, 166, 16),
    (145, 54, 34),
    (106, 202, 222),
    (81, 90, 240),
    (41, 240, 110),
    (16, 128, 128),
];

/// Produces YUV420P color bars that scroll one column per frame
pub struct TestPatternSource {
    geometry: VideoGeometry,
    fps: u32,
    frames: u64,
}

impl TestPatternSource {
    pub fn new(geometry: VideoGeometry, fps: u32) -> Self {
        Self {
            geometry,
            fps: fps.max(1),
            frames: 0,
        }
    }

    fn render(&self) -> Bytes {
        let g = self.geometry;
        let stride = g.stride as usize;
        let chroma_stride = stride / 2;
        let bar_width = (g.width as usize / BARS.len()).max(1);
        let shift = self.frames as usize;

        let mut data = vec![0u8; g.yuv420p_len()];
        let (luma, chroma) = data.split_at_mut(stride * g.height as usize);
        let (u_plane, v_plane) = chroma.split_at_mut(chroma_stride * (g.height as usize / 2));

        for x in 0..g.width as usize {
            let (y, u, v) = BARS[((x + shift) / bar_width) % BARS.len()];
            for row in 0..g.height as usize {
                luma[row * stride + x] = y;
            }
            if x % 2 == 0 {
                for row in 0..g.height as usize / 2 {
                    u_plane[row * chroma_stride + x / 2] = u;
                    v_plane[row * chroma_stride + x / 2] = v;
                }
            }
        }
        Bytes::from(data)
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new(VideoGeometry::CIF, DEFAULT_FPS)
    }
}

impl Filter for TestPatternSource {
    fn desc(&self) -> &'static FilterDesc {
        &DESC
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        // Frame n is due at n / fps seconds of ticker time
        let due = ctx.time_ms() * self.fps as u64 / 1000 + 1;
        if self.frames >= due {
            return Ok(());
        }

        let timestamp = (self.frames * VIDEO_CLOCK_RATE as u64 / self.fps as u64) as u32;
        let mut unit = MediaUnit::video(self.render(), self.geometry, PixelFormat::Yuv420p, timestamp);
        unit.marker = true;
        ctx.push(0, unit);
        self.frames += 1;
        Ok(())
    }

    fn call(&mut self, method: FilterMethod) -> Result<MethodReply, FilterError> {
        match method {
            FilterMethod::SetVideoSize(geometry) => {
                if !geometry.is_valid() {
                    return Err(FilterError::InvalidArgument(format!(
                        "unusable video size {}x{}",
                        geometry.width, geometry.height
                    )));
                }
                self.geometry = geometry;
                Ok(MethodReply::Done)
            }
            FilterMethod::GetVideoSize => Ok(MethodReply::VideoSize(self.geometry)),
            other => Err(FilterError::MethodNotSupported {
                filter: DESC.name,
                method: other.name(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{MediaQueue, SharedQueue};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_frame_cadence() {
        let out: SharedQueue = Arc::new(MediaQueue::new(64));
        let outputs = [Some(out.clone())];
        let mut source = TestPatternSource::new(VideoGeometry::QCIF, 10);

        // 10 ms ticks over one second at 10 fps
        for tick in 0..100u64 {
            let mut ctx = ProcessContext::new(&[], &outputs, tick, Duration::from_millis(tick * 10));
            source.process(&mut ctx).unwrap();
        }
        assert_eq!(out.len(), 10);

        let first = out.pop().unwrap();
        let second = out.pop().unwrap();
        assert_eq!(first.geometry(), Some(VideoGeometry::QCIF));
        assert_eq!(first.len(), VideoGeometry::QCIF.yuv420p_len());
        assert_eq!(second.timestamp - first.timestamp, VIDEO_CLOCK_RATE / 10);
    }

    #[test]
    fn test_rejects_odd_size() {
        let mut source = TestPatternSource::default();
        assert!(source
            .call(FilterMethod::SetVideoSize(VideoGeometry::new(99, 10)))
            .is_err());
        assert_eq!(
            source.call(FilterMethod::GetVideoSize).unwrap(),
            MethodReply::VideoSize(VideoGeometry::CIF)
        );
    }
}
