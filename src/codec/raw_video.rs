//! Uncompressed YUV420P pictures split across RTP payloads
//!
//! Every fragment starts with an 8-byte header: width and height (u16 big
//! endian) and the byte offset of the fragment inside the picture (u32 big
//! endian). The last fragment of a picture carries the marker bit.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::RAW_VIDEO_PAYLOAD_TYPE;
use crate::error::FilterError;
use crate::filter::{
    Filter, FilterCategory, FilterDesc, FilterId, MediaFormat, MediaUnit, ProcessContext,
};
use crate::video::{PixelFormat, VideoGeometry};

const FRAGMENT_HEADER: usize = 8;

/// Picture bytes per fragment
pub const FRAGMENT_PAYLOAD: usize = 1200;

/// Number of fragments a picture is split into
pub fn fragment_count(geometry: VideoGeometry) -> usize {
    (geometry.width as usize * geometry.height as usize * 3 / 2).div_ceil(FRAGMENT_PAYLOAD)
}

static ENCODER_DESC: FilterDesc = FilterDesc {
    id: FilterId::RawVideoEncoder,
    name: "RawVideoEncoder",
    category: FilterCategory::Processing,
    ninputs: 1,
    noutputs: 1,
};

static DECODER_DESC: FilterDesc = FilterDesc {
    id: FilterId::RawVideoDecoder,
    name: "RawVideoDecoder",
    category: FilterCategory::Processing,
    ninputs: 1,
    noutputs: 1,
};

/// Splits pictures into RTP sized fragments
pub struct RawVideoEncoder {
    payload_type: u8,
}

impl RawVideoEncoder {
    pub fn new(payload_type: u8) -> Self {
        Self { payload_type }
    }
}

impl Default for RawVideoEncoder {
    fn default() -> Self {
        Self::new(RAW_VIDEO_PAYLOAD_TYPE)
    }
}

impl Filter for RawVideoEncoder {
    fn desc(&self) -> &'static FilterDesc {
        &ENCODER_DESC
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        // Only the newest picture is worth sending
        let Some(unit) = ctx.take_last(0) else {
            return Ok(());
        };
        let Some(geometry) = unit.geometry() else {
            return Ok(());
        };
        if geometry.width > u16::MAX as u32 || geometry.height > u16::MAX as u32 {
            return Err(FilterError::InvalidArgument(format!(
                "picture too large: {}x{}",
                geometry.width, geometry.height
            )));
        }

        // Send a tightly packed picture whatever the source stride
        let picture = pack(&unit.data, geometry)?;
        let chunks = picture.len().div_ceil(FRAGMENT_PAYLOAD);
        for (i, chunk) in picture.chunks(FRAGMENT_PAYLOAD).enumerate() {
            let mut fragment = BytesMut::with_capacity(FRAGMENT_HEADER + chunk.len());
            fragment.put_u16(geometry.width as u16);
            fragment.put_u16(geometry.height as u16);
            fragment.put_u32((i * FRAGMENT_PAYLOAD) as u32);
            fragment.put_slice(chunk);
            ctx.push(
                0,
                MediaUnit::encoded(fragment.freeze(), self.payload_type, unit.timestamp, i + 1 == chunks),
            );
        }
        Ok(())
    }
}

/// Copy a possibly strided YUV420P picture into a packed buffer
fn pack(data: &[u8], geometry: VideoGeometry) -> Result<Vec<u8>, FilterError> {
    if data.len() < geometry.yuv420p_len() {
        return Err(FilterError::InvalidArgument(format!(
            "picture has {} bytes, expected {}",
            data.len(),
            geometry.yuv420p_len()
        )));
    }
    if geometry.stride == geometry.width {
        return Ok(data[..geometry.yuv420p_len()].to_vec());
    }

    let (w, h, stride) = (
        geometry.width as usize,
        geometry.height as usize,
        geometry.stride as usize,
    );
    let mut out = Vec::with_capacity(w * h * 3 / 2);
    for row in 0..h {
        out.extend_from_slice(&data[row * stride..row * stride + w]);
    }
    let chroma_stride = stride / 2;
    let u_plane = stride * h;
    let v_plane = u_plane + chroma_stride * (h / 2);
    for plane in [u_plane, v_plane] {
        for row in 0..h / 2 {
            let start = plane + row * chroma_stride;
            out.extend_from_slice(&data[start..start + w / 2]);
        }
    }
    Ok(out)
}

struct Assembly {
    timestamp: u32,
    geometry: VideoGeometry,
    data: Vec<u8>,
    seen: Vec<bool>,
    received: usize,
}

/// Reassembles pictures; incomplete pictures are dropped
#[derive(Default)]
pub struct RawVideoDecoder {
    current: Option<Assembly>,
    dropped: u64,
}

impl RawVideoDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pictures dropped because fragments were missing
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn fragment(&mut self, unit: &MediaUnit) -> Option<MediaUnit> {
        if unit.data.len() < FRAGMENT_HEADER {
            return None;
        }
        let d = &unit.data;
        let width = u16::from_be_bytes([d[0], d[1]]) as u32;
        let height = u16::from_be_bytes([d[2], d[3]]) as u32;
        let offset = u32::from_be_bytes([d[4], d[5], d[6], d[7]]) as usize;
        let geometry = VideoGeometry::new(width, height);
        if !geometry.is_valid() {
            return None;
        }

        let stale = self
            .current
            .as_ref()
            .map_or(true, |a| a.timestamp != unit.timestamp || a.geometry != geometry);
        if stale {
            if self.current.take().is_some() {
                self.dropped += 1;
            }
            self.current = Some(Assembly {
                timestamp: unit.timestamp,
                geometry,
                data: vec![0u8; geometry.yuv420p_len()],
                seen: vec![false; fragment_count(geometry)],
                received: 0,
            });
        }

        let assembly = self.current.as_mut()?;
        let payload = &d[FRAGMENT_HEADER..];
        let end = offset.checked_add(payload.len())?;
        if end > assembly.data.len()
            || offset % FRAGMENT_PAYLOAD != 0
            || payload.len() > FRAGMENT_PAYLOAD
        {
            return None;
        }
        let seen = assembly.seen.get_mut(offset / FRAGMENT_PAYLOAD)?;
        assembly.data[offset..end].copy_from_slice(payload);
        // A repeated fragment counts once
        if !*seen {
            *seen = true;
            assembly.received += payload.len();
        }

        if !unit.marker {
            return None;
        }
        let assembly = self.current.take()?;
        if assembly.received != assembly.data.len() {
            self.dropped += 1;
            return None;
        }
        Some(MediaUnit::video(
            Bytes::from(assembly.data),
            assembly.geometry,
            PixelFormat::Yuv420p,
            assembly.timestamp,
        ))
    }
}

impl Filter for RawVideoDecoder {
    fn desc(&self) -> &'static FilterDesc {
        &DECODER_DESC
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        while let Some(unit) = ctx.pop(0) {
            if !matches!(unit.format, MediaFormat::Encoded { .. }) {
                continue;
            }
            if let Some(picture) = self.fragment(&unit) {
                ctx.push(0, picture);
            }
        }
        Ok(())
    }

    fn postprocess(&mut self) {
        self.current = None;
    }
}
