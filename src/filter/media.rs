//! Media units moved between filters

use bytes::Bytes;

use crate::video::{PixelFormat, VideoGeometry};

/// Format metadata attached to a media unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaFormat {
    /// Interleaved signed 16-bit little endian PCM
    Audio { sample_rate: u32, channels: u16 },
    /// Raw picture
    Video {
        geometry: VideoGeometry,
        pixel_format: PixelFormat,
    },
    /// Encoded payload ready for (or coming from) RTP
    Encoded { payload_type: u8 },
}

/// A buffer of samples or pixels plus its format.
///
/// Produced by an upstream filter and owned by the queue it is pushed to
/// until the downstream filter pops it during the same tick.
#[derive(Debug, Clone)]
pub struct MediaUnit {
    pub data: Bytes,
    pub format: MediaFormat,
    /// RTP-clock timestamp
    pub timestamp: u32,
    /// RTP marker bit
    pub marker: bool,
}

impl MediaUnit {
    /// PCM audio unit from interleaved samples
    pub fn audio(samples: &[i16], sample_rate: u32, channels: u16, timestamp: u32) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            data.extend_from_slice(&s.to_le_bytes());
        }
        Self {
            data: Bytes::from(data),
            format: MediaFormat::Audio {
                sample_rate,
                channels,
            },
            timestamp,
            marker: false,
        }
    }

    /// Raw video unit
    pub fn video(data: Bytes, geometry: VideoGeometry, pixel_format: PixelFormat, timestamp: u32) -> Self {
        Self {
            data,
            format: MediaFormat::Video {
                geometry,
                pixel_format,
            },
            timestamp,
            marker: false,
        }
    }

    /// Encoded payload unit
    pub fn encoded(data: Bytes, payload_type: u8, timestamp: u32, marker: bool) -> Self {
        Self {
            data,
            format: MediaFormat::Encoded { payload_type },
            timestamp,
            marker,
        }
    }

    /// Decode PCM samples, `None` if this is not an audio unit
    pub fn pcm_samples(&self) -> Option<Vec<i16>> {
        match self.format {
            MediaFormat::Audio { .. } => Some(
                self.data
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Video geometry, if this is a raw picture
    pub fn geometry(&self) -> Option<VideoGeometry> {
        match self.format {
            MediaFormat::Video { geometry, .. } => Some(geometry),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_layout() {
        let unit = MediaUnit::audio(&[1, -2, 300], 8000, 1, 0);
        assert_eq!(unit.len(), 6);
        assert_eq!(unit.pcm_samples().unwrap(), vec![1, -2, 300]);
        assert!(unit.geometry().is_none());
    }

    #[test]
    fn test_encoded_has_no_samples() {
        let unit = MediaUnit::encoded(Bytes::from_static(b"abc"), 96, 10, true);
        assert!(unit.pcm_samples().is_none());
        assert!(unit.marker);
    }
}
