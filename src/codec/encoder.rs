//! Opus encoder and its filter
//!
//! PCM units are buffered until a full packet time is available, then
//! encoded into one RTP payload.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::constants::OPUS_PAYLOAD_TYPE;
use crate::error::{CodecError, FilterError};
use crate::filter::{
    Filter, FilterCategory, FilterDesc, FilterId, FilterMethod, MediaUnit, MethodReply,
    ProcessContext,
};

/// Opus encoder settings
#[derive(Debug, Clone)]
pub struct OpusParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
    pub ptime_ms: u32,
    pub payload_type: u8,
}

impl OpusParams {
    /// Samples per channel in one packet
    pub fn frame_size(&self) -> usize {
        (self.sample_rate as u64 * self.ptime_ms as u64 / 1000) as usize
    }
}

impl Default for OpusParams {
    fn default() -> Self {
        Self {
            sample_rate: crate::constants::DEFAULT_SAMPLE_RATE,
            channels: crate::constants::DEFAULT_CHANNELS,
            bitrate: crate::constants::DEFAULT_AUDIO_BITRATE,
            ptime_ms: crate::constants::DEFAULT_PTIME_MS,
            payload_type: OPUS_PAYLOAD_TYPE,
        }
    }
}

pub(crate) fn opus_channels(channels: u16) -> Result<Channels, String> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        _ => Err(format!("Unsupported channel count: {}", channels)),
    }
}

/// Opus encoder for interleaved i16 PCM
pub struct OpusEncoder {
    encoder: Encoder,
    params: OpusParams,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
}

impl OpusEncoder {
    pub fn new(params: OpusParams) -> Result<Self, CodecError> {
        let channels = opus_channels(params.channels).map_err(CodecError::EncoderInit)?;
        if ![10, 20, 40, 60].contains(&params.ptime_ms) {
            return Err(CodecError::EncoderInit(format!(
                "Unsupported packet time: {} ms",
                params.ptime_ms
            )));
        }

        let mut encoder = Encoder::new(params.sample_rate, channels, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        encoder
            .set_bitrate(opus::Bitrate::Bits(params.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        Ok(Self {
            encoder,
            params,
            // Max Opus frame is about 1275 bytes
            encode_buffer: vec![0u8; 4000],
            frames_encoded: 0,
        })
    }

    /// Encode exactly one frame of interleaved samples
    pub fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
        if samples.len() != self.samples_per_frame() {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }
        let size = self
            .encoder
            .encode(samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
        self.frames_encoded += 1;
        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    /// Update bitrate dynamically
    pub fn set_bitrate(&mut self, bitrate: u32) -> Result<(), CodecError> {
        self.encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        self.params.bitrate = bitrate;
        Ok(())
    }

    pub fn params(&self) -> &OpusParams {
        &self.params
    }

    pub fn samples_per_frame(&self) -> usize {
        self.params.frame_size() * self.params.channels as usize
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

static ENCODER_DESC: FilterDesc = FilterDesc {
    id: FilterId::OpusEncoder,
    name: "OpusEncoder",
    category: FilterCategory::Processing,
    ninputs: 1,
    noutputs: 1,
};

/// Filter wrapping [`OpusEncoder`]
pub struct OpusEncoderFilter {
    encoder: OpusEncoder,
    pending: Vec<i16>,
    /// RTP timestamp of the first pending sample
    timestamp: Option<u32>,
}

impl OpusEncoderFilter {
    pub fn new(params: OpusParams) -> Result<Self, CodecError> {
        Ok(Self {
            encoder: OpusEncoder::new(params)?,
            pending: Vec::new(),
            timestamp: None,
        })
    }
}

impl Filter for OpusEncoderFilter {
    fn desc(&self) -> &'static FilterDesc {
        &ENCODER_DESC
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        let per_frame = self.encoder.samples_per_frame();
        let channels = self.encoder.params().channels as usize;
        let payload_type = self.encoder.params().payload_type;

        while let Some(unit) = ctx.pop(0) {
            let Some(samples) = unit.pcm_samples() else {
                continue;
            };
            if self.pending.is_empty() {
                self.timestamp = Some(unit.timestamp);
            }
            self.pending.extend_from_slice(&samples);

            while self.pending.len() >= per_frame {
                let frame: Vec<i16> = self.pending.drain(..per_frame).collect();
                let timestamp = self.timestamp.unwrap_or(unit.timestamp);
                let payload = self.encoder.encode(&frame)?;
                ctx.push(0, MediaUnit::encoded(payload, payload_type, timestamp, false));
                self.timestamp = Some(timestamp.wrapping_add((per_frame / channels) as u32));
            }
        }
        Ok(())
    }

    fn call(&mut self, method: FilterMethod) -> Result<MethodReply, FilterError> {
        match method {
            FilterMethod::SetBitrate(bitrate) => {
                self.encoder.set_bitrate(bitrate)?;
                tracing::debug!("Opus bitrate set to {}", bitrate);
                Ok(MethodReply::Done)
            }
            FilterMethod::GetBitrate => Ok(MethodReply::Bitrate(self.encoder.params().bitrate)),
            FilterMethod::GetSampleRate => {
                Ok(MethodReply::SampleRate(self.encoder.params().sample_rate))
            }
            other => Err(FilterError::MethodNotSupported {
                filter: ENCODER_DESC.name,
                method: other.name(),
            }),
        }
    }

    fn postprocess(&mut self) {
        self.pending.clear();
        self.timestamp = None;
    }
}
