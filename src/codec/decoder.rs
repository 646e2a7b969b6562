//! Opus decoder and its filter
//!
//! Provides Opus decoding with packet loss concealment.

use opus::Decoder;

use crate::codec::encoder::opus_channels;
use crate::error::{CodecError, FilterError};
use crate::filter::{
    Filter, FilterCategory, FilterDesc, FilterId, FilterMethod, MediaFormat, MediaUnit,
    MethodReply, ProcessContext,
};

/// Concealed frames generated for one gap at most
const MAX_PLC_FRAMES: u32 = 5;

/// Opus decoder producing interleaved i16 PCM
pub struct OpusDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    /// Samples per channel of the last decoded packet, the size of concealed frames
    last_frame: usize,
    frames_decoded: u64,
    /// Frames lost (PLC used)
    frames_lost: u64,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        let opus_channels = opus_channels(channels).map_err(CodecError::DecoderInit)?;
        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // 120 ms at 48 kHz stereo
        let decode_buffer = vec![0i16; 48000 * 2 * 120 / 1000];

        Ok(Self {
            decoder,
            sample_rate,
            channels,
            decode_buffer,
            last_frame: sample_rate as usize / 50,
            frames_decoded: 0,
            frames_lost: 0,
        })
    }

    /// Decode one Opus packet
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<i16>, CodecError> {
        let samples = self
            .decoder
            .decode(data, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        self.last_frame = samples;
        self.frames_decoded += 1;
        Ok(self.decode_buffer[..samples * self.channels as usize].to_vec())
    }

    /// Generate packet loss concealment samples
    pub fn decode_plc(&mut self) -> Result<Vec<i16>, CodecError> {
        let len = (self.last_frame * self.channels as usize).min(self.decode_buffer.len());
        let samples = self
            .decoder
            .decode(&[], &mut self.decode_buffer[..len], false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
        self.frames_lost += 1;
        Ok(self.decode_buffer[..samples * self.channels as usize].to_vec())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples per channel of the last decoded packet
    pub fn last_frame(&self) -> usize {
        self.last_frame
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_lost(&self) -> u64 {
        self.frames_lost
    }
}

static DECODER_DESC: FilterDesc = FilterDesc {
    id: FilterId::OpusDecoder,
    name: "OpusDecoder",
    category: FilterCategory::Processing,
    ninputs: 1,
    noutputs: 1,
};

/// Filter wrapping [`OpusDecoder`]; conceals timestamp gaps
pub struct OpusDecoderFilter {
    decoder: OpusDecoder,
    /// Timestamp expected for the next packet
    next_ts: Option<u32>,
}

impl OpusDecoderFilter {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        Ok(Self {
            decoder: OpusDecoder::new(sample_rate, channels)?,
            next_ts: None,
        })
    }

    pub fn frames_lost(&self) -> u64 {
        self.decoder.frames_lost()
    }

    fn pcm_unit(&self, samples: &[i16], timestamp: u32) -> MediaUnit {
        MediaUnit::audio(
            samples,
            self.decoder.sample_rate(),
            self.decoder.channels(),
            timestamp,
        )
    }
}

impl Filter for OpusDecoderFilter {
    fn desc(&self) -> &'static FilterDesc {
        &DECODER_DESC
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        let channels = self.decoder.channels() as u32;
        while let Some(unit) = ctx.pop(0) {
            if !matches!(unit.format, MediaFormat::Encoded { .. }) {
                continue;
            }

            if let Some(expected) = self.next_ts {
                let frame = self.decoder.last_frame() as u32;
                let gap = unit.timestamp.wrapping_sub(expected);
                // Forward gaps only, a late or repeated packet is not a loss
                if frame > 0 && gap > 0 && gap < frame * (MAX_PLC_FRAMES + 1) {
                    let mut ts = expected;
                    for _ in 0..gap / frame {
                        let concealed = self.decoder.decode_plc()?;
                        ctx.push(0, self.pcm_unit(&concealed, ts));
                        ts = ts.wrapping_add(frame);
                    }
                }
            }

            let samples = self.decoder.decode(&unit.data)?;
            let frame = samples.len() as u32 / channels;
            ctx.push(0, self.pcm_unit(&samples, unit.timestamp));
            self.next_ts = Some(unit.timestamp.wrapping_add(frame));
        }
        Ok(())
    }

    fn call(&mut self, method: FilterMethod) -> Result<MethodReply, FilterError> {
        match method {
            FilterMethod::GetSampleRate => Ok(MethodReply::SampleRate(self.decoder.sample_rate())),
            other => Err(FilterError::MethodNotSupported {
                filter: DECODER_DESC.name,
                method: other.name(),
            }),
        }
    }

    fn postprocess(&mut self) {
        self.next_ts = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{OpusEncoder, OpusParams};
    use crate::filter::{MediaQueue, SharedQueue};
    use std::sync::Arc;
    use std::time::Duration;

    fn sine_frame(n: usize) -> Vec<i16> {
        (0..n)
            .map(|i| ((i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 48000.0).sin() * 8000.0) as i16)
            .collect()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut encoder = OpusEncoder::new(OpusParams::default()).unwrap();
        let mut decoder = OpusDecoder::new(48000, 1).unwrap();
        let frame = sine_frame(encoder.samples_per_frame());
        let encoded = encoder.encode(&frame).unwrap();
        let decoded = decoder.decode(&encoded).unwrap();
        assert_eq!(decoded.len(), frame.len());
    }

    #[test]
    fn test_plc() {
        let mut decoder = OpusDecoder::new(48000, 2).unwrap();
        assert!(decoder.decode_plc().is_ok());
        assert_eq!(decoder.frames_lost(), 1);
    }

    #[test]
    fn test_filter_conceals_gap() {
        let mut encoder = OpusEncoder::new(OpusParams::default()).unwrap();
        let mut filter = OpusDecoderFilter::new(48000, 1).unwrap();
        let input: SharedQueue = Arc::new(MediaQueue::new(16));
        let output: SharedQueue = Arc::new(MediaQueue::new(16));
        let inputs = [input.clone()];
        let outputs = [Some(output.clone())];

        // Packets 0, 1 and 4: two frames missing
        for n in [0u32, 1, 4] {
            let payload = encoder.encode(&sine_frame(960)).unwrap();
            input.push(MediaUnit::encoded(payload, 111, n * 960, false));
        }
        let mut ctx = ProcessContext::new(&inputs, &outputs, 0, Duration::ZERO);
        filter.process(&mut ctx).unwrap();

        assert_eq!(output.len(), 5);
        assert_eq!(filter.frames_lost(), 2);
        let timestamps: Vec<u32> = std::iter::from_fn(|| output.pop()).map(|u| u.timestamp).collect();
        assert_eq!(timestamps, vec![0, 960, 1920, 2880, 3840]);
    }
}
