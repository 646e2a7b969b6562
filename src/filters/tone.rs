//! Sine tone source

use std::f32::consts::PI;

use crate::constants::{DEFAULT_CHANNELS, DEFAULT_PTIME_MS, DEFAULT_SAMPLE_RATE};
use crate::error::FilterError;
use crate::filter::{
    Filter, FilterCategory, FilterDesc, FilterId, FilterMethod, MediaUnit, MethodReply,
    ProcessContext,
};

static DESC: FilterDesc = FilterDesc {
    id: FilterId::ToneSource,
    name: "ToneSource",
    category: FilterCategory::Source,
    ninputs: 0,
    noutputs: 1,
};

/// Emits one PCM frame of a sine tone every `ptime` of ticker time
pub struct ToneSource {
    sample_rate: u32,
    channels: u16,
    frequency: f32,
    amplitude: f32,
    ptime_ms: u32,
    muted: bool,
    phase: f32,
    /// Samples per channel produced so far
    produced: u64,
}

impl ToneSource {
    pub fn new(sample_rate: u32, channels: u16, frequency: f32) -> Self {
        Self {
            sample_rate,
            channels: channels.max(1),
            frequency,
            amplitude: 0.3,
            ptime_ms: DEFAULT_PTIME_MS,
            muted: false,
            phase: 0.0,
            produced: 0,
        }
    }

    pub fn with_ptime(mut self, ptime_ms: u32) -> Self {
        self.ptime_ms = ptime_ms.max(1);
        self
    }

    fn frame_size(&self) -> usize {
        (self.sample_rate as u64 * self.ptime_ms as u64 / 1000) as usize
    }

    fn next_frame(&mut self) -> Vec<i16> {
        let frames = self.frame_size();
        let step = 2.0 * PI * self.frequency / self.sample_rate as f32;
        let mut samples = Vec::with_capacity(frames * self.channels as usize);
        for _ in 0..frames {
            let value = if self.muted {
                0
            } else {
                (self.phase.sin() * self.amplitude * i16::MAX as f32) as i16
            };
            self.phase = (self.phase + step) % (2.0 * PI);
            samples.extend(std::iter::repeat(value).take(self.channels as usize));
        }
        samples
    }
}

impl Default for ToneSource {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, 440.0)
    }
}

impl Filter for ToneSource {
    fn desc(&self) -> &'static FilterDesc {
        &DESC
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        let frame = self.frame_size() as u64;
        if frame == 0 {
            return Ok(());
        }
        let due = ctx.time_ms() * self.sample_rate as u64 / 1000 + frame;
        while self.produced + frame <= due {
            let timestamp = self.produced as u32;
            let samples = self.next_frame();
            ctx.push(
                0,
                MediaUnit::audio(&samples, self.sample_rate, self.channels, timestamp),
            );
            self.produced += frame;
        }
        Ok(())
    }

    fn call(&mut self, method: FilterMethod) -> Result<MethodReply, FilterError> {
        match method {
            FilterMethod::SetSampleRate(rate) if rate > 0 => {
                self.sample_rate = rate;
                Ok(MethodReply::Done)
            }
            FilterMethod::GetSampleRate => Ok(MethodReply::SampleRate(self.sample_rate)),
            FilterMethod::SetNchannels(channels) if channels > 0 => {
                self.channels = channels;
                Ok(MethodReply::Done)
            }
            FilterMethod::Mute(muted) => {
                self.muted = muted;
                Ok(MethodReply::Done)
            }
            FilterMethod::SetSampleRate(_) | FilterMethod::SetNchannels(_) => {
                Err(FilterError::InvalidArgument("zero value".into()))
            }
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

    fn run(source: &mut ToneSource, out: &SharedQueue, ms: u64) {
        let outputs = [Some(out.clone())];
        let mut ctx = ProcessContext::new(&[], &outputs, ms / 10, Duration::from_millis(ms));
        source.process(&mut ctx).unwrap();
    }

    #[test]
    fn test_frames_follow_ticker_time() {
        let out: SharedQueue = Arc::new(MediaQueue::new(64));
        let mut source = ToneSource::new(8000, 1, 400.0);
        for ms in (0..100).step_by(10) {
            run(&mut source, &out, ms);
        }
        // 20 ms frames, first one emitted immediately
        assert_eq!(out.len(), 5);
        let first = out.pop().unwrap();
        let second = out.pop().unwrap();
        assert_eq!(first.pcm_samples().unwrap().len(), 160);
        assert_eq!(second.timestamp - first.timestamp, 160);
    }

    #[test]
    fn test_mute_produces_silence() {
        let out: SharedQueue = Arc::new(MediaQueue::new(8));
        let mut source = ToneSource::default();
        source.call(FilterMethod::Mute(true)).unwrap();
        run(&mut source, &out, 0);
        let unit = out.pop().unwrap();
        assert!(unit.pcm_samples().unwrap().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_rejects_zero_rate() {
        let mut source = ToneSource::default();
        assert!(source.call(FilterMethod::SetSampleRate(0)).is_err());
        assert_eq!(
            source.call(FilterMethod::GetSampleRate).unwrap(),
            MethodReply::SampleRate(DEFAULT_SAMPLE_RATE)
        );
    }
}
