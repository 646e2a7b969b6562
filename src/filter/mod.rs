//! Filters: the processing nodes of a media graph
//!
//! A filter implements [`Filter`], a small capability interface with a fixed
//! lifecycle:
//!
//! - construction plays the role of `init` (private state + defaults)
//! - [`Filter::preprocess`] once, on the ticker thread, before the first tick
//! - [`Filter::process`] every tick, under the filter's lock
//! - [`Filter::postprocess`] once, when the graph leaves its ticker
//! - [`Filter::uninit`] exactly once, when the filter is destroyed
//!
//! Control operations are a closed set of typed [`FilterMethod`]s instead of
//! numeric ids. [`FilterHandle`] owns the lock, the input queues and the
//! output links, and is what graphs and streams hold.

pub mod media;
pub mod node;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

pub use media::{MediaFormat, MediaUnit};
pub use node::FilterHandle;
pub use queue::{MediaQueue, SharedQueue};

use crate::error::FilterError;
use crate::video::{RenderTarget, VideoGeometry};

/// Identity of a filter implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterId {
    RtpSend,
    RtpRecv,
    OpusEncoder,
    OpusDecoder,
    RawVideoEncoder,
    RawVideoDecoder,
    ToneSource,
    VoidSink,
    TestPattern,
    Display,
    /// Filters defined outside this crate
    External(u32),
}

/// Role of a filter in a graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterCategory {
    Source,
    Processing,
    Sink,
}

/// Static description of a filter implementation
#[derive(Debug)]
pub struct FilterDesc {
    pub id: FilterId,
    pub name: &'static str,
    pub category: FilterCategory,
    pub ninputs: usize,
    pub noutputs: usize,
}

/// Named control operations a filter may support
#[derive(Clone)]
pub enum FilterMethod {
    SetBitrate(u32),
    GetBitrate,
    SetSampleRate(u32),
    GetSampleRate,
    SetNchannels(u16),
    SetVideoSize(VideoGeometry),
    GetVideoSize,
    /// Hand a native drawable to a rendering filter; `None` detaches it
    SetRenderTarget(Option<Arc<dyn RenderTarget>>),
    Mute(bool),
}

impl FilterMethod {
    pub fn name(&self) -> &'static str {
        match self {
            FilterMethod::SetBitrate(_) => "set_bitrate",
            FilterMethod::GetBitrate => "get_bitrate",
            FilterMethod::SetSampleRate(_) => "set_sample_rate",
            FilterMethod::GetSampleRate => "get_sample_rate",
            FilterMethod::SetNchannels(_) => "set_nchannels",
            FilterMethod::SetVideoSize(_) => "set_video_size",
            FilterMethod::GetVideoSize => "get_video_size",
            FilterMethod::SetRenderTarget(_) => "set_render_target",
            FilterMethod::Mute(_) => "mute",
        }
    }
}

/// Result of a successful method call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodReply {
    Done,
    Bitrate(u32),
    SampleRate(u32),
    VideoSize(VideoGeometry),
}

/// View of a filter's ports during one tick
pub struct ProcessContext<'a> {
    inputs: &'a [SharedQueue],
    outputs: &'a [Option<SharedQueue>],
    tick: u64,
    time: Duration,
}

impl<'a> ProcessContext<'a> {
    pub fn new(
        inputs: &'a [SharedQueue],
        outputs: &'a [Option<SharedQueue>],
        tick: u64,
        time: Duration,
    ) -> Self {
        Self {
            inputs,
            outputs,
            tick,
            time,
        }
    }

    /// Tick counter of the driving ticker
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Ticker time (tick count times period)
    pub fn time(&self) -> Duration {
        self.time
    }

    pub fn time_ms(&self) -> u64 {
        self.time.as_millis() as u64
    }

    /// Input queue of a port
    pub fn input(&self, port: usize) -> Option<&MediaQueue> {
        self.inputs.get(port).map(|q| q.as_ref())
    }

    /// Pop the oldest pending unit of an input port
    pub fn pop(&self, port: usize) -> Option<MediaUnit> {
        self.input(port).and_then(|q| q.pop())
    }

    /// Pop everything pending on an input port, returning the newest unit
    pub fn take_last(&self, port: usize) -> Option<MediaUnit> {
        self.input(port).and_then(|q| q.take_last())
    }

    /// Whether an output port is linked downstream
    pub fn is_linked(&self, port: usize) -> bool {
        matches!(self.outputs.get(port), Some(Some(_)))
    }

    /// Push a unit downstream.
    /// Units sent to an unlinked port are dropped; returns whether it was queued
    pub fn push(&self, port: usize, unit: MediaUnit) -> bool {
        match self.outputs.get(port) {
            Some(Some(queue)) => queue.push(unit),
            _ => false,
        }
    }
}

/// Capability interface implemented by every filter
pub trait Filter: Send {
    /// Static description (identity, category, port counts)
    fn desc(&self) -> &'static FilterDesc;

    /// Called once on the ticker thread before the first tick
    fn preprocess(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        Ok(())
    }

    /// Called every tick. Pending inputs are flushed after this returns,
    /// whatever the outcome
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError>;

    /// Called once when the graph is detached from its ticker
    fn postprocess(&mut self) {}

    /// Dispatch a control operation
    fn call(&mut self, method: FilterMethod) -> Result<MethodReply, FilterError> {
        Err(FilterError::MethodNotSupported {
            filter: self.desc().name,
            method: method.name(),
        })
    }

    /// Release native resources. Called exactly once
    fn uninit(&mut self) {}
}
