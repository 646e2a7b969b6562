//! Audio and video streams
//!
//! A [`MediaStream`] owns one RTP session, the graph wiring its filters, the
//! ticker driving that graph and the optional SRTP and adaptive control
//! layers. Construction opens the session; [`MediaStream::start`] wires the
//! graph and attaches it to a freshly spawned ticker; [`MediaStream::free`]
//! releases everything in dependency order and is safe on any state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SrtpConfig, StreamConfig};
use crate::control::{AdaptiveConfig, AdaptiveController, ControlAction};
use crate::error::{Error, FilterError, Result, SrtpError};
use crate::filter::{FilterHandle, FilterMethod};
use crate::filters::{RtpRecvFilter, RtpSendFilter};
use crate::graph::FilterGraph;
use crate::rtp::{EventQueue, RtcpReport, RtpSession, RtpStats, SessionEvent, SharedSession};
use crate::srtp::{self, SecureTransport, SrtpSuite};
use crate::ticker::{default_priority, Ticker, TickerParams, TickerPriority, TickerStats};
use crate::video::{DisplayFilter, PlatformContext, RenderTarget, TestPatternSource};

/// Media carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Audio => "audio",
            StreamKind::Video => "video",
        }
    }

    /// Name given to the stream's ticker thread
    pub fn ticker_name(&self) -> &'static str {
        match self {
            StreamKind::Audio => "Audio MSTicker",
            StreamKind::Video => "Video MSTicker",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Session open, no ticker yet
    Constructed,
    /// Graph attached to a running ticker
    Running,
    /// Torn down
    Stopped,
}

/// Media filters plugged around the RTP filters.
///
/// The send chain is `source -> encoder -> rtp send`, the receive chain
/// `rtp recv -> decoder -> sink`. Absent roles are skipped.
#[derive(Default)]
pub struct StreamFilters {
    pub source: Option<FilterHandle>,
    pub encoder: Option<FilterHandle>,
    pub decoder: Option<FilterHandle>,
    pub sink: Option<FilterHandle>,
}

impl StreamFilters {
    /// Tone source, Opus codec and a discarding sink
    #[cfg(feature = "opus-codec")]
    pub fn audio_default(config: &StreamConfig) -> Result<Self> {
        use crate::codec::{OpusDecoderFilter, OpusEncoderFilter, OpusParams};
        use crate::filters::{ToneSource, VoidSink};

        let params = OpusParams {
            sample_rate: config.clock_rate,
            channels: config.channels,
            bitrate: config.bitrate,
            ptime_ms: config.ptime_ms,
            payload_type: config.payload_type,
        };
        Ok(Self {
            source: Some(FilterHandle::new(
                ToneSource::new(config.clock_rate, config.channels, 440.0)
                    .with_ptime(config.ptime_ms),
            )),
            encoder: Some(FilterHandle::new(OpusEncoderFilter::new(params)?)),
            decoder: Some(FilterHandle::new(OpusDecoderFilter::new(
                config.clock_rate,
                config.channels,
            )?)),
            sink: Some(FilterHandle::new(VoidSink::new())),
        })
    }

    /// Test pattern source, raw picture packetizer and a display sink
    pub fn video_default(config: &StreamConfig, platform: Arc<dyn PlatformContext>) -> Self {
        use crate::codec::{RawVideoDecoder, RawVideoEncoder};

        Self {
            source: Some(FilterHandle::new(TestPatternSource::new(
                config.video_size,
                config.fps,
            ))),
            encoder: Some(FilterHandle::new(RawVideoEncoder::new(config.payload_type))),
            decoder: Some(FilterHandle::new(RawVideoDecoder::new())),
            sink: Some(FilterHandle::new(DisplayFilter::new(platform))),
        }
    }
}

/// One audio or video stream
pub struct MediaStream {
    kind: StreamKind,
    state: StreamState,
    config: StreamConfig,
    session: Option<SharedSession>,
    events: Option<EventQueue>,
    ticker: Option<Ticker>,
    graph: Option<Arc<FilterGraph>>,
    secure: Option<SecureTransport>,
    controller: Option<AdaptiveController>,
    rtp_send: Option<FilterHandle>,
    rtp_recv: Option<FilterHandle>,
    encoder: Option<FilterHandle>,
    decoder: Option<FilterHandle>,
    sink: Option<FilterHandle>,
    source: Option<FilterHandle>,
}

impl MediaStream {
    /// Open an audio stream's session on the configured local ports
    pub fn new_audio(config: &StreamConfig) -> Result<Self> {
        Self::new(StreamKind::Audio, config)
    }

    /// Open a video stream's session on the configured local ports
    pub fn new_video(config: &StreamConfig) -> Result<Self> {
        Self::new(StreamKind::Video, config)
    }

    fn new(kind: StreamKind, config: &StreamConfig) -> Result<Self> {
        config.validate()?;

        let mut session = RtpSession::create_duplex_with(
            config.local_rtp_port,
            config.local_rtcp_port,
            config.ipv6,
            config.session_params(),
        )?;
        session.set_source_description(config.cname.as_deref(), config.tool.as_deref());
        if let Some(dscp) = config.dscp {
            session.set_dscp(dscp)?;
        }

        let events = EventQueue::new();
        session.register_event_queue(&events);

        let adaptive = match kind {
            StreamKind::Audio => AdaptiveConfig::default(),
            StreamKind::Video => AdaptiveConfig::video(),
        };
        let mut controller = AdaptiveController::new(adaptive, config.bitrate, config.clock_rate);
        controller.set_enabled(config.adaptive_bitrate);
        controller.set_adaptive_jitter_state(config.adaptive_jitter);

        tracing::info!(
            "{} stream created on local ports {}/{}",
            kind,
            config.local_rtp_port,
            config.local_rtcp_port
        );

        Ok(Self {
            kind,
            state: StreamState::Constructed,
            config: config.clone(),
            session: Some(session.into_shared()),
            events: Some(events),
            ticker: None,
            graph: None,
            secure: None,
            controller: Some(controller),
            rtp_send: None,
            rtp_recv: None,
            encoder: None,
            decoder: None,
            sink: None,
            source: None,
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// The stream's session, until the stream is freed
    pub fn session(&self) -> Option<&SharedSession> {
        self.session.as_ref()
    }

    pub fn encoder(&self) -> Option<&FilterHandle> {
        self.encoder.as_ref()
    }

    pub fn sink(&self) -> Option<&FilterHandle> {
        self.sink.as_ref()
    }

    /// Statistics of the running ticker
    pub fn ticker_stats(&self) -> Option<TickerStats> {
        self.ticker.as_ref().map(|t| t.stats())
    }

    /// Name of the running ticker
    pub fn ticker_name(&self) -> Option<&str> {
        self.ticker.as_ref().map(|t| t.name())
    }

    pub fn ticker_priority(&self) -> Option<TickerPriority> {
        self.ticker.as_ref().map(|t| t.priority())
    }

    /// Wire the filters around the RTP filters and start the ticker.
    ///
    /// A failure leaves whatever was built in place; call [`free`] to
    /// release it.
    ///
    /// [`free`]: MediaStream::free
    pub fn start(
        &mut self,
        remote_host: &str,
        remote_rtp_port: u16,
        remote_rtcp_port: u16,
        filters: StreamFilters,
    ) -> Result<()> {
        if self.state != StreamState::Constructed {
            return Err(Error::InvalidState("stream can only be started once"));
        }
        let session = self
            .session
            .clone()
            .ok_or(Error::InvalidState("stream has no session"))?;
        session
            .lock()
            .set_remote_addr(remote_host, remote_rtp_port, remote_rtcp_port)?;

        self.rtp_send = Some(FilterHandle::new(RtpSendFilter::new(session.clone())));
        self.rtp_recv = Some(FilterHandle::new(RtpRecvFilter::new(session)));
        self.source = filters.source;
        self.encoder = filters.encoder;
        self.decoder = filters.decoder;
        self.sink = filters.sink;

        let mut graph = FilterGraph::new(format!("{} graph", self.kind));
        link_chain(
            &mut graph,
            &[
                self.source.as_ref(),
                self.encoder.as_ref(),
                self.rtp_send.as_ref(),
            ],
        )?;
        link_chain(
            &mut graph,
            &[
                self.rtp_recv.as_ref(),
                self.decoder.as_ref(),
                self.sink.as_ref(),
            ],
        )?;
        let graph = Arc::new(graph);
        self.graph = Some(graph.clone());

        let params = TickerParams::new(self.kind.ticker_name(), default_priority(self.kind))
            .with_period(Duration::from_millis(self.config.ticker_period_ms));
        let ticker = self.ticker.insert(Ticker::new(params)?);
        ticker.attach(graph)?;

        self.state = StreamState::Running;
        tracing::info!(
            "{} stream started, sending to {}:{}",
            self.kind,
            remote_host,
            remote_rtp_port
        );
        Ok(())
    }

    /// Switch the session to SRTP.
    ///
    /// On failure the session keeps its plain transports.
    pub fn enable_srtp(&mut self, suite: SrtpSuite, send_key: &str, recv_key: &str) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or(Error::InvalidState("stream has no session"))?;
        if self.secure.is_some() {
            return Err(SrtpError::AlreadyAttached.into());
        }
        let secure = srtp::attach(&mut session.lock(), suite, send_key, recv_key)?;
        self.secure = Some(secure);
        Ok(())
    }

    pub fn enable_srtp_from_config(&mut self, srtp: &SrtpConfig) -> Result<()> {
        self.enable_srtp(srtp.suite, &srtp.send_key, &srtp.recv_key)
    }

    pub fn is_secure(&self) -> bool {
        self.secure.is_some()
    }

    /// Mark outgoing packets with a DSCP value
    pub fn set_dscp(&mut self, dscp: u8) -> Result<()> {
        tracing::info!("Setting DSCP to {} for {} stream", dscp, self.kind);
        let session = self
            .session
            .as_ref()
            .ok_or(Error::InvalidState("stream has no session"))?;
        session.lock().set_dscp(dscp)?;
        self.config.dscp = Some(dscp);
        Ok(())
    }

    /// CNAME and TOOL items sent in RTCP
    pub fn set_rtcp_information(&mut self, cname: Option<&str>, tool: Option<&str>) {
        if let Some(session) = &self.session {
            session.lock().set_source_description(cname, tool);
        }
        self.config.cname = cname.map(str::to_string);
        self.config.tool = tool.map(str::to_string);
    }

    /// Copy of the session statistics, zeroed once the session is gone
    pub fn local_rtp_stats(&self) -> RtpStats {
        self.session
            .as_ref()
            .map(|s| s.lock().stats())
            .unwrap_or_default()
    }

    pub fn enable_adaptive_bitrate_control(&mut self, enabled: bool) {
        if let Some(controller) = self.controller.as_mut() {
            controller.set_enabled(enabled);
        }
        self.config.adaptive_bitrate = enabled;
    }

    pub fn enable_adaptive_jittcomp(&mut self, enabled: bool) {
        if let Some(session) = &self.session {
            session.lock().enable_adaptive_jitter_compensation(enabled);
        }
        if let Some(controller) = self.controller.as_mut() {
            controller.set_adaptive_jitter_state(enabled);
        }
        self.config.adaptive_jitter = enabled;
    }

    /// Hand a drawable to the video sink; `None` detaches the current one
    pub fn set_native_window(&self, target: Option<Arc<dyn RenderTarget>>) -> Result<()> {
        let sink = self
            .sink
            .as_ref()
            .ok_or(Error::InvalidState("stream has no sink"))?;
        sink.call(FilterMethod::SetRenderTarget(target))?;
        Ok(())
    }

    /// Handle pending session events on the caller's thread.
    ///
    /// Returns the number of events handled.
    pub fn iterate(&mut self) -> usize {
        let events = match &self.events {
            Some(queue) => queue.drain(),
            None => return 0,
        };

        for event in &events {
            match event {
                SessionEvent::RtcpReceived(report) => self.apply_report(report),
                SessionEvent::TimestampJump { from, to } => {
                    tracing::info!("{} stream: timestamp jump {} -> {}", self.kind, from, to);
                }
                SessionEvent::SsrcChanged { from, to } => {
                    tracing::info!(
                        "{} stream: remote SSRC changed {:#010x} -> {:#010x}",
                        self.kind,
                        from,
                        to
                    );
                }
                SessionEvent::Resynchronized(cause) => {
                    tracing::debug!("{} stream resynchronized ({:?})", self.kind, cause);
                }
                SessionEvent::Bye { ssrc } => {
                    tracing::info!("{} stream: BYE from {:#010x}", self.kind, ssrc);
                }
            }
        }
        events.len()
    }

    fn apply_report(&mut self, report: &RtcpReport) {
        let Some(controller) = self.controller.as_mut() else {
            return;
        };
        for action in controller.process_report(report) {
            match action {
                ControlAction::SetBitrate(bitrate) => {
                    let Some(encoder) = &self.encoder else {
                        continue;
                    };
                    match encoder.call(FilterMethod::SetBitrate(bitrate)) {
                        Ok(_) => tracing::info!("{} bitrate set to {}", self.kind, bitrate),
                        Err(e) => tracing::warn!("Could not apply bitrate {}: {}", bitrate, e),
                    }
                }
                ControlAction::EnableAdaptiveJitter(enabled) => {
                    if let Some(session) = &self.session {
                        session.lock().enable_adaptive_jitter_compensation(enabled);
                    }
                }
            }
        }
    }

    /// Release everything the stream holds. Safe to call on any state and
    /// more than once.
    pub fn free(&mut self) {
        if self.state == StreamState::Stopped {
            return;
        }

        // The ticker thread may still be inside the filters
        if let Some(ticker) = self.ticker.as_mut() {
            ticker.stop();
        }
        if let Some(secure) = self.secure.take() {
            tracing::debug!("Releasing {} SRTP context", secure.suite());
        }
        if let (Some(session), Some(events)) = (&self.session, &self.events) {
            session.lock().unregister_event_queue(events);
        }
        if let Some(session) = self.session.take() {
            session.lock().destroy();
        }
        self.events = None;
        self.controller = None;

        self.graph = None;
        for filter in [
            self.rtp_send.take(),
            self.rtp_recv.take(),
            self.encoder.take(),
            self.decoder.take(),
            self.sink.take(),
            self.source.take(),
        ]
        .into_iter()
        .flatten()
        {
            filter.destroy();
        }
        self.ticker = None;

        self.state = StreamState::Stopped;
        tracing::info!("{} stream freed", self.kind);
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        self.free();
    }
}

/// Link the present filters of a chain output 0 to input 0
fn link_chain(graph: &mut FilterGraph, chain: &[Option<&FilterHandle>]) -> std::result::Result<(), FilterError> {
    let present: Vec<&FilterHandle> = chain.iter().flatten().copied().collect();
    if let [only] = present.as_slice() {
        return graph.add(only);
    }
    for pair in present.windows(2) {
        graph.link(pair[0], 0, pair[1], 0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RawVideoDecoder, RawVideoEncoder};
    use crate::filters::VoidSink;
    use crate::ticker::AUDIO_PRIORITY_ENV;
    use crate::video::VideoGeometry;
    use serial_test::serial;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn test_config() -> StreamConfig {
        StreamConfig {
            local_rtp_port: 0,
            local_rtcp_port: 0,
            jitter_comp_ms: 0,
            adaptive_jitter: false,
            ticker_period_ms: 5,
            video_size: VideoGeometry::new(64, 48),
            ..StreamConfig::video()
        }
    }

    fn local_ports(stream: &MediaStream) -> (u16, u16) {
        let session = stream.session().unwrap().lock();
        (
            session.local_rtp_addr().unwrap().port(),
            session.local_rtcp_addr().unwrap().port(),
        )
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_free_never_started_stream() {
        let mut stream = MediaStream::new_video(&test_config()).unwrap();
        assert_eq!(stream.state(), StreamState::Constructed);
        stream.free();
        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(stream.session().is_none());
        assert!(stream.ticker_name().is_none());
        // Second call is a no-op
        stream.free();
    }

    #[test]
    fn test_stats_zeroed_after_free() {
        let mut stream = MediaStream::new_video(&test_config()).unwrap();
        stream.free();
        assert_eq!(stream.local_rtp_stats(), RtpStats::default());
    }

    #[test]
    fn test_ports_rebind_after_free() {
        let mut first = MediaStream::new_video(&test_config()).unwrap();
        let (rtp, rtcp) = local_ports(&first);
        first.free();

        let config = StreamConfig {
            local_rtp_port: rtp,
            local_rtcp_port: rtcp,
            ..test_config()
        };
        let second = MediaStream::new_video(&config).unwrap();
        assert_eq!(local_ports(&second), (rtp, rtcp));
    }

    #[test]
    fn test_start_twice_rejected() {
        let mut stream = MediaStream::new_video(&test_config()).unwrap();
        stream
            .start("127.0.0.1", 9, 9, StreamFilters::default())
            .unwrap();
        assert_eq!(stream.state(), StreamState::Running);
        assert_eq!(stream.ticker_name(), Some("Video MSTicker"));
        assert!(matches!(
            stream.start("127.0.0.1", 9, 9, StreamFilters::default()),
            Err(Error::InvalidState(_))
        ));
        stream.free();
        assert!(stream.ticker_name().is_none());
    }

    #[test]
    fn test_failed_srtp_keeps_plain_session() {
        let mut stream = MediaStream::new_video(&test_config()).unwrap();
        let peer = MediaStream::new_video(&test_config()).unwrap();
        let (peer_rtp, peer_rtcp) = local_ports(&peer);

        let result = stream.enable_srtp(SrtpSuite::AesCm128HmacSha1_80, "not a key", "nor this");
        assert!(result.is_err());
        assert!(!stream.is_secure());

        let session = stream.session().unwrap();
        assert!(!session.lock().is_secure());
        session
            .lock()
            .set_remote_addr("127.0.0.1", peer_rtp, peer_rtcp)
            .unwrap();
        session.lock().send_with_ts(b"plain payload", 0, true).unwrap();

        let peer_session = peer.session().unwrap();
        assert!(wait_for(|| {
            match peer_session.lock().receive() {
                Some(packet) => {
                    assert_eq!(&packet.payload[..], b"plain payload");
                    true
                }
                None => false,
            }
        }));
    }

    #[test]
    #[serial]
    fn test_audio_ticker_priority_from_environment() {
        std::env::set_var(AUDIO_PRIORITY_ENV, "HIGH");
        let config = StreamConfig {
            local_rtp_port: 0,
            local_rtcp_port: 0,
            ..StreamConfig::audio()
        };
        let mut stream = MediaStream::new_audio(&config).unwrap();
        let started = stream.start("127.0.0.1", 9, 9, StreamFilters::default());
        std::env::remove_var(AUDIO_PRIORITY_ENV);
        started.unwrap();

        assert_eq!(stream.ticker_name(), Some("Audio MSTicker"));
        assert_eq!(stream.ticker_priority(), Some(TickerPriority::High));
        stream.free();
        assert_eq!(stream.ticker_priority(), None);
    }

    #[test]
    fn test_video_loopback() {
        let config = test_config();
        let mut receiver = MediaStream::new_video(&config).unwrap();
        let mut sender = MediaStream::new_video(&config).unwrap();
        let (recv_rtp, recv_rtcp) = local_ports(&receiver);
        let (send_rtp, send_rtcp) = local_ports(&sender);

        let sink = VoidSink::new();
        let received = sink.counter();
        receiver
            .start(
                "127.0.0.1",
                send_rtp,
                send_rtcp,
                StreamFilters {
                    decoder: Some(FilterHandle::new(RawVideoDecoder::new())),
                    sink: Some(FilterHandle::new(sink)),
                    ..Default::default()
                },
            )
            .unwrap();
        sender
            .start(
                "127.0.0.1",
                recv_rtp,
                recv_rtcp,
                StreamFilters {
                    source: Some(FilterHandle::new(TestPatternSource::new(
                        config.video_size,
                        config.fps,
                    ))),
                    encoder: Some(FilterHandle::new(RawVideoEncoder::new(config.payload_type))),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(wait_for(|| received.load(Ordering::Relaxed) >= 2));
        assert!(sender.local_rtp_stats().packet_sent > 0);

        sender.free();
        receiver.free();
        assert_eq!(sender.state(), StreamState::Stopped);
    }

    #[test]
    fn test_toggles_before_and_after_free() {
        let mut stream = MediaStream::new_video(&test_config()).unwrap();
        stream.enable_adaptive_bitrate_control(true);
        stream.enable_adaptive_jittcomp(true);
        assert!(stream.session().unwrap().lock().adaptive_jitter_compensation());
        stream.free();
        // After teardown the toggles only record the setting
        stream.enable_adaptive_jittcomp(false);
        stream.set_rtcp_information(Some("bob@example.org"), None);
        assert!(stream.set_dscp(10).is_err());
        assert_eq!(stream.iterate(), 0);
    }

    #[cfg(feature = "opus-codec")]
    #[test]
    fn test_audio_default_filters() {
        let config = StreamConfig {
            local_rtp_port: 0,
            local_rtcp_port: 0,
            ticker_period_ms: 5,
            ..StreamConfig::audio()
        };
        let mut stream = MediaStream::new_audio(&config).unwrap();
        let filters = StreamFilters::audio_default(&config).unwrap();
        stream.start("127.0.0.1", 9, 9, filters).unwrap();
        assert_eq!(stream.ticker_name(), Some("Audio MSTicker"));
        assert!(wait_for(|| stream.ticker_stats().map_or(false, |s| s.ticks > 10)));
        assert!(wait_for(|| stream.local_rtp_stats().packet_sent > 0));
        stream.free();
    }
}
