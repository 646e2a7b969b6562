//! Duplex RTP/RTCP session
//!
//! The session owns the RTP and RTCP sockets, the transports currently
//! installed on them, the receive-side jitter buffer and the per-source
//! reception state. It never schedules anything by itself: the rtp filters
//! call [`RtpSession::send_with_ts`], [`RtpSession::receive`] and
//! [`RtpSession::rtcp_tick`] from the ticker thread.
//!
//! Discontinuities seen while receiving (timestamp jump, SSRC change) are
//! queued as internal events and handled at the end of the receive pass by
//! resynchronizing the receive side. They are then published on the
//! registered event queue as information.

use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Instant;

use crate::constants::{
    DEFAULT_JITTER_COMP_MS, DEFAULT_SAMPLE_RATE, MAX_RTP_SIZE, RTCP_DEFAULT_INTERVAL_MS,
    RTCP_STARTUP_INTERVAL_MS, RTCP_STARTUP_REPORTS,
};
use crate::error::TransportError;
use crate::rtp::addr::resolve;
use crate::rtp::events::{EventPublisher, EventQueue, ResyncCause, RtcpReport, SessionEvent};
use crate::rtp::jitter::{JitterBuffer, JitterStats};
use crate::rtp::packet::{RtpHeader, RtpPacket};
use crate::rtp::rtcp::{build_compound, ntp_now, parse_compound, RtcpPacket, SdesChunk, SenderInfo};
use crate::rtp::stats::{ReceptionState, RtpStats};
use crate::rtp::transport::{RtpTransport, TransportPair, UdpTransport};

/// Packets the jitter buffer holds at most
const JITTER_CAPACITY: usize = 256;

/// Timestamp discontinuity treated as a jump, in seconds of media clock
const TIMESTAMP_JUMP_SECONDS: u32 = 5;

// Room for SRTP/SRTCP trailers on top of a full RTP datagram
const RECV_BUFFER_SIZE: usize = MAX_RTP_SIZE + 64;

/// Session creation parameters
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub payload_type: u8,
    pub clock_rate: u32,
    pub jitter_comp_ms: u32,
    pub adaptive_jitter: bool,
    pub symmetric_rtp: bool,
    /// Packets from a new SSRC tolerated before switching to it
    pub ssrc_changed_threshold: u32,
    /// RTCP interval once the startup reports are sent
    pub rtcp_interval_ms: u64,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            payload_type: 0,
            clock_rate: DEFAULT_SAMPLE_RATE,
            jitter_comp_ms: DEFAULT_JITTER_COMP_MS,
            adaptive_jitter: true,
            symmetric_rtp: true,
            ssrc_changed_threshold: 0,
            rtcp_interval_ms: RTCP_DEFAULT_INTERVAL_MS,
        }
    }
}

/// Discontinuities noticed during a receive pass
#[derive(Debug, Clone, Copy)]
enum InternalEvent {
    TimestampJump { from: u32, to: u32 },
    SsrcChanged { from: u32, to: u32 },
}

enum Received {
    Handled,
    Discontinuity,
}

/// Duplex RTP/RTCP endpoint
pub struct RtpSession {
    params: SessionParams,
    ipv6: bool,
    rtp_socket: Option<Arc<UdpSocket>>,
    rtcp_socket: Option<Arc<UdpSocket>>,
    transports: Option<TransportPair>,
    remote_rtp: Option<SocketAddr>,
    remote_rtcp: Option<SocketAddr>,

    send_ssrc: u32,
    send_seq: u16,
    ts_offset: u32,
    last_send_ts: u32,
    sent_since_report: bool,

    source: Option<ReceptionState>,
    last_recv_ts: Option<u32>,
    candidate: Option<(u32, u32)>,
    jitter: JitterBuffer,
    internal_events: Vec<InternalEvent>,
    events: Option<EventPublisher>,

    cname: String,
    tool: Option<String>,
    next_rtcp_ms: Option<u64>,
    reports_sent: u32,

    stats: RtpStats,
    clock: Instant,
    recv_buf: Vec<u8>,
    destroyed: bool,
}

/// Session shared between the rtp filters and the stream
pub type SharedSession = Arc<Mutex<RtpSession>>;

impl RtpSession {
    /// Create a send+receive session bound on all interfaces.
    ///
    /// Sockets are non-blocking; adaptive jitter compensation and symmetric
    /// RTP are on; an SSRC change or timestamp jump resynchronizes the
    /// receive side.
    pub fn create_duplex(rtp_port: u16, rtcp_port: u16, ipv6: bool) -> Result<Self, TransportError> {
        Self::create_duplex_with(rtp_port, rtcp_port, ipv6, SessionParams::default())
    }

    pub fn create_duplex_with(
        rtp_port: u16,
        rtcp_port: u16,
        ipv6: bool,
        params: SessionParams,
    ) -> Result<Self, TransportError> {
        let rtp_socket = Arc::new(bind_udp(rtp_port, ipv6)?);
        let rtcp_socket = Arc::new(bind_udp(rtcp_port, ipv6)?);

        #[cfg(target_os = "linux")]
        {
            if !ipv6 {
                disable_udp_checksum(&rtp_socket);
            }
        }

        let transports = TransportPair::new(
            Box::new(UdpTransport::new(rtp_socket.clone())),
            Box::new(UdpTransport::new(rtcp_socket.clone())),
        );

        let mut rng = rand::thread_rng();
        let send_ssrc = rng.gen::<u32>();
        let session = Self {
            jitter: JitterBuffer::new(JITTER_CAPACITY, params.jitter_comp_ms, params.adaptive_jitter),
            params,
            ipv6,
            rtp_socket: Some(rtp_socket),
            rtcp_socket: Some(rtcp_socket),
            transports: Some(transports),
            remote_rtp: None,
            remote_rtcp: None,
            send_ssrc,
            send_seq: rng.gen(),
            ts_offset: rng.gen(),
            last_send_ts: 0,
            sent_since_report: false,
            source: None,
            last_recv_ts: None,
            candidate: None,
            internal_events: Vec::new(),
            events: None,
            cname: default_cname(),
            tool: None,
            next_rtcp_ms: None,
            reports_sent: 0,
            stats: RtpStats::default(),
            clock: Instant::now(),
            recv_buf: vec![0u8; RECV_BUFFER_SIZE],
            destroyed: false,
        };

        tracing::info!(
            "RTP session created on ports {:?}/{:?} (ssrc {:#010x})",
            session.local_rtp_addr().map(|a| a.port()),
            session.local_rtcp_addr().map(|a| a.port()),
            send_ssrc
        );
        Ok(session)
    }

    /// Wrap into the shared form used by filters
    pub fn into_shared(self) -> SharedSession {
        Arc::new(Mutex::new(self))
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    pub fn is_ipv6(&self) -> bool {
        self.ipv6
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn send_ssrc(&self) -> u32 {
        self.send_ssrc
    }

    /// SSRC of the remote source currently received, if any
    pub fn recv_ssrc(&self) -> Option<u32> {
        self.source.as_ref().map(|s| s.ssrc)
    }

    pub fn set_payload_type(&mut self, payload_type: u8) {
        self.params.payload_type = payload_type & 0x7F;
    }

    pub fn set_clock_rate(&mut self, clock_rate: u32) {
        self.params.clock_rate = clock_rate.max(1);
    }

    pub fn local_rtp_addr(&self) -> Option<SocketAddr> {
        self.rtp_socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn local_rtcp_addr(&self) -> Option<SocketAddr> {
        self.rtcp_socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn remote_rtp_addr(&self) -> Option<SocketAddr> {
        self.remote_rtp
    }

    pub fn remote_rtcp_addr(&self) -> Option<SocketAddr> {
        self.remote_rtcp
    }

    /// Set the peer's RTP and RTCP endpoints
    pub fn set_remote_addr(&mut self, host: &str, rtp_port: u16, rtcp_port: u16) -> Result<(), TransportError> {
        let rtp = resolve(host, rtp_port, self.ipv6)?;
        let rtcp = resolve(host, rtcp_port, self.ipv6)?;
        self.set_remote_socket_addrs(rtp, rtcp);
        Ok(())
    }

    pub fn set_remote_socket_addrs(&mut self, rtp: SocketAddr, rtcp: SocketAddr) {
        tracing::debug!("Remote endpoints set to {} / {}", rtp, rtcp);
        self.remote_rtp = Some(rtp);
        self.remote_rtcp = Some(rtcp);
    }

    /// SDES items sent with every RTCP report
    pub fn set_source_description(&mut self, cname: Option<&str>, tool: Option<&str>) {
        if let Some(cname) = cname {
            self.cname = cname.to_string();
        }
        self.tool = tool.map(str::to_string);
    }

    pub fn enable_adaptive_jitter_compensation(&mut self, enabled: bool) {
        self.jitter.set_adaptive(enabled);
        self.params.adaptive_jitter = enabled;
    }

    pub fn adaptive_jitter_compensation(&self) -> bool {
        self.jitter.is_adaptive()
    }

    pub fn set_jitter_compensation(&mut self, ms: u32) {
        self.params.jitter_comp_ms = ms;
        self.jitter.set_delay(ms);
    }

    pub fn set_symmetric_rtp(&mut self, enabled: bool) {
        self.params.symmetric_rtp = enabled;
    }

    /// Set the DSCP of outgoing packets on both sockets
    pub fn set_dscp(&mut self, dscp: u8) -> Result<(), TransportError> {
        let tos = (dscp as u32 & 0x3F) << 2;
        for socket in [&self.rtp_socket, &self.rtcp_socket].into_iter().flatten() {
            set_traffic_class(socket, tos, self.ipv6)?;
        }
        tracing::info!("DSCP set to {:#04x}", dscp);
        Ok(())
    }

    /// Plain UDP transports over this session's sockets.
    /// Secure transports are built around these
    pub fn udp_transports(&self) -> Result<(UdpTransport, UdpTransport), TransportError> {
        match (&self.rtp_socket, &self.rtcp_socket) {
            (Some(rtp), Some(rtcp)) => Ok((UdpTransport::new(rtp.clone()), UdpTransport::new(rtcp.clone()))),
            _ => Err(TransportError::Closed),
        }
    }

    /// Replace the RTP/RTCP transports. The session owns the new pair
    pub fn set_transports(&mut self, transports: TransportPair) -> Result<(), TransportError> {
        if self.destroyed {
            return Err(TransportError::Closed);
        }
        tracing::info!(
            "Session transports replaced by {}/{}",
            transports.rtp.name(),
            transports.rtcp.name()
        );
        self.transports = Some(transports);
        Ok(())
    }

    /// Whether the installed transports protect packets
    pub fn is_secure(&self) -> bool {
        self.transports
            .as_ref()
            .map(|t| t.rtp.is_secure())
            .unwrap_or(false)
    }

    /// Start publishing events to `queue`, replacing any previous one
    pub fn register_event_queue(&mut self, queue: &EventQueue) {
        self.events = Some(queue.publisher());
    }

    /// Stop publishing to `queue`. Returns false if it was not registered
    pub fn unregister_event_queue(&mut self, queue: &EventQueue) -> bool {
        match &self.events {
            Some(publisher) if publisher.queue_id == queue.id() => {
                self.events = None;
                true
            }
            _ => false,
        }
    }

    pub fn has_event_queue(&self) -> bool {
        self.events.is_some()
    }

    /// Milliseconds since the session was created
    pub fn now_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    /// Send one payload. `user_ts` is in media clock units from stream start
    pub fn send_with_ts(&mut self, payload: &[u8], user_ts: u32, marker: bool) -> Result<usize, TransportError> {
        if self.destroyed {
            return Err(TransportError::Closed);
        }
        let remote = self.remote_rtp.ok_or(TransportError::NoRemoteAddress)?;

        let timestamp = self.ts_offset.wrapping_add(user_ts);
        let mut header = RtpHeader::new(self.params.payload_type, self.send_seq, timestamp, self.send_ssrc);
        header.marker = marker;
        let packet = RtpPacket::new(header, bytes::Bytes::copy_from_slice(payload));
        let data = packet.to_bytes();
        if data.len() > MAX_RTP_SIZE {
            return Err(TransportError::PacketTooLarge(data.len()));
        }

        let transports = self.transports.as_mut().ok_or(TransportError::Closed)?;
        let sent = transports.rtp.send_to(&data, remote)?;

        self.send_seq = self.send_seq.wrapping_add(1);
        self.last_send_ts = timestamp;
        self.sent_since_report = true;
        self.stats.packet_sent += 1;
        self.stats.sent += payload.len() as u64;
        Ok(sent)
    }

    /// Receive pass using the session clock
    pub fn receive(&mut self) -> Option<RtpPacket> {
        let now = self.now_ms();
        self.receive_at(now)
    }

    /// Drain the sockets into the jitter buffer, then return the next packet
    /// whose playout time has come
    pub fn receive_at(&mut self, now_ms: u64) -> Option<RtpPacket> {
        if self.destroyed {
            return None;
        }
        self.poll_rtp(now_ms);
        self.poll_rtcp();

        let packet = self.jitter.get(now_ms)?;
        self.stats.packet_recv += 1;
        self.stats.recv += packet.payload.len() as u64;
        Some(packet)
    }

    fn poll_rtp(&mut self, now_ms: u64) {
        let mut buf = std::mem::take(&mut self.recv_buf);
        loop {
            let received = match self.transports.as_mut() {
                Some(t) => t.rtp.recv_from(&mut buf),
                None => break,
            };
            match received {
                Ok(Some((len, from))) => {
                    self.stats.hw_recv += len as u64;
                    let data = &buf[..len];
                    if let Received::Discontinuity = self.on_rtp(data, from, now_ms) {
                        self.process_internal_events();
                        self.on_rtp(data, from, now_ms);
                    }
                }
                Ok(None) => break,
                Err(TransportError::ReceiveFailed(e)) => {
                    tracing::warn!("RTP receive failed: {}", e);
                    break;
                }
                Err(e) => {
                    self.stats.bad += 1;
                    tracing::debug!("Dropping RTP packet: {}", e);
                }
            }
        }
        self.recv_buf = buf;
        self.process_internal_events();
    }

    fn on_rtp(&mut self, data: &[u8], from: SocketAddr, now_ms: u64) -> Received {
        let packet = match RtpPacket::parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.bad += 1;
                tracing::debug!("Dropping RTP packet from {}: {}", from, e);
                return Received::Handled;
            }
        };
        let header = &packet.header;

        if self.source.is_none() {
            tracing::info!("Receiving from ssrc {:#010x}", header.ssrc);
        }
        let clock_rate = self.params.clock_rate;
        let source = self
            .source
            .get_or_insert_with(|| ReceptionState::new(header.ssrc, header.sequence, clock_rate));

        if source.ssrc != header.ssrc {
            let count = match self.candidate {
                Some((ssrc, n)) if ssrc == header.ssrc => n + 1,
                _ => 1,
            };
            self.candidate = Some((header.ssrc, count));
            if count > self.params.ssrc_changed_threshold {
                self.internal_events.push(InternalEvent::SsrcChanged {
                    from: source.ssrc,
                    to: header.ssrc,
                });
                return Received::Discontinuity;
            }
            self.stats.discarded += 1;
            return Received::Handled;
        }
        self.candidate = None;

        // Only the accepted source may redirect outgoing RTP
        if self.params.symmetric_rtp && self.remote_rtp != Some(from) {
            tracing::debug!("Symmetric RTP: sending to {}", from);
            self.remote_rtp = Some(from);
        }

        if let Some(last) = self.last_recv_ts {
            let delta = header.timestamp.wrapping_sub(last) as i32;
            let limit = self.params.clock_rate.saturating_mul(TIMESTAMP_JUMP_SECONDS);
            if delta.unsigned_abs() > limit {
                self.internal_events.push(InternalEvent::TimestampJump {
                    from: last,
                    to: header.timestamp,
                });
                return Received::Discontinuity;
            }
        }

        let ext = source.on_packet(header.sequence, header.timestamp, now_ms);
        let jitter_ms = source.jitter_ms();
        if ext == source.highest_ext() {
            self.last_recv_ts = Some(header.timestamp);
        }
        self.jitter.put(packet, ext, now_ms);
        self.jitter.adapt(jitter_ms);
        Received::Handled
    }

    /// Resynchronize the receive side for each queued discontinuity
    fn process_internal_events(&mut self) {
        for event in std::mem::take(&mut self.internal_events) {
            let (cause, published) = match event {
                InternalEvent::TimestampJump { from, to } => {
                    tracing::info!("Timestamp jump {} -> {}, resynchronizing", from, to);
                    (ResyncCause::TimestampJump, SessionEvent::TimestampJump { from, to })
                }
                InternalEvent::SsrcChanged { from, to } => {
                    tracing::info!("SSRC changed {:#010x} -> {:#010x}, resynchronizing", from, to);
                    (ResyncCause::SsrcChanged, SessionEvent::SsrcChanged { from, to })
                }
            };
            self.resync();
            self.publish(published);
            self.publish(SessionEvent::Resynchronized(cause));
        }
    }

    fn resync(&mut self) {
        if let Some(source) = &self.source {
            self.stats.cum_packet_loss += source.cumulative_lost();
        }
        self.jitter.reset();
        self.source = None;
        self.last_recv_ts = None;
        self.candidate = None;
    }

    fn poll_rtcp(&mut self) {
        let mut buf = std::mem::take(&mut self.recv_buf);
        loop {
            let received = match self.transports.as_mut() {
                Some(t) => t.rtcp.recv_from(&mut buf),
                None => break,
            };
            match received {
                Ok(Some((len, from))) => {
                    if self.params.symmetric_rtp && self.remote_rtcp != Some(from) {
                        self.remote_rtcp = Some(from);
                    }
                    match parse_compound(&buf[..len]) {
                        Ok(packets) => self.on_rtcp(packets),
                        Err(e) => {
                            self.stats.bad += 1;
                            tracing::debug!("Dropping RTCP packet from {}: {}", from, e);
                        }
                    }
                }
                Ok(None) => break,
                Err(TransportError::ReceiveFailed(e)) => {
                    tracing::warn!("RTCP receive failed: {}", e);
                    break;
                }
                Err(e) => {
                    self.stats.bad += 1;
                    tracing::debug!("Dropping RTCP packet: {}", e);
                }
            }
        }
        self.recv_buf = buf;
    }

    fn on_rtcp(&mut self, packets: Vec<RtcpPacket>) {
        self.stats.recv_rtcp_packets += 1;
        for packet in packets {
            match packet {
                RtcpPacket::SenderReport { ssrc, info, reports } => {
                    if let Some(source) = self.source.as_mut().filter(|s| s.ssrc == ssrc) {
                        source.on_sender_report(info.ntp_middle());
                    }
                    self.publish_report(ssrc, true, &reports);
                }
                RtcpPacket::ReceiverReport { ssrc, reports } => {
                    self.publish_report(ssrc, false, &reports);
                }
                RtcpPacket::SourceDescription(chunks) => {
                    for chunk in chunks {
                        tracing::debug!("SDES from {:#010x}: cname={:?}", chunk.ssrc, chunk.cname);
                    }
                }
                RtcpPacket::Goodbye { ssrcs, reason } => {
                    for ssrc in ssrcs {
                        tracing::info!("BYE from {:#010x} ({})", ssrc, reason.as_deref().unwrap_or("no reason"));
                        self.publish(SessionEvent::Bye { ssrc });
                    }
                }
            }
        }
    }

    fn publish_report(&mut self, sender_ssrc: u32, is_sender_report: bool, reports: &[crate::rtp::rtcp::ReportBlock]) {
        let block = reports.iter().find(|b| b.ssrc == self.send_ssrc).copied();
        self.publish(SessionEvent::RtcpReceived(RtcpReport {
            sender_ssrc,
            is_sender_report,
            block,
        }));
    }

    fn publish(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    /// Send an RTCP report if one is due, using the session clock
    pub fn rtcp_tick(&mut self) -> Result<bool, TransportError> {
        let now = self.now_ms();
        self.rtcp_tick_at(now)
    }

    /// Send an RTCP report if one is due. Returns whether one was sent.
    ///
    /// The first reports go out at the startup interval, later ones at the
    /// configured interval
    pub fn rtcp_tick_at(&mut self, now_ms: u64) -> Result<bool, TransportError> {
        if self.destroyed || self.remote_rtcp.is_none() {
            return Ok(false);
        }
        let due = *self.next_rtcp_ms.get_or_insert(now_ms + RTCP_STARTUP_INTERVAL_MS);
        if now_ms < due {
            return Ok(false);
        }

        let report = self.build_report();
        self.send_rtcp(&report)?;
        self.reports_sent += 1;
        let interval = if self.reports_sent < RTCP_STARTUP_REPORTS {
            RTCP_STARTUP_INTERVAL_MS
        } else {
            self.params.rtcp_interval_ms
        };
        self.next_rtcp_ms = Some(now_ms + interval);
        Ok(true)
    }

    /// Current RTCP interval
    pub fn rtcp_interval_ms(&self) -> u64 {
        if self.reports_sent < RTCP_STARTUP_REPORTS {
            RTCP_STARTUP_INTERVAL_MS
        } else {
            self.params.rtcp_interval_ms
        }
    }

    fn build_report(&mut self) -> Vec<RtcpPacket> {
        let reports: Vec<_> = self.source.as_mut().map(|s| s.report_block()).into_iter().collect();
        let head = if self.sent_since_report {
            let (ntp_sec, ntp_frac) = ntp_now();
            RtcpPacket::SenderReport {
                ssrc: self.send_ssrc,
                info: SenderInfo {
                    ntp_sec,
                    ntp_frac,
                    rtp_timestamp: self.last_send_ts,
                    packet_count: self.stats.packet_sent as u32,
                    octet_count: self.stats.sent as u32,
                },
                reports,
            }
        } else {
            RtcpPacket::ReceiverReport {
                ssrc: self.send_ssrc,
                reports,
            }
        };
        self.sent_since_report = false;
        vec![head, self.sdes()]
    }

    fn sdes(&self) -> RtcpPacket {
        RtcpPacket::SourceDescription(vec![SdesChunk {
            ssrc: self.send_ssrc,
            cname: Some(self.cname.clone()),
            tool: self.tool.clone(),
        }])
    }

    fn send_rtcp(&mut self, packets: &[RtcpPacket]) -> Result<(), TransportError> {
        let remote = self.remote_rtcp.ok_or(TransportError::NoRemoteAddress)?;
        let data = build_compound(packets);
        let transports = self.transports.as_mut().ok_or(TransportError::Closed)?;
        transports.rtcp.send_to(&data, remote)?;
        self.stats.sent_rtcp_packets += 1;
        Ok(())
    }

    /// Get statistics
    pub fn stats(&self) -> RtpStats {
        let jitter = self.jitter.stats();
        let mut stats = self.stats;
        stats.outoftime = jitter.late;
        stats.discarded += jitter.duplicates + jitter.overflow;
        if let Some(source) = &self.source {
            stats.cum_packet_loss += source.cumulative_lost();
        }
        stats
    }

    pub fn jitter_stats(&self) -> JitterStats {
        self.jitter.stats()
    }

    /// Interarrival jitter of the current source in milliseconds
    pub fn jitter_ms(&self) -> f64 {
        self.source.as_ref().map(|s| s.jitter_ms()).unwrap_or(0.0)
    }

    /// Send BYE and close both sockets. Safe to call more than once
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        if self.remote_rtcp.is_some() && self.transports.is_some() {
            let bye = [
                RtcpPacket::ReceiverReport {
                    ssrc: self.send_ssrc,
                    reports: Vec::new(),
                },
                RtcpPacket::Goodbye {
                    ssrcs: vec![self.send_ssrc],
                    reason: None,
                },
            ];
            if let Err(e) = self.send_rtcp(&bye) {
                tracing::debug!("Could not send BYE: {}", e);
            }
        }
        if self.events.is_some() {
            tracing::warn!("Session destroyed with an event queue still registered");
            self.events = None;
        }
        self.transports = None;
        self.rtp_socket = None;
        self.rtcp_socket = None;
        self.jitter.reset();
        self.destroyed = true;
        tracing::info!("RTP session {:#010x} destroyed", self.send_ssrc);
    }
}

impl Drop for RtpSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn bind_udp(port: u16, ipv6: bool) -> Result<UdpSocket, TransportError> {
    let (domain, addr) = if ipv6 {
        (Domain::IPV6, SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
    } else {
        (Domain::IPV4, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    if ipv6 {
        // Accept IPv4-mapped peers too
        if let Err(e) = socket.set_only_v6(false) {
            tracing::warn!("Could not enable dual-stack on {}: {}", addr, e);
        }
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| TransportError::BindFailed(format!("{}: {}", addr, e)))?;
    Ok(socket.into())
}

#[cfg(target_os = "linux")]
fn disable_udp_checksum(socket: &UdpSocket) {
    use std::os::unix::io::AsRawFd;

    let on: libc::c_int = 1;
    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_NO_CHECK,
            &on as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        tracing::warn!(
            "Could not disable UDP checksum: {}",
            std::io::Error::last_os_error()
        );
    }
}

fn set_traffic_class(socket: &UdpSocket, tos: u32, ipv6: bool) -> Result<(), TransportError> {
    if !ipv6 {
        return SockRef::from(socket)
            .set_tos(tos)
            .map_err(|e| TransportError::SocketOption(format!("IP_TOS: {}", e)));
    }
    set_tclass_v6(socket, tos)
}

#[cfg(target_os = "linux")]
fn set_tclass_v6(socket: &UdpSocket, tos: u32) -> Result<(), TransportError> {
    use std::os::unix::io::AsRawFd;

    let value = tos as libc::c_int;
    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_TCLASS,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result != 0 {
        return Err(TransportError::SocketOption(format!(
            "IPV6_TCLASS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_tclass_v6(_socket: &UdpSocket, _tos: u32) -> Result<(), TransportError> {
    tracing::warn!("IPv6 traffic class not supported on this platform");
    Ok(())
}

fn default_cname() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into());
    format!("{}@unknown-host", user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session() -> RtpSession {
        let params = SessionParams {
            payload_type: 96,
            clock_rate: 8000,
            jitter_comp_ms: 0,
            adaptive_jitter: false,
            ..Default::default()
        };
        RtpSession::create_duplex_with(0, 0, false, params).unwrap()
    }

    fn connect(a: &mut RtpSession, b: &RtpSession) {
        let rtp = b.local_rtp_addr().unwrap().port();
        let rtcp = b.local_rtcp_addr().unwrap().port();
        a.set_remote_addr("127.0.0.1", rtp, rtcp).unwrap();
    }

    fn receive_with_retry(session: &mut RtpSession) -> Option<RtpPacket> {
        for _ in 0..200 {
            if let Some(packet) = session.receive() {
                return Some(packet);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    /// Raw UDP peer used to inject arbitrary packets
    fn inject(to: &RtpSession, header: RtpHeader) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let packet = RtpPacket::new(header, bytes::Bytes::from_static(b"data"));
        socket
            .send_to(&packet.to_bytes(), ("127.0.0.1", to.local_rtp_addr().unwrap().port()))
            .unwrap();
    }

    #[test]
    fn test_loopback_send_receive() {
        let mut a = session();
        let mut b = session();
        connect(&mut a, &b);

        a.send_with_ts(b"hello", 160, true).unwrap();
        let packet = receive_with_retry(&mut b).unwrap();
        assert_eq!(&packet.payload[..], b"hello");
        assert_eq!(packet.header.ssrc, a.send_ssrc());
        assert!(packet.header.marker);
        assert_eq!(packet.header.payload_type, 96);

        assert_eq!(a.stats().packet_sent, 1);
        assert_eq!(b.stats().packet_recv, 1);
        // Symmetric RTP learned the sender's address
        assert_eq!(b.remote_rtp_addr().unwrap().port(), a.local_rtp_addr().unwrap().port());
    }

    #[test]
    fn test_send_without_remote() {
        let mut a = session();
        assert!(matches!(
            a.send_with_ts(b"x", 0, false),
            Err(TransportError::NoRemoteAddress)
        ));
    }

    #[test]
    fn test_rebind_after_destroy() {
        let mut first = session();
        let rtp = first.local_rtp_addr().unwrap().port();
        let rtcp = first.local_rtcp_addr().unwrap().port();
        first.destroy();
        assert!(first.is_destroyed());
        first.destroy();

        let second = RtpSession::create_duplex(rtp, rtcp, false).unwrap();
        assert_eq!(second.local_rtp_addr().unwrap().port(), rtp);
        assert_eq!(second.local_rtcp_addr().unwrap().port(), rtcp);
    }

    #[test]
    fn test_port_in_use_fails() {
        let first = session();
        let rtp = first.local_rtp_addr().unwrap().port();
        assert!(matches!(
            RtpSession::create_duplex(rtp, 0, false),
            Err(TransportError::BindFailed(_))
        ));
    }

    #[test]
    fn test_ssrc_change_resyncs() {
        let mut b = session();
        let queue = EventQueue::new();
        b.register_event_queue(&queue);

        inject(&b, RtpHeader::new(96, 10, 1000, 0x1111));
        assert!(receive_with_retry(&mut b).is_some());
        assert_eq!(b.recv_ssrc(), Some(0x1111));

        inject(&b, RtpHeader::new(96, 500, 9000, 0x2222));
        let packet = receive_with_retry(&mut b).unwrap();
        assert_eq!(packet.header.ssrc, 0x2222);
        assert_eq!(b.recv_ssrc(), Some(0x2222));

        let events = queue.drain();
        assert!(events.contains(&SessionEvent::SsrcChanged {
            from: 0x1111,
            to: 0x2222
        }));
        assert!(events.contains(&SessionEvent::Resynchronized(ResyncCause::SsrcChanged)));
    }

    #[test]
    fn test_rejected_ssrc_does_not_redirect() {
        let mut a = session();
        let params = SessionParams {
            payload_type: 96,
            clock_rate: 8000,
            jitter_comp_ms: 0,
            adaptive_jitter: false,
            ssrc_changed_threshold: 2,
            ..Default::default()
        };
        let mut b = RtpSession::create_duplex_with(0, 0, false, params).unwrap();
        connect(&mut a, &b);

        a.send_with_ts(b"hello", 160, true).unwrap();
        assert!(receive_with_retry(&mut b).is_some());
        let peer = b.remote_rtp_addr().unwrap();
        assert_eq!(peer.port(), a.local_rtp_addr().unwrap().port());

        inject(&b, RtpHeader::new(96, 900, 5000, 0x9999));
        for _ in 0..200 {
            b.receive();
            if b.stats().discarded > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(b.stats().discarded, 1);
        assert_eq!(b.remote_rtp_addr(), Some(peer));
        assert_eq!(b.recv_ssrc(), Some(a.send_ssrc()));
    }

    #[test]
    fn test_dual_stack_socket() {
        // Hosts without IPv6 cannot run this
        let Ok(socket) = bind_udp(0, true) else {
            return;
        };
        assert!(!SockRef::from(&socket).only_v6().unwrap());
    }

    #[test]
    fn test_timestamp_jump_resyncs() {
        let mut b = session();
        let queue = EventQueue::new();
        b.register_event_queue(&queue);

        inject(&b, RtpHeader::new(96, 1, 0, 0x3333));
        assert!(receive_with_retry(&mut b).is_some());
        // Ten seconds ahead at 8 kHz
        inject(&b, RtpHeader::new(96, 2, 80_000, 0x3333));
        assert!(receive_with_retry(&mut b).is_some());

        let events = queue.drain();
        assert!(events.contains(&SessionEvent::Resynchronized(ResyncCause::TimestampJump)));
    }

    #[test]
    fn test_event_queue_unregister() {
        let mut b = session();
        let queue = EventQueue::new();
        let other = EventQueue::new();
        b.register_event_queue(&queue);
        assert!(!b.unregister_event_queue(&other));
        assert!(b.unregister_event_queue(&queue));
        assert!(!b.has_event_queue());
    }

    #[test]
    fn test_rtcp_report_reaches_peer() {
        let mut a = session();
        let mut b = session();
        connect(&mut a, &b);
        connect(&mut b, &a);
        let queue = EventQueue::new();
        b.register_event_queue(&queue);

        a.send_with_ts(b"x", 0, false).unwrap();
        assert!(!a.rtcp_tick_at(0).unwrap());
        assert!(a.rtcp_tick_at(RTCP_STARTUP_INTERVAL_MS).unwrap());
        assert_eq!(a.stats().sent_rtcp_packets, 1);

        let mut report = None;
        for _ in 0..200 {
            b.receive_at(0);
            if let Some(event) = queue.drain().into_iter().find(|e| matches!(e, SessionEvent::RtcpReceived(_))) {
                report = Some(event);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        match report {
            Some(SessionEvent::RtcpReceived(r)) => {
                assert_eq!(r.sender_ssrc, a.send_ssrc());
                assert!(r.is_sender_report);
            }
            other => panic!("no report received: {:?}", other),
        }
    }

    #[test]
    fn test_rtcp_interval_widens() {
        let mut a = session();
        let b = session();
        connect(&mut a, &b);
        assert_eq!(a.rtcp_interval_ms(), RTCP_STARTUP_INTERVAL_MS);
        let mut now = 0;
        a.rtcp_tick_at(now).unwrap();
        for _ in 0..RTCP_STARTUP_REPORTS {
            now += RTCP_STARTUP_INTERVAL_MS;
            assert!(a.rtcp_tick_at(now).unwrap());
        }
        assert_eq!(a.rtcp_interval_ms(), RTCP_DEFAULT_INTERVAL_MS);
    }

    #[test]
    fn test_destroy_sends_bye() {
        let mut a = session();
        let mut b = session();
        connect(&mut a, &b);
        let queue = EventQueue::new();
        b.register_event_queue(&queue);
        let ssrc = a.send_ssrc();
        a.destroy();

        let mut got_bye = false;
        for _ in 0..200 {
            b.receive_at(0);
            if queue.drain().contains(&SessionEvent::Bye { ssrc }) {
                got_bye = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(got_bye);
    }

    #[test]
    fn test_dscp() {
        let mut a = session();
        assert!(a.set_dscp(0x2e).is_ok());
    }
}
