//! Packet transports used by a session
//!
//! A session sends and receives through a pair of [`RtpTransport`]s, one for
//! RTP and one for RTCP. The plain UDP transports are installed at creation;
//! secure transports may replace them later.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::error::TransportError;

/// Datagram transport for one RTP or RTCP flow
pub trait RtpTransport: Send {
    /// Send a datagram, returning the number of bytes put on the wire
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, TransportError>;

    /// Receive one datagram into `buf`, `None` when nothing is pending.
    /// The returned length covers the packet as seen by the session
    fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError>;

    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Whether packets are protected on the wire
    fn is_secure(&self) -> bool {
        false
    }
}

/// Plain UDP transport over a shared non-blocking socket
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl RtpTransport for UdpTransport {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        self.socket
            .send_to(data, addr)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // ICMP port unreachable from a previous send surfaces here on some platforms
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => Ok(None),
            Err(e) => Err(TransportError::ReceiveFailed(e.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "udp"
    }
}

/// Matched RTP and RTCP transports
pub struct TransportPair {
    pub rtp: Box<dyn RtpTransport>,
    pub rtcp: Box<dyn RtpTransport>,
}

impl TransportPair {
    pub fn new(rtp: Box<dyn RtpTransport>, rtcp: Box<dyn RtpTransport>) -> Self {
        Self { rtp, rtcp }
    }
}
