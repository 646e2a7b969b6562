//! SRTP transports wrapping the session's UDP transports

use std::net::SocketAddr;

use crate::error::TransportError;
use crate::rtp::transport::{RtpTransport, UdpTransport};
use crate::srtp::context::SharedSrtpContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Rtp,
    Rtcp,
}

/// Protects outgoing and unprotects incoming packets of one flow
pub struct SrtpTransport {
    inner: UdpTransport,
    context: SharedSrtpContext,
    flow: Flow,
    scratch: Vec<u8>,
}

impl SrtpTransport {
    pub fn rtp(inner: UdpTransport, context: SharedSrtpContext) -> Self {
        Self::new(inner, context, Flow::Rtp)
    }

    pub fn rtcp(inner: UdpTransport, context: SharedSrtpContext) -> Self {
        Self::new(inner, context, Flow::Rtcp)
    }

    fn new(inner: UdpTransport, context: SharedSrtpContext, flow: Flow) -> Self {
        Self {
            inner,
            context,
            flow,
            scratch: Vec::new(),
        }
    }
}

impl RtpTransport for SrtpTransport {
    fn send_to(&mut self, data: &[u8], addr: SocketAddr) -> Result<usize, TransportError> {
        self.scratch.clear();
        self.scratch.extend_from_slice(data);
        {
            let mut context = self.context.lock();
            match self.flow {
                Flow::Rtp => context.protect_rtp(&mut self.scratch)?,
                Flow::Rtcp => context.protect_rtcp(&mut self.scratch)?,
            }
        }
        self.inner.send_to(&self.scratch, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        let Some((len, from)) = self.inner.recv_from(buf)? else {
            return Ok(None);
        };
        let packet = &mut buf[..len];
        let mut context = self.context.lock();
        let plain = match self.flow {
            Flow::Rtp => context.unprotect_rtp(packet)?,
            Flow::Rtcp => context.unprotect_rtcp(packet)?,
        };
        Ok(Some((plain, from)))
    }

    fn name(&self) -> &'static str {
        match self.flow {
            Flow::Rtp => "srtp",
            Flow::Rtcp => "srtcp",
        }
    }

    fn is_secure(&self) -> bool {
        true
    }
}
