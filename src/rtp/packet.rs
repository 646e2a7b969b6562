//! RTP packet format (RFC 3550 section 5.1)

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::TransportError;

/// Fixed header size
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP protocol version carried in every packet
pub const RTP_VERSION: u8 = 2;

/// RTP fixed header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

/// Parsed RTP packet
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence,
            timestamp,
            ssrc,
            csrc: Vec::new(),
        }
    }

    /// Serialized header length
    pub fn len(&self) -> usize {
        RTP_HEADER_SIZE + 4 * self.csrc.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn write(&self, buf: &mut BytesMut) {
        let cc = self.csrc.len().min(15) as u8;
        buf.put_u8((RTP_VERSION << 6) | cc);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in self.csrc.iter().take(15) {
            buf.put_u32(*csrc);
        }
    }
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Serialize header and payload
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.len() + self.payload.len());
        self.header.write(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a packet.
    /// Header extensions are skipped and padding is stripped
    pub fn parse(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < RTP_HEADER_SIZE {
            return Err(TransportError::InvalidPacket(format!(
                "RTP packet too short: {} bytes",
                data.len()
            )));
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(TransportError::InvalidPacket(format!(
                "Invalid RTP version: {}",
                version
            )));
        }
        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let cc = (data[0] & 0x0F) as usize;

        let mut offset = RTP_HEADER_SIZE;
        if data.len() < offset + 4 * cc {
            return Err(TransportError::InvalidPacket("Incomplete CSRC list".into()));
        }
        let csrc = data[offset..offset + 4 * cc]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        offset += 4 * cc;

        if extension {
            if data.len() < offset + 4 {
                return Err(TransportError::InvalidPacket("Incomplete extension header".into()));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + 4 * words;
            if data.len() < offset {
                return Err(TransportError::InvalidPacket("Incomplete extension data".into()));
            }
        }

        let mut end = data.len();
        if padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || offset + pad > end {
                return Err(TransportError::InvalidPacket("Invalid padding".into()));
            }
            end -= pad;
        }

        Ok(Self {
            header: RtpHeader {
                marker: data[1] & 0x80 != 0,
                payload_type: data[1] & 0x7F,
                sequence: u16::from_be_bytes([data[2], data[3]]),
                timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                csrc,
            },
            payload: Bytes::copy_from_slice(&data[offset..end]),
        })
    }
}

/// Whether a datagram looks like RTCP rather than RTP (RFC 5761 section 4)
pub fn is_rtcp(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] >> 6 == RTP_VERSION && (192..=223).contains(&data[1])
}
