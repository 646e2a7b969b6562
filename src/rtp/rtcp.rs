//! RTCP compound packets (RFC 3550 section 6)
//!
//! Only the packet types a session emits or reacts to are modelled: sender
//! and receiver reports, source descriptions and BYE. Other types inside a
//! compound packet are skipped.

use bytes::{BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::TransportError;

pub const RTCP_SR: u8 = 200;
pub const RTCP_RR: u8 = 201;
pub const RTCP_SDES: u8 = 202;
pub const RTCP_BYE: u8 = 203;

const SDES_END: u8 = 0;
const SDES_CNAME: u8 = 1;
const SDES_TOOL: u8 = 6;

/// Seconds between the NTP epoch (1900) and the Unix epoch
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Reception report block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    /// Fraction lost since the previous report, in 1/256
    pub fraction_lost: u8,
    /// Cumulative packets lost (24-bit signed on the wire)
    pub cumulative_lost: i32,
    pub highest_seq: u32,
    /// Interarrival jitter in timestamp units
    pub jitter: u32,
    pub last_sr: u32,
    pub delay_since_last_sr: u32,
}

/// Sender information of an SR
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderInfo {
    pub ntp_sec: u32,
    pub ntp_frac: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderInfo {
    /// Middle 32 bits of the NTP timestamp, as echoed in LSR
    pub fn ntp_middle(&self) -> u32 {
        (self.ntp_sec << 16) | (self.ntp_frac >> 16)
    }
}

/// Source description chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub cname: Option<String>,
    pub tool: Option<String>,
}

/// One packet of an RTCP compound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport {
        ssrc: u32,
        info: SenderInfo,
        reports: Vec<ReportBlock>,
    },
    ReceiverReport {
        ssrc: u32,
        reports: Vec<ReportBlock>,
    },
    SourceDescription(Vec<SdesChunk>),
    Goodbye {
        ssrcs: Vec<u32>,
        reason: Option<String>,
    },
}

impl RtcpPacket {
    pub fn packet_type(&self) -> u8 {
        match self {
            RtcpPacket::SenderReport { .. } => RTCP_SR,
            RtcpPacket::ReceiverReport { .. } => RTCP_RR,
            RtcpPacket::SourceDescription(_) => RTCP_SDES,
            RtcpPacket::Goodbye { .. } => RTCP_BYE,
        }
    }

    /// Report blocks carried by an SR or RR
    pub fn reports(&self) -> &[ReportBlock] {
        match self {
            RtcpPacket::SenderReport { reports, .. } | RtcpPacket::ReceiverReport { reports, .. } => {
                reports
            }
            _ => &[],
        }
    }

    fn write(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::with_capacity(64);
        let count = match self {
            RtcpPacket::SenderReport {
                ssrc,
                info,
                reports,
            } => {
                body.put_u32(*ssrc);
                body.put_u32(info.ntp_sec);
                body.put_u32(info.ntp_frac);
                body.put_u32(info.rtp_timestamp);
                body.put_u32(info.packet_count);
                body.put_u32(info.octet_count);
                write_blocks(&mut body, reports)
            }
            RtcpPacket::ReceiverReport { ssrc, reports } => {
                body.put_u32(*ssrc);
                write_blocks(&mut body, reports)
            }
            RtcpPacket::SourceDescription(chunks) => {
                for chunk in chunks.iter().take(31) {
                    body.put_u32(chunk.ssrc);
                    let start = body.len();
                    if let Some(cname) = &chunk.cname {
                        write_sdes_item(&mut body, SDES_CNAME, cname);
                    }
                    if let Some(tool) = &chunk.tool {
                        write_sdes_item(&mut body, SDES_TOOL, tool);
                    }
                    body.put_u8(SDES_END);
                    while (body.len() - start) % 4 != 0 {
                        body.put_u8(0);
                    }
                }
                chunks.len().min(31)
            }
            RtcpPacket::Goodbye { ssrcs, reason } => {
                for ssrc in ssrcs.iter().take(31) {
                    body.put_u32(*ssrc);
                }
                if let Some(reason) = reason {
                    let text = &reason.as_bytes()[..reason.len().min(255)];
                    body.put_u8(text.len() as u8);
                    body.put_slice(text);
                    while body.len() % 4 != 0 {
                        body.put_u8(0);
                    }
                }
                ssrcs.len().min(31)
            }
        };

        buf.put_u8((2 << 6) | count as u8);
        buf.put_u8(self.packet_type());
        buf.put_u16((body.len() / 4) as u16);
        buf.put_slice(&body);
    }
}

fn write_blocks(body: &mut BytesMut, reports: &[ReportBlock]) -> usize {
    for block in reports.iter().take(31) {
        body.put_u32(block.ssrc);
        let lost = (block.cumulative_lost.clamp(-0x80_0000, 0x7F_FFFF) as u32) & 0xFF_FFFF;
        body.put_u32(((block.fraction_lost as u32) << 24) | lost);
        body.put_u32(block.highest_seq);
        body.put_u32(block.jitter);
        body.put_u32(block.last_sr);
        body.put_u32(block.delay_since_last_sr);
    }
    reports.len().min(31)
}

fn write_sdes_item(body: &mut BytesMut, item: u8, text: &str) {
    let bytes = &text.as_bytes()[..text.len().min(255)];
    body.put_u8(item);
    body.put_u8(bytes.len() as u8);
    body.put_slice(bytes);
}

/// Serialize packets into one compound packet
pub fn build_compound(packets: &[RtcpPacket]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    for packet in packets {
        packet.write(&mut buf);
    }
    buf.freeze()
}

/// Parse a compound packet. Unknown packet types are skipped
pub fn parse_compound(data: &[u8]) -> Result<Vec<RtcpPacket>, TransportError> {
    let mut packets = Vec::new();
    let mut rest = data;

    if rest.is_empty() {
        return Err(TransportError::InvalidPacket("Empty RTCP packet".into()));
    }

    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(TransportError::InvalidPacket("RTCP header too short".into()));
        }
        if rest[0] >> 6 != 2 {
            return Err(TransportError::InvalidPacket(format!(
                "Invalid RTCP version: {}",
                rest[0] >> 6
            )));
        }
        let padding = rest[0] & 0x20 != 0;
        let count = (rest[0] & 0x1F) as usize;
        let packet_type = rest[1];
        let len = (u16::from_be_bytes([rest[2], rest[3]]) as usize + 1) * 4;
        if len > rest.len() {
            return Err(TransportError::InvalidPacket(format!(
                "RTCP length {} exceeds datagram",
                len
            )));
        }

        let mut body = &rest[4..len];
        if padding {
            let pad = body.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > body.len() {
                return Err(TransportError::InvalidPacket("Invalid RTCP padding".into()));
            }
            body = &body[..body.len() - pad];
        }

        match packet_type {
            RTCP_SR => packets.push(parse_sr(body, count)?),
            RTCP_RR => packets.push(parse_rr(body, count)?),
            RTCP_SDES => packets.push(parse_sdes(body, count)?),
            RTCP_BYE => packets.push(parse_bye(body, count)?),
            other => tracing::trace!("Skipping RTCP packet type {}", other),
        }
        rest = &rest[len..];
    }
    Ok(packets)
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, TransportError> {
    data.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| TransportError::InvalidPacket("Truncated RTCP packet".into()))
}

fn parse_blocks(data: &[u8], count: usize) -> Result<Vec<ReportBlock>, TransportError> {
    (0..count)
        .map(|i| {
            let base = i * 24;
            let word = read_u32(data, base + 4)?;
            let raw = word & 0xFF_FFFF;
            let cumulative_lost = if raw & 0x80_0000 != 0 {
                raw as i32 - 0x100_0000
            } else {
                raw as i32
            };
            Ok(ReportBlock {
                ssrc: read_u32(data, base)?,
                fraction_lost: (word >> 24) as u8,
                cumulative_lost,
                highest_seq: read_u32(data, base + 8)?,
                jitter: read_u32(data, base + 12)?,
                last_sr: read_u32(data, base + 16)?,
                delay_since_last_sr: read_u32(data, base + 20)?,
            })
        })
        .collect()
}

fn parse_sr(body: &[u8], count: usize) -> Result<RtcpPacket, TransportError> {
    Ok(RtcpPacket::SenderReport {
        ssrc: read_u32(body, 0)?,
        info: SenderInfo {
            ntp_sec: read_u32(body, 4)?,
            ntp_frac: read_u32(body, 8)?,
            rtp_timestamp: read_u32(body, 12)?,
            packet_count: read_u32(body, 16)?,
            octet_count: read_u32(body, 20)?,
        },
        reports: parse_blocks(&body[24.min(body.len())..], count)?,
    })
}

fn parse_rr(body: &[u8], count: usize) -> Result<RtcpPacket, TransportError> {
    Ok(RtcpPacket::ReceiverReport {
        ssrc: read_u32(body, 0)?,
        reports: parse_blocks(&body[4.min(body.len())..], count)?,
    })
}

fn parse_sdes(body: &[u8], count: usize) -> Result<RtcpPacket, TransportError> {
    let mut chunks = Vec::with_capacity(count);
    let mut offset = 0;
    for _ in 0..count {
        let mut chunk = SdesChunk {
            ssrc: read_u32(body, offset)?,
            ..Default::default()
        };
        let start = offset + 4;
        offset = start;
        loop {
            let item = *body
                .get(offset)
                .ok_or_else(|| TransportError::InvalidPacket("Truncated SDES chunk".into()))?;
            if item == SDES_END {
                offset += 1;
                break;
            }
            let len = *body
                .get(offset + 1)
                .ok_or_else(|| TransportError::InvalidPacket("Truncated SDES item".into()))?
                as usize;
            let text = body
                .get(offset + 2..offset + 2 + len)
                .ok_or_else(|| TransportError::InvalidPacket("Truncated SDES item".into()))?;
            let text = String::from_utf8_lossy(text).into_owned();
            match item {
                SDES_CNAME => chunk.cname = Some(text),
                SDES_TOOL => chunk.tool = Some(text),
                _ => {}
            }
            offset += 2 + len;
        }
        while (offset - start) % 4 != 0 {
            offset += 1;
        }
        chunks.push(chunk);
    }
    Ok(RtcpPacket::SourceDescription(chunks))
}

fn parse_bye(body: &[u8], count: usize) -> Result<RtcpPacket, TransportError> {
    let ssrcs = (0..count)
        .map(|i| read_u32(body, i * 4))
        .collect::<Result<Vec<_>, _>>()?;
    let offset = count * 4;
    let reason = body.get(offset).and_then(|&len| {
        body.get(offset + 1..offset + 1 + len as usize)
            .map(|text| String::from_utf8_lossy(text).into_owned())
    });
    Ok(RtcpPacket::Goodbye { ssrcs, reason })
}

/// Current wall clock as an NTP timestamp (seconds, fraction)
pub fn ntp_now() -> (u32, u32) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let sec = (now.as_secs() + NTP_UNIX_OFFSET) as u32;
    let frac = ((now.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (sec, frac as u32)
}

/// Middle 32 bits of the current NTP time, in 1/65536 seconds
pub fn ntp_middle_now() -> u32 {
    let (sec, frac) = ntp_now();
    (sec << 16) | (frac >> 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> ReportBlock {
        ReportBlock {
            ssrc: 0xAABBCCDD,
            fraction_lost: 25,
            cumulative_lost: -3,
            highest_seq: 70000,
            jitter: 120,
            last_sr: 0x12345678,
            delay_since_last_sr: 65536,
        }
    }

    #[test]
    fn test_compound_sr_sdes_bye() {
        let packets = vec![
            RtcpPacket::SenderReport {
                ssrc: 1,
                info: SenderInfo {
                    ntp_sec: 10,
                    ntp_frac: 20,
                    rtp_timestamp: 30,
                    packet_count: 40,
                    octet_count: 50,
                },
                reports: vec![block()],
            },
            RtcpPacket::SourceDescription(vec![SdesChunk {
                ssrc: 1,
                cname: Some("alice@example.org".into()),
                tool: Some("engine".into()),
            }]),
            RtcpPacket::Goodbye {
                ssrcs: vec![1],
                reason: Some("done".into()),
            },
        ];
        let bytes = build_compound(&packets);
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(parse_compound(&bytes).unwrap(), packets);
    }

    #[test]
    fn test_receiver_report_without_blocks() {
        let packets = vec![RtcpPacket::ReceiverReport {
            ssrc: 9,
            reports: vec![],
        }];
        let bytes = build_compound(&packets);
        assert_eq!(bytes.len(), 8);
        assert_eq!(parse_compound(&bytes).unwrap(), packets);
    }

    #[test]
    fn test_unknown_type_skipped() {
        // APP packet (204) with one word of body, then an RR
        let mut data = vec![0x80, 204, 0, 1, 0, 0, 0, 0];
        data.extend_from_slice(&build_compound(&[RtcpPacket::ReceiverReport {
            ssrc: 5,
            reports: vec![],
        }]));
        let packets = parse_compound(&data).unwrap();
        assert_eq!(packets.len(), 1);
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = build_compound(&[RtcpPacket::ReceiverReport {
            ssrc: 9,
            reports: vec![block()],
        }]);
        assert!(parse_compound(&bytes[..bytes.len() - 4]).is_err());
        assert!(parse_compound(&[]).is_err());
    }
}
