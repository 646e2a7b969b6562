//! SRTP/SRTCP crypto context (RFC 3711)
//!
//! AES-128 counter mode for confidentiality, truncated HMAC-SHA1 for
//! authentication, session keys derived from a 30-byte master key + salt.
//! Replay protection is not implemented.

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha1::Sha1;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SrtpError;
use crate::srtp::SrtpSuite;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;
type HmacSha1 = Hmac<Sha1>;

pub const MASTER_KEY_LEN: usize = 16;
pub const MASTER_SALT_LEN: usize = 14;
const AUTH_KEY_LEN: usize = 20;

/// SRTCP trailer word: E flag + 31-bit index
const SRTCP_INDEX_LEN: usize = 4;
const SRTCP_E_FLAG: u32 = 0x8000_0000;

/// Key derivation labels (RFC 3711 section 4.3.2)
const LABEL_RTP_ENCRYPTION: u8 = 0x00;
const LABEL_RTP_AUTH: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;
const LABEL_RTCP_ENCRYPTION: u8 = 0x03;
const LABEL_RTCP_AUTH: u8 = 0x04;
const LABEL_RTCP_SALT: u8 = 0x05;

/// Master key and salt as exchanged in SDES `inline:` parameters
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; MASTER_KEY_LEN],
    salt: [u8; MASTER_SALT_LEN],
}

impl MasterKey {
    /// Decode a base64 key+salt
    pub fn from_base64(encoded: &str) -> Result<Self, SrtpError> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SrtpError::InvalidKey(format!("not base64: {}", e)))?;
        Self::from_bytes(&raw)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, SrtpError> {
        if raw.len() != MASTER_KEY_LEN + MASTER_SALT_LEN {
            return Err(SrtpError::InvalidKey(format!(
                "expected {} bytes, got {}",
                MASTER_KEY_LEN + MASTER_SALT_LEN,
                raw.len()
            )));
        }
        let mut key = [0u8; MASTER_KEY_LEN];
        let mut salt = [0u8; MASTER_SALT_LEN];
        key.copy_from_slice(&raw[..MASTER_KEY_LEN]);
        salt.copy_from_slice(&raw[MASTER_KEY_LEN..]);
        Ok(Self { key, salt })
    }

    /// Generate a random master key, base64 encoded
    pub fn generate_base64() -> String {
        let mut raw = [0u8; MASTER_KEY_LEN + MASTER_SALT_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut raw[..]);
        STANDARD.encode(raw)
    }

    /// AES-CM PRF output for one label
    fn derive(&self, label: u8, len: usize) -> Vec<u8> {
        let mut iv = [0u8; 16];
        iv[..MASTER_SALT_LEN].copy_from_slice(&self.salt);
        iv[7] ^= label;
        let mut out = vec![0u8; len];
        let mut cipher = Aes128Ctr::new(&self.key.into(), &iv.into());
        cipher.apply_keystream(&mut out);
        out
    }
}

/// Session keys for one direction of one flow
struct SessionKeys {
    cipher_key: [u8; 16],
    auth_key: Vec<u8>,
    salt: [u8; MASTER_SALT_LEN],
}

impl SessionKeys {
    fn derive(master: &MasterKey, enc: u8, auth: u8, salt: u8) -> Self {
        let mut cipher_key = [0u8; 16];
        cipher_key.copy_from_slice(&master.derive(enc, 16));
        let mut session_salt = [0u8; MASTER_SALT_LEN];
        session_salt.copy_from_slice(&master.derive(salt, MASTER_SALT_LEN));
        Self {
            cipher_key,
            auth_key: master.derive(auth, AUTH_KEY_LEN),
            salt: session_salt,
        }
    }

    /// XOR the AES-CM keystream for (ssrc, index) into `data`
    fn crypt(&self, ssrc: u32, index: u64, data: &mut [u8]) {
        let mut iv = [0u8; 16];
        iv[..MASTER_SALT_LEN].copy_from_slice(&self.salt);
        for (b, s) in iv[4..8].iter_mut().zip(ssrc.to_be_bytes()) {
            *b ^= s;
        }
        for (b, i) in iv[8..14].iter_mut().zip(&index.to_be_bytes()[2..]) {
            *b ^= i;
        }
        let mut cipher = Aes128Ctr::new(&self.cipher_key.into(), &iv.into());
        cipher.apply_keystream(data);
    }

    fn mac(&self) -> Result<HmacSha1, SrtpError> {
        HmacSha1::new_from_slice(&self.auth_key).map_err(|e| SrtpError::InvalidKey(e.to_string()))
    }

    fn tag(&self, parts: &[&[u8]], len: usize) -> Result<Vec<u8>, SrtpError> {
        let mut mac = self.mac()?;
        for part in parts {
            mac.update(part);
        }
        Ok(mac.finalize().into_bytes()[..len].to_vec())
    }

    fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> Result<(), SrtpError> {
        let mut mac = self.mac()?;
        for part in parts {
            mac.update(part);
        }
        mac.verify_truncated_left(tag)
            .map_err(|_| SrtpError::AuthenticationFailed)
    }
}

struct DirectionKeys {
    rtp: SessionKeys,
    rtcp: SessionKeys,
}

impl DirectionKeys {
    fn derive(master: &MasterKey) -> Self {
        Self {
            rtp: SessionKeys::derive(master, LABEL_RTP_ENCRYPTION, LABEL_RTP_AUTH, LABEL_RTP_SALT),
            rtcp: SessionKeys::derive(master, LABEL_RTCP_ENCRYPTION, LABEL_RTCP_AUTH, LABEL_RTCP_SALT),
        }
    }
}

/// Receiver rollover state for one remote SSRC
#[derive(Debug, Clone, Copy)]
struct RecvState {
    roc: u32,
    highest_seq: u16,
}

/// Crypto state shared by a session's SRTP and SRTCP transports
pub struct SrtpContext {
    suite: SrtpSuite,
    send_ssrc: u32,
    outbound: DirectionKeys,
    inbound: DirectionKeys,
    send_roc: u32,
    last_send_seq: Option<u16>,
    srtcp_index: u32,
    recv: HashMap<u32, RecvState>,
}

/// Handle shared between the transports and the stream
pub type SharedSrtpContext = Arc<Mutex<SrtpContext>>;

impl SrtpContext {
    /// Build a context. The outbound policy only accepts `send_ssrc`
    pub fn new(suite: SrtpSuite, send_ssrc: u32, send_key: &str, recv_key: &str) -> Result<Self, SrtpError> {
        let send = MasterKey::from_base64(send_key)?;
        let recv = MasterKey::from_base64(recv_key)?;
        Ok(Self::from_keys(suite, send_ssrc, &send, &recv))
    }

    pub fn from_keys(suite: SrtpSuite, send_ssrc: u32, send: &MasterKey, recv: &MasterKey) -> Self {
        Self {
            suite,
            send_ssrc,
            outbound: DirectionKeys::derive(send),
            inbound: DirectionKeys::derive(recv),
            send_roc: 0,
            last_send_seq: None,
            srtcp_index: 0,
            recv: HashMap::new(),
        }
    }

    pub fn into_shared(self) -> SharedSrtpContext {
        Arc::new(Mutex::new(self))
    }

    pub fn suite(&self) -> SrtpSuite {
        self.suite
    }

    /// Encrypt and authenticate an RTP packet in place
    pub fn protect_rtp(&mut self, packet: &mut Vec<u8>) -> Result<(), SrtpError> {
        let header_len = rtp_header_len(packet)?;
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        if ssrc != self.send_ssrc {
            return Err(SrtpError::SsrcMismatch(ssrc));
        }

        if let Some(last) = self.last_send_seq {
            if seq < last && last - seq > 0x8000 {
                self.send_roc = self.send_roc.wrapping_add(1);
            }
        }
        self.last_send_seq = Some(seq);
        let index = ((self.send_roc as u64) << 16) | seq as u64;

        let keys = &self.outbound.rtp;
        if self.suite.encrypts() {
            keys.crypt(ssrc, index, &mut packet[header_len..]);
        }
        let tag_len = self.suite.rtp_tag_len();
        if tag_len > 0 {
            let tag = keys.tag(&[packet.as_slice(), &self.send_roc.to_be_bytes()[..]], tag_len)?;
            packet.extend_from_slice(&tag);
        }
        Ok(())
    }

    /// Authenticate and decrypt an RTP packet in place, returning its
    /// plaintext length
    pub fn unprotect_rtp(&mut self, packet: &mut [u8]) -> Result<usize, SrtpError> {
        let tag_len = self.suite.rtp_tag_len();
        let header_len = rtp_header_len(packet)?;
        if packet.len() < header_len + tag_len {
            return Err(SrtpError::PacketTooShort(packet.len()));
        }
        let seq = u16::from_be_bytes([packet[2], packet[3]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);

        let state = self.recv.get(&ssrc).copied();
        let roc = estimate_roc(state, seq);
        let end = packet.len() - tag_len;

        let keys = &self.inbound.rtp;
        if tag_len > 0 {
            let (authenticated, tag) = packet.split_at(end);
            keys.verify(&[authenticated, &roc.to_be_bytes()[..]], tag)?;
        }
        if self.suite.encrypts() {
            let index = ((roc as u64) << 16) | seq as u64;
            keys.crypt(ssrc, index, &mut packet[header_len..end]);
        }

        let next = match state {
            None => RecvState { roc, highest_seq: seq },
            Some(s) if roc > s.roc => RecvState { roc, highest_seq: seq },
            Some(s) if roc == s.roc && seq > s.highest_seq => RecvState { roc, highest_seq: seq },
            Some(s) => s,
        };
        self.recv.insert(ssrc, next);
        Ok(end)
    }

    /// Encrypt and authenticate an RTCP compound packet in place
    pub fn protect_rtcp(&mut self, packet: &mut Vec<u8>) -> Result<(), SrtpError> {
        if packet.len() < 8 {
            return Err(SrtpError::PacketTooShort(packet.len()));
        }
        let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let index = self.srtcp_index;
        self.srtcp_index = (self.srtcp_index + 1) & !SRTCP_E_FLAG;

        let keys = &self.outbound.rtcp;
        let mut trailer = index;
        if self.suite.encrypts() {
            keys.crypt(ssrc, index as u64, &mut packet[8..]);
            trailer |= SRTCP_E_FLAG;
        }
        packet.extend_from_slice(&trailer.to_be_bytes());

        let tag_len = self.suite.rtcp_tag_len();
        if tag_len > 0 {
            let tag = keys.tag(&[packet.as_slice()], tag_len)?;
            packet.extend_from_slice(&tag);
        }
        Ok(())
    }

    /// Authenticate and decrypt an SRTCP packet in place, returning its
    /// plaintext length
    pub fn unprotect_rtcp(&mut self, packet: &mut [u8]) -> Result<usize, SrtpError> {
        let tag_len = self.suite.rtcp_tag_len();
        if packet.len() < 8 + SRTCP_INDEX_LEN + tag_len {
            return Err(SrtpError::PacketTooShort(packet.len()));
        }
        let auth_end = packet.len() - tag_len;
        let keys = &self.inbound.rtcp;
        if tag_len > 0 {
            let (authenticated, tag) = packet.split_at(auth_end);
            keys.verify(&[authenticated], tag)?;
        }

        let end = auth_end - SRTCP_INDEX_LEN;
        let trailer = u32::from_be_bytes([packet[end], packet[end + 1], packet[end + 2], packet[end + 3]]);
        if trailer & SRTCP_E_FLAG != 0 {
            let ssrc = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
            let index = (trailer & !SRTCP_E_FLAG) as u64;
            keys.crypt(ssrc, index, &mut packet[8..end]);
        }
        Ok(end)
    }
}

/// Rollover counter guess for a received sequence number (RFC 3711 appendix A)
fn estimate_roc(state: Option<RecvState>, seq: u16) -> u32 {
    let Some(state) = state else {
        return 0;
    };
    let s_l = state.highest_seq as i32;
    let seq = seq as i32;
    if s_l < 0x8000 {
        if seq - s_l > 0x8000 {
            state.roc.wrapping_sub(1)
        } else {
            state.roc
        }
    } else if s_l - 0x8000 > seq {
        state.roc.wrapping_add(1)
    } else {
        state.roc
    }
}

fn rtp_header_len(packet: &[u8]) -> Result<usize, SrtpError> {
    if packet.len() < 12 {
        return Err(SrtpError::PacketTooShort(packet.len()));
    }
    let cc = (packet[0] & 0x0F) as usize;
    let mut len = 12 + 4 * cc;
    if packet[0] & 0x10 != 0 {
        if packet.len() < len + 4 {
            return Err(SrtpError::PacketTooShort(packet.len()));
        }
        let words = u16::from_be_bytes([packet[len + 2], packet[len + 3]]) as usize;
        len += 4 + 4 * words;
    }
    if packet.len() < len {
        return Err(SrtpError::PacketTooShort(packet.len()));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::packet::{RtpHeader, RtpPacket};
    use crate::rtp::rtcp::{build_compound, parse_compound, RtcpPacket};
    use bytes::Bytes;

    const SSRC: u32 = 0xCAFEBABE;

    fn key(fill: u8) -> String {
        STANDARD.encode([fill; 30])
    }

    fn pair(suite: SrtpSuite) -> (SrtpContext, SrtpContext) {
        let a = SrtpContext::new(suite, SSRC, &key(1), &key(2)).unwrap();
        let b = SrtpContext::new(suite, 0x1234, &key(2), &key(1)).unwrap();
        (a, b)
    }

    fn rtp(seq: u16, payload: &'static [u8]) -> Vec<u8> {
        RtpPacket::new(RtpHeader::new(96, seq, 1000, SSRC), Bytes::from_static(payload))
            .to_bytes()
            .to_vec()
    }

    #[test]
    fn test_rtp_roundtrip() {
        let (mut a, mut b) = pair(SrtpSuite::AesCm128HmacSha1_80);
        let plain = rtp(1, b"secret payload");
        let mut packet = plain.clone();
        a.protect_rtp(&mut packet).unwrap();
        assert_eq!(packet.len(), plain.len() + 10);
        assert_ne!(&packet[12..plain.len()], &plain[12..]);

        let len = b.unprotect_rtp(&mut packet).unwrap();
        assert_eq!(&packet[..len], &plain[..]);
    }

    #[test]
    fn test_short_tag_suite() {
        let (mut a, mut b) = pair(SrtpSuite::AesCm128HmacSha1_32);
        let mut packet = rtp(1, b"x");
        a.protect_rtp(&mut packet).unwrap();
        assert_eq!(packet.len(), 13 + 4);
        assert_eq!(b.unprotect_rtp(&mut packet).unwrap(), 13);
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let (mut a, mut b) = pair(SrtpSuite::AesCm128HmacSha1_80);
        let mut packet = rtp(1, b"secret payload");
        a.protect_rtp(&mut packet).unwrap();
        packet[14] ^= 0x01;
        assert!(matches!(
            b.unprotect_rtp(&mut packet),
            Err(SrtpError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut a = SrtpContext::new(SrtpSuite::AesCm128HmacSha1_80, SSRC, &key(1), &key(2)).unwrap();
        let mut c = SrtpContext::new(SrtpSuite::AesCm128HmacSha1_80, 7, &key(2), &key(3)).unwrap();
        let mut packet = rtp(1, b"payload");
        a.protect_rtp(&mut packet).unwrap();
        assert!(c.unprotect_rtp(&mut packet).is_err());
    }

    #[test]
    fn test_rollover() {
        let (mut a, mut b) = pair(SrtpSuite::AesCm128HmacSha1_80);
        for seq in [65534u16, 65535, 0, 1] {
            let plain = rtp(seq, b"roll");
            let mut packet = plain.clone();
            a.protect_rtp(&mut packet).unwrap();
            let len = b.unprotect_rtp(&mut packet).unwrap();
            assert_eq!(&packet[..len], &plain[..]);
        }
        assert_eq!(a.send_roc, 1);
    }

    #[test]
    fn test_outbound_ssrc_enforced() {
        let (mut a, _) = pair(SrtpSuite::AesCm128HmacSha1_80);
        let mut packet = RtpPacket::new(RtpHeader::new(96, 1, 0, 99), Bytes::new()).to_bytes().to_vec();
        assert!(matches!(a.protect_rtp(&mut packet), Err(SrtpError::SsrcMismatch(99))));
    }

    #[test]
    fn test_rtcp_roundtrip() {
        let (mut a, mut b) = pair(SrtpSuite::AesCm128HmacSha1_32);
        let packets = vec![RtcpPacket::ReceiverReport {
            ssrc: SSRC,
            reports: vec![],
        }];
        let plain = build_compound(&packets).to_vec();
        let mut packet = plain.clone();
        a.protect_rtcp(&mut packet).unwrap();
        // RTCP keeps the 80-bit tag
        assert_eq!(packet.len(), plain.len() + 4 + 10);

        let len = b.unprotect_rtcp(&mut packet).unwrap();
        assert_eq!(parse_compound(&packet[..len]).unwrap(), packets);
    }

    #[test]
    fn test_bad_keys() {
        assert!(MasterKey::from_base64("not base64!").is_err());
        assert!(MasterKey::from_base64(&STANDARD.encode([0u8; 16])).is_err());
        assert!(MasterKey::from_base64(&MasterKey::generate_base64()).is_ok());
    }
}
