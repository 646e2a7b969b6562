//! Secure transport adapter (SRTP)
//!
//! Upgrades a session to SRTP/SRTCP by building a crypto context from a
//! suite and two master keys, then replacing the session's plain transports
//! with encrypting ones around that context. Support is compiled in with
//! the `srtp` cargo feature; without it every attach fails with
//! [`SrtpError::NotSupported`] and nothing changes.

#[cfg(feature = "srtp")]
pub mod context;
#[cfg(feature = "srtp")]
pub mod transport;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, SrtpError};
use crate::rtp::RtpSession;

#[cfg(feature = "srtp")]
pub use context::{MasterKey, SharedSrtpContext, SrtpContext};
#[cfg(feature = "srtp")]
pub use transport::SrtpTransport;

/// Whether SRTP support is compiled in
pub fn is_supported() -> bool {
    cfg!(feature = "srtp")
}

/// SRTP crypto suite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SrtpSuite {
    #[serde(rename = "AES_CM_128_HMAC_SHA1_80")]
    AesCm128HmacSha1_80,
    #[serde(rename = "AES_CM_128_HMAC_SHA1_32")]
    AesCm128HmacSha1_32,
    #[serde(rename = "AES_CM_128_NO_AUTH")]
    AesCm128NoAuth,
    #[serde(rename = "NULL_CIPHER_HMAC_SHA1_80")]
    NullCipherHmacSha1_80,
}

impl SrtpSuite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SrtpSuite::AesCm128HmacSha1_80 => "AES_CM_128_HMAC_SHA1_80",
            SrtpSuite::AesCm128HmacSha1_32 => "AES_CM_128_HMAC_SHA1_32",
            SrtpSuite::AesCm128NoAuth => "AES_CM_128_NO_AUTH",
            SrtpSuite::NullCipherHmacSha1_80 => "NULL_CIPHER_HMAC_SHA1_80",
        }
    }

    /// Whether payloads are encrypted
    pub fn encrypts(&self) -> bool {
        !matches!(self, SrtpSuite::NullCipherHmacSha1_80)
    }

    /// SRTP authentication tag length in bytes
    pub fn rtp_tag_len(&self) -> usize {
        match self {
            SrtpSuite::AesCm128HmacSha1_80 | SrtpSuite::NullCipherHmacSha1_80 => 10,
            SrtpSuite::AesCm128HmacSha1_32 => 4,
            SrtpSuite::AesCm128NoAuth => 0,
        }
    }

    /// SRTCP authentication tag length in bytes (80 bits unless unauthenticated)
    pub fn rtcp_tag_len(&self) -> usize {
        match self {
            SrtpSuite::AesCm128NoAuth => 0,
            _ => 10,
        }
    }
}

impl fmt::Display for SrtpSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SrtpSuite {
    type Err = SrtpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            SrtpSuite::AesCm128HmacSha1_80,
            SrtpSuite::AesCm128HmacSha1_32,
            SrtpSuite::AesCm128NoAuth,
            SrtpSuite::NullCipherHmacSha1_80,
        ]
        .into_iter()
        .find(|suite| suite.as_str().eq_ignore_ascii_case(s.trim()))
        .ok_or_else(|| SrtpError::UnknownSuite(s.to_string()))
    }
}

/// An attached secure transport.
///
/// The session owns the installed SRTP transports; this keeps a shared
/// handle to their crypto context. Dropping it releases that handle only
pub struct SecureTransport {
    suite: SrtpSuite,
    #[cfg(feature = "srtp")]
    context: SharedSrtpContext,
}

impl SecureTransport {
    pub fn suite(&self) -> SrtpSuite {
        self.suite
    }

    #[cfg(feature = "srtp")]
    pub fn context(&self) -> &SharedSrtpContext {
        &self.context
    }
}

/// Attach SRTP to a session.
///
/// On any failure the session keeps its current transports
pub fn attach(
    session: &mut RtpSession,
    suite: SrtpSuite,
    send_key: &str,
    recv_key: &str,
) -> Result<SecureTransport, Error> {
    attach_impl(session, suite, send_key, recv_key)
}

#[cfg(not(feature = "srtp"))]
fn attach_impl(
    _session: &mut RtpSession,
    _suite: SrtpSuite,
    _send_key: &str,
    _recv_key: &str,
) -> Result<SecureTransport, Error> {
    tracing::error!("SRTP support not compiled in");
    Err(SrtpError::NotSupported.into())
}

#[cfg(feature = "srtp")]
fn attach_impl(
    session: &mut RtpSession,
    suite: SrtpSuite,
    send_key: &str,
    recv_key: &str,
) -> Result<SecureTransport, Error> {
    use crate::rtp::TransportPair;

    if session.is_secure() {
        return Err(SrtpError::AlreadyAttached.into());
    }

    let context = SrtpContext::new(suite, session.send_ssrc(), send_key, recv_key)
        .map_err(|e| {
            tracing::error!("Failed to create SRTP context: {}", e);
            e
        })?
        .into_shared();

    let (rtp, rtcp) = session.udp_transports()?;
    session.set_transports(TransportPair::new(
        Box::new(SrtpTransport::rtp(rtp, context.clone())),
        Box::new(SrtpTransport::rtcp(rtcp, context.clone())),
    ))?;

    tracing::info!("SRTP enabled with {}", suite);
    Ok(SecureTransport { suite, context })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{RtpPacket, SessionParams};
    use std::time::Duration;

    #[test]
    fn test_suite_names() {
        assert_eq!(
            "aes_cm_128_hmac_sha1_32".parse::<SrtpSuite>().unwrap(),
            SrtpSuite::AesCm128HmacSha1_32
        );
        assert!("AES_256_GCM".parse::<SrtpSuite>().is_err());
        assert_eq!(SrtpSuite::AesCm128HmacSha1_32.rtcp_tag_len(), 10);
    }

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

    fn receive(session: &mut RtpSession) -> Option<RtpPacket> {
        for _ in 0..200 {
            if let Some(packet) = session.receive() {
                return Some(packet);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_failed_attach_sends_plain() {
        let mut a = session();
        let mut b = session();
        connect(&mut a, &b);

        // Rejected either for lack of SRTP support or for the key itself
        let result = attach(&mut a, SrtpSuite::AesCm128HmacSha1_80, "bogus", "bogus");
        if cfg!(feature = "srtp") {
            assert!(matches!(result, Err(Error::Srtp(SrtpError::InvalidKey(_)))));
        } else {
            assert!(matches!(result, Err(Error::Srtp(SrtpError::NotSupported))));
        }
        assert!(!a.is_secure());

        a.send_with_ts(b"clear", 0, false).unwrap();
        let packet = receive(&mut b).unwrap();
        assert_eq!(&packet.payload[..], b"clear");
    }

    #[cfg(feature = "srtp")]
    mod secure {
        use super::*;

        #[test]
        fn test_encrypted_exchange() {
            let k1 = MasterKey::generate_base64();
            let k2 = MasterKey::generate_base64();
            let mut a = session();
            let mut b = session();
            connect(&mut a, &b);

            let _sa = attach(&mut a, SrtpSuite::AesCm128HmacSha1_80, &k1, &k2).unwrap();
            let _sb = attach(&mut b, SrtpSuite::AesCm128HmacSha1_80, &k2, &k1).unwrap();
            assert!(a.is_secure() && b.is_secure());

            a.send_with_ts(b"top secret", 0, false).unwrap();
            let packet = receive(&mut b).unwrap();
            assert_eq!(&packet.payload[..], b"top secret");
        }

        #[test]
        fn test_plain_peer_cannot_read() {
            let k1 = MasterKey::generate_base64();
            let mut a = session();
            let mut b = session();
            connect(&mut a, &b);
            attach(&mut a, SrtpSuite::AesCm128HmacSha1_80, &k1, &k1).unwrap();

            a.send_with_ts(b"top secret", 0, false).unwrap();
            if let Some(packet) = receive(&mut b) {
                assert_ne!(&packet.payload[..], b"top secret");
            }
        }

        #[test]
        fn test_second_attach_rejected() {
            let key = MasterKey::generate_base64();
            let mut a = session();
            attach(&mut a, SrtpSuite::AesCm128HmacSha1_32, &key, &key).unwrap();
            assert!(matches!(
                attach(&mut a, SrtpSuite::AesCm128HmacSha1_80, &key, &key),
                Err(Error::Srtp(SrtpError::AlreadyAttached))
            ));
        }
    }
}
