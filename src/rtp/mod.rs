//! RTP/RTCP transport session
//!
//! Wire formats (RFC 3550), the duplex session with its jitter buffer and
//! self-healing receive side, and the event queue sessions publish to.

pub mod addr;
pub mod events;
pub mod jitter;
pub mod packet;
pub mod rtcp;
pub mod session;
pub mod stats;
pub mod transport;

pub use addr::is_ipv6;
pub use events::{EventQueue, ResyncCause, RtcpReport, SessionEvent};
pub use jitter::{JitterBuffer, JitterStats};
pub use packet::{RtpHeader, RtpPacket};
pub use session::{RtpSession, SessionParams, SharedSession};
pub use stats::RtpStats;
pub use transport::{RtpTransport, TransportPair, UdpTransport};
