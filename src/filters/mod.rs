//! Concrete filters used by audio and video streams

pub mod rtp_recv;
pub mod rtp_send;
pub mod tone;
pub mod void_sink;

pub use rtp_recv::RtpRecvFilter;
pub use rtp_send::RtpSendFilter;
pub use tone::ToneSource;
pub use void_sink::VoidSink;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterHandle, MediaUnit};
    use crate::graph::FilterGraph;
    use crate::rtp::{RtpSession, SessionParams};
    use bytes::Bytes;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn session() -> RtpSession {
        let params = SessionParams {
            payload_type: 96,
            jitter_comp_ms: 0,
            adaptive_jitter: false,
            ..Default::default()
        };
        RtpSession::create_duplex_with(0, 0, false, params).unwrap()
    }

    #[test]
    fn test_send_and_receive_through_graphs() {
        let tx = session().into_shared();
        let rx = session().into_shared();
        {
            let rx = rx.lock();
            let rtp = rx.local_rtp_addr().unwrap().port();
            let rtcp = rx.local_rtcp_addr().unwrap().port();
            tx.lock().set_remote_addr("127.0.0.1", rtp, rtcp).unwrap();
        }

        let send = FilterHandle::new(RtpSendFilter::new(tx.clone()));
        for i in 0..3u32 {
            let unit = MediaUnit::encoded(Bytes::from(vec![i as u8; 20]), 96, i * 960, false);
            send.input(0).unwrap().push(unit);
        }
        send.run_tick(0, Duration::ZERO);
        assert_eq!(tx.lock().stats().packet_sent, 3);

        let recv = FilterHandle::new(RtpRecvFilter::new(rx.clone()));
        let sink = VoidSink::new();
        let received = sink.counter();
        let sink = FilterHandle::new(sink);
        let mut graph = FilterGraph::new("rx");
        graph.link(&recv, 0, &sink, 0).unwrap();

        for tick in 0..100 {
            graph.step(tick, Duration::from_millis(tick * 10)).unwrap();
            if received.load(Ordering::Relaxed) == 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(received.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_send_without_remote_is_not_an_error() {
        let tx = session().into_shared();
        let send = FilterHandle::new(RtpSendFilter::new(tx));
        send.input(0)
            .unwrap()
            .push(MediaUnit::encoded(Bytes::from_static(b"x"), 96, 0, false));
        send.run_tick(0, Duration::ZERO);
        assert_eq!(send.errors(), 0);
    }
}
