//! RTP session statistics and per-source reception accounting

use serde::Serialize;
use std::time::Instant;

use crate::rtp::rtcp::ReportBlock;

/// Counters of a transport session.
///
/// A stream without a session reports `RtpStats::default()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RtpStats {
    /// RTP packets sent
    pub packet_sent: u64,
    /// Payload bytes sent
    pub sent: u64,
    /// RTP packets delivered to the application
    pub packet_recv: u64,
    /// Payload bytes delivered to the application
    pub recv: u64,
    /// Bytes received from the network, headers included
    pub hw_recv: u64,
    /// Packets that arrived after their playout point
    pub outoftime: u64,
    /// Cumulative loss as computed for reception reports
    pub cum_packet_loss: i64,
    /// Malformed or unauthenticated packets
    pub bad: u64,
    /// Packets dropped by the jitter buffer (duplicates, overflow)
    pub discarded: u64,
    pub sent_rtcp_packets: u64,
    pub recv_rtcp_packets: u64,
}

/// Reception state for one remote source (RFC 3550 appendix A.1, A.8)
#[derive(Debug, Clone)]
pub struct ReceptionState {
    pub ssrc: u32,
    clock_rate: u32,
    base_ext: i64,
    highest_ext: i64,
    received: u64,
    expected_prior: i64,
    received_prior: u64,
    /// Interarrival jitter in timestamp units
    jitter: f64,
    last_transit: Option<u32>,
    last_sr: u32,
    last_sr_at: Option<Instant>,
}

impl ReceptionState {
    pub fn new(ssrc: u32, first_seq: u16, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate: clock_rate.max(1),
            base_ext: first_seq as i64,
            highest_ext: first_seq as i64 - 1,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            jitter: 0.0,
            last_transit: None,
            last_sr: 0,
            last_sr_at: None,
        }
    }

    /// Extend a 16-bit sequence number relative to the highest seen
    pub fn extend(&self, seq: u16) -> i64 {
        let delta = seq.wrapping_sub(self.highest_ext as u16) as i16;
        self.highest_ext + delta as i64
    }

    /// Account one received packet, returning its extended sequence number
    pub fn on_packet(&mut self, seq: u16, timestamp: u32, arrival_ms: u64) -> i64 {
        let ext = self.extend(seq);
        if ext > self.highest_ext {
            self.highest_ext = ext;
        }
        self.received += 1;

        // Transit times compared modulo 2^32 so a timestamp wrap is not a jump
        let arrival = (arrival_ms as u128 * self.clock_rate as u128 / 1000) as u32;
        let transit = arrival.wrapping_sub(timestamp);
        if let Some(last) = self.last_transit {
            let d = (transit.wrapping_sub(last) as i32).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.last_transit = Some(transit);
        ext
    }

    /// Record the arrival of a sender report from this source
    pub fn on_sender_report(&mut self, ntp_middle: u32) {
        self.last_sr = ntp_middle;
        self.last_sr_at = Some(Instant::now());
    }

    /// Highest extended sequence number received
    pub fn highest_ext(&self) -> i64 {
        self.highest_ext
    }

    pub fn expected(&self) -> i64 {
        self.highest_ext - self.base_ext + 1
    }

    pub fn cumulative_lost(&self) -> i64 {
        self.expected() - self.received as i64
    }

    /// Interarrival jitter in milliseconds
    pub fn jitter_ms(&self) -> f64 {
        self.jitter * 1000.0 / self.clock_rate as f64
    }

    /// Build a report block and start a new reporting interval
    pub fn report_block(&mut self) -> ReportBlock {
        let expected = self.expected();
        let expected_interval = expected - self.expected_prior;
        let received_interval = self.received as i64 - self.received_prior as i64;
        self.expected_prior = expected;
        self.received_prior = self.received;

        let lost_interval = expected_interval - received_interval;
        let fraction_lost = if expected_interval <= 0 || lost_interval <= 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        let delay_since_last_sr = self
            .last_sr_at
            .map(|at| (at.elapsed().as_secs_f64() * 65536.0) as u32)
            .unwrap_or(0);

        ReportBlock {
            ssrc: self.ssrc,
            fraction_lost,
            cumulative_lost: self.cumulative_lost().clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            highest_seq: self.highest_ext.max(0) as u32,
            jitter: self.jitter as u32,
            last_sr: self.last_sr,
            delay_since_last_sr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_wrap_extends() {
        let mut state = ReceptionState::new(1, 65534, 8000);
        assert_eq!(state.on_packet(65534, 0, 0), 65534);
        assert_eq!(state.on_packet(65535, 160, 20), 65535);
        assert_eq!(state.on_packet(0, 320, 40), 65536);
        assert_eq!(state.expected(), 3);
        assert_eq!(state.cumulative_lost(), 0);
    }

    #[test]
    fn test_loss_fraction() {
        let mut state = ReceptionState::new(1, 0, 8000);
        for seq in [0u16, 1, 2, 5] {
            state.on_packet(seq, seq as u32 * 160, seq as u64 * 20);
        }
        let block = state.report_block();
        assert_eq!(block.cumulative_lost, 2);
        // 2 lost out of 6 expected
        assert_eq!(block.fraction_lost, ((2u32 << 8) / 6) as u8);
        assert_eq!(block.highest_seq, 5);

        // Nothing new since the previous report
        assert_eq!(state.report_block().fraction_lost, 0);
    }

    #[test]
    fn test_jitter_zero_on_regular_arrival() {
        let mut state = ReceptionState::new(1, 0, 8000);
        for seq in 0..50u16 {
            state.on_packet(seq, seq as u32 * 160, seq as u64 * 20);
        }
        assert!(state.jitter_ms() < 0.001);
    }

    #[test]
    fn test_jitter_stable_across_timestamp_wrap() {
        let mut state = ReceptionState::new(1, 0, 48_000);
        let start = u32::MAX - 1920;
        for n in 0..6u32 {
            state.on_packet(n as u16, start.wrapping_add(n * 960), 1_000 + n as u64 * 20);
        }
        assert!(state.jitter_ms() < 1.0, "jitter {} ms", state.jitter_ms());
    }
}
