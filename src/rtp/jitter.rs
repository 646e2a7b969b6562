//! Jitter compensation buffer
//!
//! Packets are kept ordered by extended sequence number and released once
//! they have waited the current compensation delay. With adaptive
//! compensation the delay follows the measured interarrival jitter.

use std::collections::VecDeque;

use crate::rtp::packet::RtpPacket;

/// Multiplier applied to the measured jitter in adaptive mode
const ADAPTIVE_JITTER_FACTOR: f64 = 3.0;

/// Jitter buffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub level: usize,
    pub capacity: usize,
    pub delay_ms: u32,
    pub late: u64,
    pub duplicates: u64,
    pub overflow: u64,
    pub lost: u64,
}

struct Buffered {
    ext: i64,
    arrival_ms: u64,
    packet: RtpPacket,
}

/// Reordering playout buffer
pub struct JitterBuffer {
    packets: VecDeque<Buffered>,
    capacity: usize,
    base_delay_ms: u32,
    delay_ms: u32,
    adaptive: bool,
    next_ext: Option<i64>,
    late: u64,
    duplicates: u64,
    overflow: u64,
    lost: u64,
}

impl JitterBuffer {
    /// Create a new jitter buffer with a nominal delay
    pub fn new(capacity: usize, delay_ms: u32, adaptive: bool) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            base_delay_ms: delay_ms,
            delay_ms,
            adaptive,
            next_ext: None,
            late: 0,
            duplicates: 0,
            overflow: 0,
            lost: 0,
        }
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    /// Switch adaptive compensation. Turning it off restores the nominal delay
    pub fn set_adaptive(&mut self, adaptive: bool) {
        self.adaptive = adaptive;
        if !adaptive {
            self.delay_ms = self.base_delay_ms;
        }
    }

    /// Set the nominal delay
    pub fn set_delay(&mut self, delay_ms: u32) {
        self.base_delay_ms = delay_ms;
        self.delay_ms = delay_ms;
    }

    /// Current compensation delay
    pub fn delay_ms(&self) -> u32 {
        self.delay_ms
    }

    /// Update the delay from the measured jitter (adaptive mode only)
    pub fn adapt(&mut self, jitter_ms: f64) {
        if !self.adaptive {
            return;
        }
        let target = (jitter_ms * ADAPTIVE_JITTER_FACTOR) as u32;
        let min = self.base_delay_ms / 2;
        let max = self.base_delay_ms.saturating_mul(4).max(min);
        let target = target.clamp(min, max);
        // Grow immediately, shrink slowly
        self.delay_ms = if target > self.delay_ms {
            target
        } else {
            self.delay_ms - (self.delay_ms - target) / 8
        };
    }

    /// Insert a packet. Returns false if it was late or a duplicate
    pub fn put(&mut self, packet: RtpPacket, ext: i64, arrival_ms: u64) -> bool {
        if matches!(self.next_ext, Some(next) if ext < next) {
            self.late += 1;
            return false;
        }

        let pos = match self.packets.binary_search_by_key(&ext, |b| b.ext) {
            Ok(_) => {
                self.duplicates += 1;
                return false;
            }
            Err(pos) => pos,
        };
        self.packets.insert(
            pos,
            Buffered {
                ext,
                arrival_ms,
                packet,
            },
        );

        while self.packets.len() > self.capacity {
            if let Some(dropped) = self.packets.pop_front() {
                self.overflow += 1;
                self.next_ext = Some(dropped.ext + 1);
            }
        }
        true
    }

    /// Release the next packet whose playout time has come
    pub fn get(&mut self, now_ms: u64) -> Option<RtpPacket> {
        let ready = self
            .packets
            .front()
            .map(|b| b.arrival_ms + self.delay_ms as u64 <= now_ms)
            .unwrap_or(false);
        if !ready {
            return None;
        }

        let buffered = self.packets.pop_front()?;
        if let Some(next) = self.next_ext {
            if buffered.ext > next {
                self.lost += (buffered.ext - next) as u64;
            }
        }
        self.next_ext = Some(buffered.ext + 1);
        Some(buffered.packet)
    }

    /// Drop everything and forget the sequence position
    pub fn reset(&mut self) {
        self.packets.clear();
        self.next_ext = None;
        self.delay_ms = self.base_delay_ms;
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Get statistics
    pub fn stats(&self) -> JitterStats {
        JitterStats {
            level: self.packets.len(),
            capacity: self.capacity,
            delay_ms: self.delay_ms,
            late: self.late,
            duplicates: self.duplicates,
            overflow: self.overflow,
            lost: self.lost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::packet::RtpHeader;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn packet(seq: u16) -> RtpPacket {
        RtpPacket::new(RtpHeader::new(0, seq, seq as u32 * 160, 1), Bytes::new())
    }

    #[test]
    fn test_holds_until_delay() {
        let mut jb = JitterBuffer::new(16, 40, false);
        assert!(jb.put(packet(0), 0, 100));
        assert!(jb.get(120).is_none());
        assert_eq!(jb.get(140).unwrap().header.sequence, 0);
    }

    #[test]
    fn test_late_and_duplicate() {
        let mut jb = JitterBuffer::new(16, 0, false);
        jb.put(packet(1), 1, 0);
        assert!(!jb.put(packet(1), 1, 0));
        jb.get(0).unwrap();
        assert!(!jb.put(packet(0), 0, 0));
        let stats = jb.stats();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.late, 1);
    }

    #[test]
    fn test_gap_counts_loss() {
        let mut jb = JitterBuffer::new(16, 0, false);
        jb.put(packet(0), 0, 0);
        jb.put(packet(3), 3, 0);
        jb.get(0).unwrap();
        jb.get(0).unwrap();
        assert_eq!(jb.stats().lost, 2);
    }

    #[test]
    fn test_adaptive_delay_tracks_jitter() {
        let mut jb = JitterBuffer::new(16, 40, true);
        jb.adapt(50.0);
        assert_eq!(jb.delay_ms(), 150);
        jb.adapt(0.0);
        assert!(jb.delay_ms() < 150 && jb.delay_ms() >= 20);
        jb.set_adaptive(false);
        assert_eq!(jb.delay_ms(), 40);
    }

    proptest! {
        #[test]
        fn prop_output_is_ordered(seqs in proptest::collection::vec(0i64..200, 1..100)) {
            let mut jb = JitterBuffer::new(256, 0, false);
            for ext in &seqs {
                jb.put(packet(*ext as u16), *ext, 0);
            }
            let mut last = None;
            while let Some(p) = jb.get(0) {
                let seq = p.header.sequence as i64;
                if let Some(prev) = last {
                    prop_assert!(seq > prev);
                }
                last = Some(seq);
            }
            prop_assert!(jb.is_empty());
        }
    }
}
