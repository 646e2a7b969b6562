//! Session event queue
//!
//! A session publishes informational events (received RTCP, self-healing
//! resyncs) to at most one registered queue. The owner drains it from its
//! own thread, typically from `MediaStream::iterate`.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::rtp::rtcp::ReportBlock;

const EVENT_QUEUE_CAPACITY: usize = 128;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Why the receive side was resynchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncCause {
    TimestampJump,
    SsrcChanged,
}

/// Summary of one received RTCP report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcpReport {
    /// SSRC of the reporting peer
    pub sender_ssrc: u32,
    /// Whether the peer sent a sender report
    pub is_sender_report: bool,
    /// Block describing how the peer receives our stream, if present
    pub block: Option<ReportBlock>,
}

/// Events published by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    RtcpReceived(RtcpReport),
    TimestampJump { from: u32, to: u32 },
    SsrcChanged { from: u32, to: u32 },
    Resynchronized(ResyncCause),
    Bye { ssrc: u32 },
}

/// Receiving end of a session's events
pub struct EventQueue {
    id: u64,
    tx: Sender<SessionEvent>,
    rx: Receiver<SessionEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = bounded(EVENT_QUEUE_CAPACITY);
        Self {
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            rx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take the next pending event
    pub fn try_next(&self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }

    /// Take all pending events
    pub fn drain(&self) -> Vec<SessionEvent> {
        self.rx.try_iter().collect()
    }

    pub(crate) fn publisher(&self) -> EventPublisher {
        EventPublisher {
            queue_id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending end held by the session
#[derive(Clone)]
pub(crate) struct EventPublisher {
    pub queue_id: u64,
    tx: Sender<SessionEvent>,
}

impl EventPublisher {
    pub fn publish(&self, event: SessionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!("Event queue {} full, dropping {:?}", self.queue_id, event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_drain() {
        let queue = EventQueue::new();
        let publisher = queue.publisher();
        publisher.publish(SessionEvent::Resynchronized(ResyncCause::SsrcChanged));
        publisher.publish(SessionEvent::Bye { ssrc: 3 });
        assert_eq!(
            queue.try_next(),
            Some(SessionEvent::Resynchronized(ResyncCause::SsrcChanged))
        );
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn test_full_queue_drops() {
        let queue = EventQueue::new();
        let publisher = queue.publisher();
        for ssrc in 0..(EVENT_QUEUE_CAPACITY as u32 + 10) {
            publisher.publish(SessionEvent::Bye { ssrc });
        }
        assert_eq!(queue.drain().len(), EVENT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_unique_ids() {
        assert_ne!(EventQueue::new().id(), EventQueue::new().id());
    }
}
