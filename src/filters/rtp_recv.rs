//! Pulls packets out of the stream's session and drives its RTCP schedule

use crate::error::FilterError;
use crate::filter::{Filter, FilterCategory, FilterDesc, FilterId, MediaUnit, ProcessContext};
use crate::rtp::SharedSession;

static DESC: FilterDesc = FilterDesc {
    id: FilterId::RtpRecv,
    name: "RtpRecv",
    category: FilterCategory::Source,
    ninputs: 0,
    noutputs: 1,
};

/// Packets released per tick at most
const MAX_PACKETS_PER_TICK: usize = 32;

pub struct RtpRecvFilter {
    session: SharedSession,
}

impl RtpRecvFilter {
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }
}

impl Filter for RtpRecvFilter {
    fn desc(&self) -> &'static FilterDesc {
        &DESC
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        let mut session = self.session.lock();
        for _ in 0..MAX_PACKETS_PER_TICK {
            let Some(packet) = session.receive() else {
                break;
            };
            let header = &packet.header;
            let unit = MediaUnit::encoded(
                packet.payload.clone(),
                header.payload_type,
                header.timestamp,
                header.marker,
            );
            ctx.push(0, unit);
        }
        session.rtcp_tick()?;
        Ok(())
    }
}
