//! Sends encoded units over the stream's session

use crate::error::{FilterError, TransportError};
use crate::filter::{Filter, FilterCategory, FilterDesc, FilterId, MediaFormat, ProcessContext};
use crate::rtp::SharedSession;

static DESC: FilterDesc = FilterDesc {
    id: FilterId::RtpSend,
    name: "RtpSend",
    category: FilterCategory::Sink,
    ninputs: 1,
    noutputs: 0,
};

pub struct RtpSendFilter {
    session: SharedSession,
    sent: u64,
    warned_no_remote: bool,
}

impl RtpSendFilter {
    pub fn new(session: SharedSession) -> Self {
        Self {
            session,
            sent: 0,
            warned_no_remote: false,
        }
    }

    /// Packets handed to the session
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl Filter for RtpSendFilter {
    fn desc(&self) -> &'static FilterDesc {
        &DESC
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        let mut session = self.session.lock();
        while let Some(unit) = ctx.pop(0) {
            if !matches!(unit.format, MediaFormat::Encoded { .. }) {
                continue;
            }
            match session.send_with_ts(&unit.data, unit.timestamp, unit.marker) {
                Ok(_) => self.sent += 1,
                Err(TransportError::NoRemoteAddress) => {
                    if !self.warned_no_remote {
                        tracing::debug!("No remote address yet, dropping outgoing packets");
                        self.warned_no_remote = true;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
