//! Sink that discards everything

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::FilterError;
use crate::filter::{Filter, FilterCategory, FilterDesc, FilterId, ProcessContext};

static DESC: FilterDesc = FilterDesc {
    id: FilterId::VoidSink,
    name: "VoidSink",
    category: FilterCategory::Sink,
    ninputs: 1,
    noutputs: 0,
};

/// Counts and drops its input
#[derive(Default)]
pub struct VoidSink {
    received: Arc<AtomicU64>,
}

impl VoidSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter of consumed units
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.received.clone()
    }
}

impl Filter for VoidSink {
    fn desc(&self) -> &'static FilterDesc {
        &DESC
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
        while ctx.pop(0).is_some() {
            self.received.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}
