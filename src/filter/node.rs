//! Locked filter instances

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::QUEUE_CAPACITY;
use crate::error::FilterError;
use crate::filter::queue::{MediaQueue, SharedQueue};
use crate::filter::{Filter, FilterDesc, FilterMethod, MethodReply, ProcessContext};

/// State guarded by the filter lock
struct FilterSlot {
    /// `None` once the filter has been destroyed
    filter: Option<Box<dyn Filter>>,
    outputs: Vec<Option<SharedQueue>>,
}

struct FilterNode {
    desc: &'static FilterDesc,
    slot: Mutex<FilterSlot>,
    inputs: Vec<SharedQueue>,
    halted: AtomicBool,
    in_graph: AtomicBool,
    ticks: AtomicU64,
    errors: AtomicU64,
}

impl Drop for FilterNode {
    fn drop(&mut self) {
        if let Some(mut filter) = self.slot.get_mut().filter.take() {
            filter.uninit();
        }
    }
}

/// Shared handle to a filter instance.
///
/// The ticker thread runs `process` through this handle while control
/// threads call methods on it; both go through the same lock.
#[derive(Clone)]
pub struct FilterHandle {
    node: Arc<FilterNode>,
}

impl FilterHandle {
    /// Wrap a constructed filter
    pub fn new<F: Filter + 'static>(filter: F) -> Self {
        Self::from_boxed(Box::new(filter))
    }

    pub fn from_boxed(filter: Box<dyn Filter>) -> Self {
        let desc = filter.desc();
        let inputs = (0..desc.ninputs)
            .map(|_| Arc::new(MediaQueue::new(QUEUE_CAPACITY)))
            .collect();
        let outputs = vec![None; desc.noutputs];

        Self {
            node: Arc::new(FilterNode {
                desc,
                slot: Mutex::new(FilterSlot {
                    filter: Some(filter),
                    outputs,
                }),
                inputs,
                halted: AtomicBool::new(false),
                in_graph: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
        }
    }

    pub fn desc(&self) -> &'static FilterDesc {
        self.node.desc
    }

    pub fn name(&self) -> &'static str {
        self.node.desc.name
    }

    /// Whether both handles refer to the same instance
    pub fn same(&self, other: &FilterHandle) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    /// Call a control method under the filter lock
    pub fn call(&self, method: FilterMethod) -> Result<MethodReply, FilterError> {
        let mut slot = self.node.slot.lock();
        match slot.filter.as_mut() {
            Some(filter) => filter.call(method),
            None => Err(FilterError::Destroyed(self.name())),
        }
    }

    /// Whether a fatal error stopped this instance
    pub fn is_halted(&self) -> bool {
        self.node.halted.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.node.slot.lock().filter.is_none()
    }

    /// Number of ticks processed
    pub fn ticks(&self) -> u64 {
        self.node.ticks.load(Ordering::Relaxed)
    }

    /// Number of ticks whose `process` returned an error
    pub fn errors(&self) -> u64 {
        self.node.errors.load(Ordering::Relaxed)
    }

    /// Input queue of a port
    pub fn input(&self, port: usize) -> Option<&SharedQueue> {
        self.node.inputs.get(port)
    }

    /// Whether every input queue is empty
    pub fn inputs_empty(&self) -> bool {
        self.node.inputs.iter().all(|q| q.is_empty())
    }

    /// Release the filter. Returns false if it was already destroyed
    pub fn destroy(&self) -> bool {
        let filter = {
            let mut slot = self.node.slot.lock();
            slot.outputs.iter_mut().for_each(|o| *o = None);
            slot.filter.take()
        };
        self.flush_inputs();

        match filter {
            Some(mut filter) => {
                filter.uninit();
                tracing::debug!("Filter {} destroyed", self.name());
                true
            }
            None => false,
        }
    }

    pub(crate) fn set_output(&self, port: usize, queue: Option<SharedQueue>) -> Result<(), FilterError> {
        let mut slot = self.node.slot.lock();
        let out = slot.outputs.get_mut(port).ok_or(FilterError::InvalidPort {
            filter: self.name(),
            port,
        })?;
        if queue.is_some() && out.is_some() {
            return Err(FilterError::AlreadyLinked {
                filter: self.name(),
                port,
            });
        }
        *out = queue;
        Ok(())
    }

    pub(crate) fn mark_in_graph(&self, value: bool) -> bool {
        self.node.in_graph.swap(value, Ordering::AcqRel)
    }

    pub(crate) fn run_preprocess(&self, time: Duration) {
        let mut guard = self.node.slot.lock();
        let FilterSlot { filter, outputs } = &mut *guard;
        if let Some(filter) = filter.as_mut() {
            let mut ctx = ProcessContext::new(&self.node.inputs, outputs, 0, time);
            if let Err(e) = filter.preprocess(&mut ctx) {
                self.record_error(e);
            }
        }
    }

    /// One tick: process under the lock, then flush every input
    pub(crate) fn run_tick(&self, tick: u64, time: Duration) {
        if !self.is_halted() {
            let mut guard = self.node.slot.lock();
            let FilterSlot { filter, outputs } = &mut *guard;
            if let Some(filter) = filter.as_mut() {
                let mut ctx = ProcessContext::new(&self.node.inputs, outputs, tick, time);
                let result = filter.process(&mut ctx);
                self.node.ticks.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = result {
                    self.record_error(e);
                }
            }
        }
        self.flush_inputs();
    }

    pub(crate) fn run_postprocess(&self) {
        if let Some(filter) = self.node.slot.lock().filter.as_mut() {
            filter.postprocess();
        }
        self.flush_inputs();
    }

    fn record_error(&self, error: FilterError) {
        self.node.errors.fetch_add(1, Ordering::Relaxed);
        if error.is_fatal() {
            self.node.halted.store(true, Ordering::Release);
            tracing::error!("Filter {} halted: {}", self.name(), error);
        } else {
            tracing::warn!("Filter {} error: {}", self.name(), error);
        }
    }

    fn flush_inputs(&self) {
        for queue in &self.node.inputs {
            queue.flush();
        }
    }
}

impl fmt::Debug for FilterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterHandle")
            .field("name", &self.name())
            .field("halted", &self.is_halted())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::filter::{FilterCategory, FilterId, MediaUnit};
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    pub(crate) static PASS_DESC: FilterDesc = FilterDesc {
        id: FilterId::External(1),
        name: "TestPass",
        category: FilterCategory::Processing,
        ninputs: 1,
        noutputs: 1,
    };

    /// Forwards the first pending unit and fails on demand
    pub(crate) struct PassFilter {
        pub fail: bool,
        pub uninit_calls: Arc<AtomicUsize>,
    }

    impl Filter for PassFilter {
        fn desc(&self) -> &'static FilterDesc {
            &PASS_DESC
        }

        fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<(), FilterError> {
            // Deliberately consume only the first unit
            if let Some(unit) = ctx.pop(0) {
                ctx.push(0, unit);
            }
            if self.fail {
                return Err(FilterError::InvalidArgument("boom".into()));
            }
            Ok(())
        }

        fn call(&mut self, method: FilterMethod) -> Result<MethodReply, FilterError> {
            match method {
                FilterMethod::Mute(fail) => {
                    self.fail = fail;
                    Ok(MethodReply::Done)
                }
                other => Err(FilterError::MethodNotSupported {
                    filter: PASS_DESC.name,
                    method: other.name(),
                }),
            }
        }

        fn uninit(&mut self) {
            self.uninit_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn pass_filter() -> (FilterHandle, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = FilterHandle::new(PassFilter {
            fail: false,
            uninit_calls: calls.clone(),
        });
        (handle, calls)
    }

    fn unit() -> MediaUnit {
        MediaUnit::encoded(Bytes::from_static(b"x"), 0, 0, false)
    }

    #[test]
    fn test_inputs_flushed_after_tick() {
        let (handle, _) = pass_filter();
        for _ in 0..4 {
            handle.input(0).unwrap().push(unit());
        }
        handle.run_tick(0, Duration::ZERO);
        assert!(handle.inputs_empty());
        assert_eq!(handle.input(0).unwrap().flushed_count(), 3);
    }

    #[test]
    fn test_inputs_flushed_on_error() {
        let (handle, _) = pass_filter();
        handle.call(FilterMethod::Mute(true)).unwrap();
        handle.input(0).unwrap().push(unit());
        handle.input(0).unwrap().push(unit());
        handle.run_tick(0, Duration::ZERO);
        assert!(handle.inputs_empty());
        assert_eq!(handle.errors(), 1);
        assert!(!handle.is_halted());
    }

    #[test]
    fn test_unsupported_method() {
        let (handle, _) = pass_filter();
        let err = handle.call(FilterMethod::GetBitrate).unwrap_err();
        assert!(matches!(err, FilterError::MethodNotSupported { .. }));
    }

    #[test]
    fn test_uninit_exactly_once() {
        let (handle, calls) = pass_filter();
        assert!(handle.destroy());
        assert!(!handle.destroy());
        drop(handle);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_uninit_on_drop() {
        let (handle, calls) = pass_filter();
        let clone = handle.clone();
        drop(handle);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_after_destroy() {
        let (handle, _) = pass_filter();
        handle.destroy();
        assert!(matches!(
            handle.call(FilterMethod::Mute(false)),
            Err(FilterError::Destroyed(_))
        ));
    }
}
