//! Filter graphs
//!
//! A graph records which output port feeds which input port and keeps a
//! processing order where every filter runs after all of its upstream
//! filters. Ties are broken by the order filters were added. The order is
//! recomputed on every link change, so a graph is always runnable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{FilterError, TickerError};
use crate::filter::FilterHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    src: usize,
    out_port: usize,
    dst: usize,
    in_port: usize,
}

/// A set of filters wired by media queues
pub struct FilterGraph {
    name: String,
    nodes: Vec<FilterHandle>,
    links: Vec<Link>,
    order: Vec<usize>,
    attached: AtomicBool,
}

impl FilterGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            links: Vec::new(),
            order: Vec::new(),
            attached: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a standalone filter (linking adds filters implicitly)
    pub fn add(&mut self, filter: &FilterHandle) -> Result<(), FilterError> {
        self.index_or_insert(filter)?;
        self.recompute_order()
    }

    /// Connect `src`'s output port to `dst`'s input port
    pub fn link(
        &mut self,
        src: &FilterHandle,
        out_port: usize,
        dst: &FilterHandle,
        in_port: usize,
    ) -> Result<(), FilterError> {
        let queue = dst
            .input(in_port)
            .cloned()
            .ok_or(FilterError::InvalidPort {
                filter: dst.name(),
                port: in_port,
            })?;
        if self
            .links
            .iter()
            .any(|l| l.dst_is(self, dst, in_port))
        {
            return Err(FilterError::AlreadyLinked {
                filter: dst.name(),
                port: in_port,
            });
        }

        let src_new = self.index_of(src).is_none();
        let s = self.index_or_insert(src)?;
        let dst_new = self.index_of(dst).is_none();
        let d = match self.index_or_insert(dst) {
            Ok(i) => i,
            Err(e) => {
                if src_new {
                    self.forget_last(src);
                }
                return Err(e);
            }
        };
        let rollback = |graph: &mut Self| {
            if dst_new {
                graph.forget_last(dst);
            }
            if src_new {
                graph.forget_last(src);
            }
        };

        if let Err(e) = src.set_output(out_port, Some(queue)) {
            rollback(self);
            return Err(e);
        }

        let link = Link {
            src: s,
            out_port,
            dst: d,
            in_port,
        };
        self.links.push(link);

        if let Err(e) = self.recompute_order() {
            self.links.pop();
            let _ = src.set_output(out_port, None);
            rollback(self);
            let _ = self.recompute_order();
            return Err(e);
        }

        tracing::debug!(
            "Linked {}:{} -> {}:{} in graph {}",
            src.name(),
            out_port,
            dst.name(),
            in_port,
            self.name
        );
        Ok(())
    }

    /// Remove a connection made by [`FilterGraph::link`]
    pub fn unlink(
        &mut self,
        src: &FilterHandle,
        out_port: usize,
        dst: &FilterHandle,
        in_port: usize,
    ) -> Result<(), FilterError> {
        let s = self.index_of(src).ok_or(FilterError::UnknownFilter(src.name()))?;
        let d = self.index_of(dst).ok_or(FilterError::UnknownFilter(dst.name()))?;
        let before = self.links.len();
        self.links.retain(|l| {
            !(l.src == s && l.out_port == out_port && l.dst == d && l.in_port == in_port)
        });
        if self.links.len() == before {
            return Err(FilterError::InvalidPort {
                filter: src.name(),
                port: out_port,
            });
        }
        src.set_output(out_port, None)?;
        self.recompute_order()
    }

    /// Filters in processing order
    pub fn filters(&self) -> impl Iterator<Item = &FilterHandle> {
        self.order.iter().filter_map(move |&i| self.nodes.get(i))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, filter: &FilterHandle) -> bool {
        self.index_of(filter).is_some()
    }

    /// Whether a ticker currently drives this graph
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Run a single tick on the caller's thread.
    ///
    /// Only valid while no ticker drives the graph; used by tests and
    /// benchmarks.
    pub fn step(&self, tick: u64, time: Duration) -> Result<(), TickerError> {
        if self.is_attached() {
            return Err(TickerError::AlreadyAttached);
        }
        self.process(tick, time);
        Ok(())
    }

    pub(crate) fn try_attach(&self) -> bool {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn set_detached(&self) {
        self.attached.store(false, Ordering::Release);
    }

    pub(crate) fn preprocess(&self, time: Duration) {
        for filter in self.filters() {
            filter.run_preprocess(time);
        }
    }

    pub(crate) fn process(&self, tick: u64, time: Duration) {
        for filter in self.filters() {
            filter.run_tick(tick, time);
        }
    }

    pub(crate) fn postprocess(&self) {
        for filter in self.filters() {
            filter.run_postprocess();
        }
    }

    fn index_of(&self, filter: &FilterHandle) -> Option<usize> {
        self.nodes.iter().position(|n| n.same(filter))
    }

    fn index_or_insert(&mut self, filter: &FilterHandle) -> Result<usize, FilterError> {
        if let Some(i) = self.index_of(filter) {
            return Ok(i);
        }
        if filter.mark_in_graph(true) {
            // Belongs to another graph
            return Err(FilterError::InvalidArgument(format!(
                "{} is already part of a graph",
                filter.name()
            )));
        }
        self.nodes.push(filter.clone());
        Ok(self.nodes.len() - 1)
    }

    /// Undo an insertion made by `index_or_insert` during a failed link
    fn forget_last(&mut self, filter: &FilterHandle) {
        if self.nodes.last().is_some_and(|n| n.same(filter)) {
            self.nodes.pop();
            filter.mark_in_graph(false);
        }
    }

    /// Kahn's algorithm, smallest insertion index first
    fn recompute_order(&mut self) -> Result<(), FilterError> {
        let n = self.nodes.len();
        let mut indegree = vec![0usize; n];
        for link in &self.links {
            indegree[link.dst] += 1;
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(i) = ready.pop_front() {
            order.push(i);
            let mut next: Vec<usize> = Vec::new();
            for link in self.links.iter().filter(|l| l.src == i) {
                indegree[link.dst] -= 1;
                if indegree[link.dst] == 0 {
                    next.push(link.dst);
                }
            }
            next.sort_unstable();
            next.dedup();
            for j in next {
                let pos = ready.iter().position(|&r| r > j).unwrap_or(ready.len());
                ready.insert(pos, j);
            }
        }

        if order.len() != n {
            return Err(FilterError::CycleDetected);
        }
        self.order = order;
        Ok(())
    }
}

impl Link {
    fn dst_is(&self, graph: &FilterGraph, dst: &FilterHandle, in_port: usize) -> bool {
        self.in_port == in_port
            && graph
                .nodes
                .get(self.dst)
                .map(|n| n.same(dst))
                .unwrap_or(false)
    }
}

impl Drop for FilterGraph {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.mark_in_graph(false);
        }
    }
}
