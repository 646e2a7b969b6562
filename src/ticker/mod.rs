//! Ticker: the scheduling thread driving filter graphs
//!
//! A ticker owns one OS thread running at the requested priority. Every
//! period it runs one tick of each attached graph, in attachment order.
//! Control requests (attach, detach, stop) reach the thread over a channel
//! and are served between ticks, so a graph never sees overlapping ticks and
//! filters are never freed while the thread may still call into them.

pub mod priority;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::DEFAULT_TICKER_PERIOD_MS;
use crate::error::TickerError;
use crate::graph::FilterGraph;

pub use priority::{
    apply_to_current_thread, audio_priority_from, default_priority, platform_default_priority,
    TickerPriority, AUDIO_PRIORITY_ENV,
};

/// Lateness after which the time base is reset instead of catching up
const LATE_RESET_THRESHOLD: Duration = Duration::from_millis(100);

/// Ticker construction parameters
#[derive(Debug, Clone)]
pub struct TickerParams {
    pub name: String,
    pub priority: TickerPriority,
    pub period: Duration,
}

impl TickerParams {
    pub fn new(name: impl Into<String>, priority: TickerPriority) -> Self {
        Self {
            name: name.into(),
            priority,
            period: Duration::from_millis(DEFAULT_TICKER_PERIOD_MS),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }
}

/// Snapshot of ticker statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickerStats {
    /// Ticks executed
    pub ticks: u64,
    /// Ticks that started more than one period late
    pub late_ticks: u64,
    /// Times the time base was reset after a long stall
    pub resets: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    late_ticks: AtomicU64,
    resets: AtomicU64,
}

enum TickerCommand {
    Attach(Arc<FilterGraph>, Sender<()>),
    Detach(Arc<FilterGraph>, Sender<bool>),
    Stop,
}

/// Dedicated scheduling thread
pub struct Ticker {
    name: String,
    priority: TickerPriority,
    period: Duration,
    commands: Sender<TickerCommand>,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl Ticker {
    /// Spawn the ticker thread
    pub fn new(params: TickerParams) -> Result<Self, TickerError> {
        let (tx, rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let worker = TickerWorker {
            name: params.name.clone(),
            period: params.period.max(Duration::from_millis(1)),
            commands: rx,
            graphs: Vec::new(),
            counters: counters.clone(),
        };
        let priority = params.priority;
        let running_for_thread = running.clone();

        let handle = thread::Builder::new()
            .name(params.name.clone())
            .spawn(move || {
                if let Err(e) = apply_to_current_thread(priority) {
                    tracing::warn!("Could not set {} priority on {}: {}", priority, worker.name, e);
                }
                worker.run();
                running_for_thread.store(false, Ordering::SeqCst);
            })
            .map_err(|e| TickerError::SpawnFailed(e.to_string()))?;

        tracing::info!(
            "Ticker {} started (priority {}, period {:?})",
            params.name,
            params.priority,
            params.period
        );

        Ok(Self {
            name: params.name,
            priority: params.priority,
            period: params.period,
            commands: tx,
            handle: Some(handle),
            running,
            counters,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> TickerPriority {
        self.priority
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the scheduling thread is alive
    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// Get statistics
    pub fn stats(&self) -> TickerStats {
        TickerStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            late_ticks: self.counters.late_ticks.load(Ordering::Relaxed),
            resets: self.counters.resets.load(Ordering::Relaxed),
        }
    }

    /// Start driving a graph.
    ///
    /// Returns once the graph's filters have been preprocessed on the ticker
    /// thread. A graph is driven by at most one ticker
    pub fn attach(&self, graph: Arc<FilterGraph>) -> Result<(), TickerError> {
        if !self.is_running() {
            return Err(TickerError::Stopped);
        }
        if !graph.try_attach() {
            return Err(TickerError::AlreadyAttached);
        }

        let (reply_tx, reply_rx) = bounded(1);
        if self
            .commands
            .send(TickerCommand::Attach(graph.clone(), reply_tx))
            .is_err()
        {
            graph.set_detached();
            return Err(TickerError::Stopped);
        }
        reply_rx.recv().map_err(|_| {
            graph.set_detached();
            TickerError::Stopped
        })?;

        tracing::debug!("Graph {} attached to {}", graph.name(), self.name);
        Ok(())
    }

    /// Stop driving a graph. Returns once its filters have been postprocessed
    pub fn detach(&self, graph: &Arc<FilterGraph>) -> Result<(), TickerError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(TickerCommand::Detach(graph.clone(), reply_tx))
            .map_err(|_| TickerError::Stopped)?;
        match reply_rx.recv() {
            Ok(true) => Ok(()),
            Ok(false) => Err(TickerError::NotAttached),
            Err(_) => Err(TickerError::Stopped),
        }
    }

    /// Stop the thread and wait for it to exit. Safe to call repeatedly
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.commands.send(TickerCommand::Stop);
            if handle.join().is_err() {
                tracing::error!("Ticker {} thread panicked", self.name);
            }
            tracing::info!("Ticker {} stopped", self.name);
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TickerWorker {
    name: String,
    period: Duration,
    commands: Receiver<TickerCommand>,
    graphs: Vec<Arc<FilterGraph>>,
    counters: Arc<Counters>,
}

impl TickerWorker {
    fn run(mut self) {
        let mut base = Instant::now();
        let mut base_tick: u64 = 0;
        let mut tick: u64 = 0;

        loop {
            let deadline = base + scaled(self.period, tick - base_tick);
            match self.commands.recv_deadline(deadline) {
                Ok(TickerCommand::Attach(graph, reply)) => {
                    graph.preprocess(scaled(self.period, tick));
                    self.graphs.push(graph);
                    let _ = reply.send(());
                }
                Ok(TickerCommand::Detach(graph, reply)) => {
                    let found = self.remove(&graph);
                    let _ = reply.send(found);
                }
                Ok(TickerCommand::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let late = Instant::now().saturating_duration_since(deadline);
                    if late > LATE_RESET_THRESHOLD {
                        tracing::warn!(
                            "Ticker {} is late by {} ms, resetting time base",
                            self.name,
                            late.as_millis()
                        );
                        self.counters.late_ticks.fetch_add(1, Ordering::Relaxed);
                        self.counters.resets.fetch_add(1, Ordering::Relaxed);
                        base = Instant::now();
                        base_tick = tick;
                    } else if late > self.period {
                        self.counters.late_ticks.fetch_add(1, Ordering::Relaxed);
                    }

                    let time = scaled(self.period, tick);
                    for graph in &self.graphs {
                        graph.process(tick, time);
                    }
                    tick += 1;
                    self.counters.ticks.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for graph in self.graphs.drain(..) {
            graph.postprocess();
            graph.set_detached();
        }
    }

    fn remove(&mut self, graph: &Arc<FilterGraph>) -> bool {
        match self.graphs.iter().position(|g| Arc::ptr_eq(g, graph)) {
            Some(i) => {
                let graph = self.graphs.remove(i);
                graph.postprocess();
                graph.set_detached();
                true
            }
            None => false,
        }
    }
}

fn scaled(period: Duration, n: u64) -> Duration {
    Duration::from_nanos((period.as_nanos() as u64).saturating_mul(n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::node::tests::pass_filter;

    fn params(name: &str) -> TickerParams {
        TickerParams::new(name, TickerPriority::Normal).with_period(Duration::from_millis(2))
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_start_stop_joins_thread() {
        let mut ticker = Ticker::new(params("test ticker")).unwrap();
        assert!(ticker.is_running());
        ticker.stop();
        assert!(!ticker.is_running());
        // Second stop is a no-op
        ticker.stop();
    }

    #[test]
    fn test_ticks_attached_graph() {
        let (a, _) = pass_filter();
        let mut graph = FilterGraph::new("ticked");
        graph.add(&a).unwrap();
        let graph = Arc::new(graph);

        let mut ticker = Ticker::new(params("tick ticker")).unwrap();
        ticker.attach(graph.clone()).unwrap();
        assert!(graph.is_attached());
        assert!(wait_for(|| a.ticks() >= 3));

        ticker.stop();
        assert!(!graph.is_attached());
        // The thread released its reference
        assert_eq!(Arc::strong_count(&graph), 1);
        let ticks = a.ticks();
        thread::sleep(Duration::from_millis(10));
        assert_eq!(a.ticks(), ticks);
    }

    #[test]
    fn test_graph_on_one_ticker_only() {
        let graph = Arc::new(FilterGraph::new("shared"));
        let t1 = Ticker::new(params("t1")).unwrap();
        let t2 = Ticker::new(params("t2")).unwrap();
        t1.attach(graph.clone()).unwrap();
        assert!(matches!(
            t2.attach(graph.clone()),
            Err(TickerError::AlreadyAttached)
        ));
        t1.detach(&graph).unwrap();
        assert!(matches!(t1.detach(&graph), Err(TickerError::NotAttached)));
        t2.attach(graph).unwrap();
    }

    #[test]
    fn test_attach_after_stop() {
        let mut ticker = Ticker::new(params("stopped")).unwrap();
        ticker.stop();
        let graph = Arc::new(FilterGraph::new("late"));
        assert!(matches!(ticker.attach(graph.clone()), Err(TickerError::Stopped)));
        assert!(!graph.is_attached());
    }

    #[test]
    fn test_step_refused_while_attached() {
        let graph = Arc::new(FilterGraph::new("stepped"));
        let ticker = Ticker::new(params("stepper")).unwrap();
        ticker.attach(graph.clone()).unwrap();
        assert!(graph.step(0, Duration::ZERO).is_err());
        drop(ticker);
        assert!(graph.step(0, Duration::ZERO).is_ok());
    }
}
