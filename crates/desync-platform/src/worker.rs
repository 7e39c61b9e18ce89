//! Queue workers
//!
//! One OS thread per queue number. Each worker owns its [`Processor`] and
//! therefore its flow and QUIC tables; the only state shared between
//! workers is the configuration handle and the DNS redirect tracker.

use crate::dispatch::PlanDispatcher;
use crate::error::{PlatformError, Result};
use crate::traits::{PacketQueue, PacketSink, QueueVerdict, QueuedPacket};
use desync_core::conntrack::DnsConnTracker;
use desync_core::{ConfigHandle, Decision, Processor, Stats};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after an empty read before polling the queue again
pub const IDLE_POLL: Duration = Duration::from_millis(2);

/// Processing loop for one queue
pub struct Worker<Q: PacketQueue> {
    queue: Q,
    processor: Processor,
    dispatcher: PlanDispatcher,
    /// Set on the one worker responsible for expiring DNS redirects
    dns_sweeper: Option<Arc<DnsConnTracker>>,
    sweep_interval: Duration,
    last_sweep: Instant,
}

impl<Q: PacketQueue> Worker<Q> {
    /// Create a worker for `queue`
    pub fn new(
        queue: Q,
        processor: Processor,
        dispatcher: PlanDispatcher,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            dispatcher,
            dns_sweeper: None,
            sweep_interval,
            last_sweep: Instant::now(),
        }
    }

    /// Also sweep the shared DNS tracker
    pub fn with_dns_sweep(mut self, dns: Arc<DnsConnTracker>) -> Self {
        self.dns_sweeper = Some(dns);
        self
    }

    /// Processing statistics so far
    pub fn stats(&self) -> &Stats {
        self.processor.stats()
    }

    /// Receive and handle at most one packet, then sweep if due.
    /// Returns whether a packet was handled.
    pub fn step(&mut self) -> Result<bool> {
        let handled = match self.queue.recv()? {
            Some(packet) => {
                self.handle(packet);
                true
            }
            None => false,
        };
        self.maybe_sweep(Instant::now());
        Ok(handled)
    }

    fn handle(&mut self, packet: Q::Packet) {
        let decision = self.processor.process(packet.payload(), packet.direction());
        let result = match decision {
            Decision::Accept => self.queue.verdict(packet, QueueVerdict::Accept),
            Decision::Rewrite(rewritten) => self
                .queue
                .verdict(packet, QueueVerdict::Replace(rewritten.as_bytes().to_vec())),
            Decision::Replace(plan) => {
                // The verdict must reach the kernel before any replacement
                self.queue.verdict(packet, QueueVerdict::Drop).map(|()| {
                    debug!(queue = self.queue.number(), steps = plan.len(), "dispatching plan");
                    self.dispatcher.dispatch(plan);
                })
            }
        };
        if let Err(e) = result {
            warn!(queue = self.queue.number(), error = %e, "verdict failed");
        }
    }

    fn maybe_sweep(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < self.sweep_interval {
            return;
        }
        self.last_sweep = now;
        let mut swept = self.processor.sweep_at(now);
        if let Some(dns) = &self.dns_sweeper {
            swept += dns.sweep_at(now);
        }
        debug!(
            queue = self.queue.number(),
            swept,
            pending = self.processor.pending_flows(),
            stats = %self.processor.stats(),
            "sweep"
        );
    }

    /// Run until `shutdown` is cancelled. Returns final statistics.
    pub fn run(mut self, shutdown: &CancellationToken) -> Result<Stats> {
        let number = self.queue.number();
        info!(queue = number, "worker started");
        while !shutdown.is_cancelled() {
            match self.step() {
                Ok(true) => {}
                Ok(false) => thread::sleep(IDLE_POLL),
                Err(e) => {
                    error!(queue = number, error = %e, "worker stopped");
                    return Err(e);
                }
            }
        }
        info!(queue = number, stats = %self.stats(), "worker stopped");
        Ok(*self.stats())
    }
}

/// Per-queue worker threads sharing one configuration handle
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<(u16, JoinHandle<Result<Stats>>)>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Bind every configured NFQUEUE and start one worker per queue
    ///
    /// # Errors
    /// Returns the first queue that fails to open; no worker keeps running
    /// in that case.
    #[cfg(target_os = "linux")]
    pub fn start(
        config: Arc<ConfigHandle>,
        sink: Arc<dyn PacketSink>,
        runtime: Handle,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        Self::spawn(config, sink, runtime, shutdown, |number| {
            crate::nfqueue::NfQueue::open(number)
        })
    }

    /// Start one worker per configured queue number, opening each queue
    /// with `open` on the worker's own thread
    pub fn spawn<Q, F>(
        config: Arc<ConfigHandle>,
        sink: Arc<dyn PacketSink>,
        runtime: Handle,
        shutdown: CancellationToken,
        open: F,
    ) -> Result<Self>
    where
        Q: PacketQueue + 'static,
        F: Fn(u16) -> Result<Q> + Send + Sync + 'static,
    {
        let snapshot = config.load();
        let queue_config = snapshot.config.queue.clone();
        let dispatcher = PlanDispatcher::new(runtime, sink, queue_config.mtu);
        let dns = Arc::new(DnsConnTracker::new());
        let open = Arc::new(open);

        let (ready_tx, ready_rx) = mpsc::channel::<(u16, Option<PlatformError>)>();
        let mut workers = Vec::new();
        for (index, number) in queue_config.queue_numbers().enumerate() {
            let config = Arc::clone(&config);
            let dns = Arc::clone(&dns);
            let dispatcher = dispatcher.clone();
            let open = Arc::clone(&open);
            let ready = ready_tx.clone();
            let token = shutdown.clone();
            let sweep_interval = queue_config.sweep_interval();

            let handle = thread::Builder::new()
                .name(format!("desync-q{number}"))
                .spawn(move || {
                    let queue = match open(number) {
                        Ok(queue) => {
                            let _ = ready.send((number, None));
                            queue
                        }
                        Err(e) => {
                            let _ = ready.send((number, Some(e)));
                            return Ok(Stats::default());
                        }
                    };
                    let processor = Processor::new(config, Arc::clone(&dns));
                    let mut worker = Worker::new(queue, processor, dispatcher, sweep_interval);
                    if index == 0 {
                        worker = worker.with_dns_sweep(dns);
                    }
                    worker.run(&token)
                });
            match handle {
                Ok(handle) => workers.push((number, handle)),
                Err(e) => {
                    shutdown.cancel();
                    return Err(PlatformError::fatal(format!("worker thread for queue {number}"), e));
                }
            }
        }
        drop(ready_tx);

        let pool = Self { workers, shutdown };
        for _ in 0..pool.workers.len() {
            match ready_rx.recv() {
                Ok((_, None)) => {}
                Ok((number, Some(e))) => {
                    error!(queue = number, error = %e, "queue failed to open");
                    pool.stop();
                    return Err(e);
                }
                Err(_) => break,
            }
        }
        info!(workers = pool.workers.len(), "worker pool running");
        Ok(pool)
    }

    /// Number of running workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no workers
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Token that stops every worker when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Whether any worker thread has exited
    pub fn any_finished(&self) -> bool {
        self.workers.iter().any(|(_, h)| h.is_finished())
    }

    /// Stop all workers and merge their statistics
    pub fn stop(self) -> Stats {
        self.shutdown.cancel();
        let mut total = Stats::default();
        for (number, handle) in self.workers {
            match handle.join() {
                Ok(Ok(stats)) => total.merge(&stats),
                Ok(Err(e)) => debug!(queue = number, error = %e, "worker exited with error"),
                Err(_) => error!(queue = number, "worker panicked"),
            }
        }
        info!(stats = %total, "worker pool stopped");
        total
    }
}
