//! Worker pool coordinator.
//!
//! Every worker slot gets a supervisor task that runs the worker in its own
//! tokio task, observes fault exits (errors and panics) and relaunches the
//! worker after a jittered backoff. The coordinator keeps one quit/finished
//! channel pair per slot and bounds shutdown by a single deadline.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::future::join_all;
use log::{error, info, warn};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use rand::Rng;
use tokio::{
    sync::{oneshot, watch},
    task::JoinError,
};

use crate::{
    batch::BatchExecutor,
    core::{BatchQueue, ResultStore},
    metrics,
};

use super::{Worker, WorkerSettings, WorkerState};

#[derive(Clone, Debug)]
pub struct WorkerPoolConfig {
    pub count: usize,
    pub restart_backoff: Duration,
    /// Per slot. `None` restarts forever.
    pub max_restarts: Option<u32>,
    pub shutdown_timeout: Duration,
    pub worker: WorkerSettings,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            count: 1,
            restart_backoff: Duration::from_millis(1000),
            max_restarts: None,
            shutdown_timeout: Duration::from_secs(3),
            worker: WorkerSettings::default(),
        }
    }
}

pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<dyn BatchQueue>,
    store: Arc<dyn ResultStore>,
    executor: BatchExecutor,
}

struct SlotHandle {
    id: usize,
    quit: watch::Sender<bool>,
    finished: oneshot::Receiver<()>,
}

/// Control side of a started pool.
pub struct PoolHandle {
    slots: Vec<SlotHandle>,
    shutdown_timeout: Duration,
}

/// Result of a bounded shutdown.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub finished: usize,
    /// Worker ids still running at the deadline.
    pub abandoned: Vec<usize>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<dyn BatchQueue>,
        store: Arc<dyn ResultStore>,
        executor: BatchExecutor,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            executor,
        }
    }

    pub fn size(&self) -> usize {
        self.config.count
    }

    /// Launch a supervisor per slot. Must be called inside a tokio runtime.
    pub fn start(&self) -> PoolHandle {
        info!("Starting {} async batch worker(s)", self.config.count);
        let slots = (0..self.config.count)
            .map(|id| {
                let worker = Arc::new(Worker::new(
                    id,
                    self.queue.clone(),
                    self.store.clone(),
                    self.executor.clone(),
                    self.config.worker.clone(),
                ));
                let (quit_tx, quit_rx) = watch::channel(false);
                let (finished_tx, finished_rx) = oneshot::channel();
                let supervisor = Supervisor {
                    worker,
                    backoff: self.config.restart_backoff,
                    max_restarts: self.config.max_restarts,
                };
                tokio::spawn(supervisor.run(quit_rx, finished_tx));
                SlotHandle {
                    id,
                    quit: quit_tx,
                    finished: finished_rx,
                }
            })
            .collect();

        PoolHandle {
            slots,
            shutdown_timeout: self.config.shutdown_timeout,
        }
    }
}

impl PoolHandle {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Send quit to every worker and wait for their finished signals until
    /// the shutdown timeout. Workers still busy at the deadline are left
    /// behind.
    pub async fn shutdown(self) -> ShutdownReport {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;
        info!("Stopping {} worker(s)", self.slots.len());

        let waits = self.slots.into_iter().map(|slot| {
            // a supervisor that already exited has dropped its receiver
            let _ = slot.quit.send(true);
            async move {
                let done = tokio::time::timeout_at(deadline, slot.finished).await;
                // keep the sender alive until the wait is over
                drop(slot.quit);
                (slot.id, done.is_ok())
            }
        });

        let mut report = ShutdownReport::default();
        for (id, finished) in join_all(waits).await {
            if finished {
                report.finished += 1;
            } else {
                report.abandoned.push(id);
            }
        }

        if report.is_clean() {
            info!("All workers stopped in {:?}", started.elapsed());
        } else {
            warn!(
                "Shutdown timeout reached after {:?}, abandoning worker(s) {:?}",
                started.elapsed(),
                report.abandoned
            );
        }
        report
    }
}

struct Supervisor {
    worker: Arc<Worker>,
    backoff: Duration,
    max_restarts: Option<u32>,
}

impl Supervisor {
    async fn run(self, mut quit: watch::Receiver<bool>, finished: oneshot::Sender<()>) {
        let id = self.worker.id();
        let mut restarts: u32 = 0;

        loop {
            let worker = self.worker.clone();
            let worker_quit = quit.clone();
            let exit = tokio::spawn(async move { worker.run(worker_quit).await }).await;

            let fault = match exit {
                Ok(Ok(())) => break,
                Ok(Err(e)) => e.to_string(),
                Err(e) => describe_join_error(e),
            };
            error!("Worker {id} {}: {fault}", WorkerState::Crashed);

            if *quit.borrow() {
                break;
            }
            if self.max_restarts.is_some_and(|max| restarts >= max) {
                error!("Worker {id} exceeded {restarts} restart(s), giving up");
                break;
            }
            restarts += 1;
            metrics::worker_restarted();

            let delay = jittered(self.backoff);
            info!("Restarting worker {id} in {delay:?} (restart #{restarts})");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = quit.changed() => break,
            }
        }

        let _ = finished.send(());
    }
}

fn describe_join_error(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

/// Backoff plus up to 25% random jitter so crashed workers don't rejoin
/// the consumer group in lockstep.
fn jittered(backoff: Duration) -> Duration {
    let spread = backoff.as_millis() as u64 / 4;
    if spread == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Runs the pool for the life of the server and drains it on graceful
/// shutdown.
pub struct WorkerPoolService {
    pool: WorkerPool,
}

impl WorkerPoolService {
    pub fn new(pool: WorkerPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BackgroundService for WorkerPoolService {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let handle = self.pool.start();
        // the sender may already be gone if the server is exiting
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        let report = handle.shutdown().await;
        info!(
            "Worker pool stopped: {} finished, {} abandoned",
            report.finished,
            report.abandoned.len()
        );
    }
}
