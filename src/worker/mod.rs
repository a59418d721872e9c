//! Queue workers for async batches.
//!
//! A worker joins the consumer group, then loops waiting on quit, the next
//! message, or an idle tick. Each message fills exactly one slot of its
//! correlation record and is committed only after the slot write.

pub mod pool;

use std::{fmt, sync::Arc, time::Duration};

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::{
    batch::{BatchExecutor, QueuedItem, ResponseItem},
    core::{status, BatchError, BatchQueue, BatchResult, QueueConsumer, QueueMessage, ResultStore},
    metrics,
};

pub use pool::{PoolHandle, ShutdownReport, WorkerPool, WorkerPoolConfig};

/// Lifecycle of one worker slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Processing,
    Crashed,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Processing => "processing",
            WorkerState::Crashed => "crashed",
            WorkerState::ShuttingDown => "shutting down",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What happened to a single queue message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Executed and the response written to its slot.
    Stored,
    /// Slot already filled by an earlier delivery.
    Duplicate,
    /// Correlation record is gone; the work is dropped.
    Expired,
    /// Payload could not be decoded.
    Poison,
    /// Executed but the slot write failed.
    WriteFailed,
}

impl MessageOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOutcome::Stored => "stored",
            MessageOutcome::Duplicate => "duplicate",
            MessageOutcome::Expired => "expired",
            MessageOutcome::Poison => "poison",
            MessageOutcome::WriteFailed => "write_failed",
        }
    }
}

/// Settings shared by every worker in a pool.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub idle_timeout: Duration,
    pub missing_record_retries: u32,
    pub missing_record_delay: Duration,
    pub consumer_group: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(500),
            missing_record_retries: 3,
            missing_record_delay: Duration::from_millis(50),
            consumer_group: "batch_async".to_string(),
        }
    }
}

/// One queue consumer plus the components it needs to execute items.
pub struct Worker {
    id: usize,
    queue: Arc<dyn BatchQueue>,
    store: Arc<dyn ResultStore>,
    executor: BatchExecutor,
    settings: WorkerSettings,
}

/// Decrements the running-worker gauge however the worker exits.
struct RunningGuard;

impl RunningGuard {
    fn enter() -> Self {
        status::worker_started();
        RunningGuard
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        status::worker_stopped();
    }
}

impl Worker {
    pub fn new(
        id: usize,
        queue: Arc<dyn BatchQueue>,
        store: Arc<dyn ResultStore>,
        executor: BatchExecutor,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            executor,
            settings,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    fn transition(&self, state: WorkerState) {
        match state {
            WorkerState::Processing => debug!("Worker {} {state}", self.id),
            WorkerState::Crashed => error!("Worker {} {state}", self.id),
            _ => info!("Worker {} {state}", self.id),
        }
    }

    /// Consume until `quit` flips to true or its sender is dropped.
    ///
    /// An `Err` return is a worker fault. The consumer is dropped with the
    /// error, so any message it held is redelivered.
    pub async fn run(&self, mut quit: watch::Receiver<bool>) -> BatchResult<()> {
        self.transition(WorkerState::Starting);
        let mut consumer = self
            .queue
            .consumer(&self.settings.consumer_group)
            .await
            .map_err(|e| BatchError::WorkerFault(format!("worker {} consumer: {e}", self.id)))?;
        info!(
            "Worker {} joined consumer group {}",
            self.id, self.settings.consumer_group
        );

        let _running = RunningGuard::enter();
        self.transition(WorkerState::Running);

        loop {
            if *quit.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        break;
                    }
                }
                received = consumer.recv() => {
                    match received? {
                        Some(message) => self.consume(consumer.as_mut(), &message).await?,
                        None => {
                            info!("Worker {} queue closed", self.id);
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep(self.settings.idle_timeout) => {}
            }
        }

        self.transition(WorkerState::ShuttingDown);
        if let Err(e) = consumer.close().await {
            warn!("Worker {} failed to close consumer: {e}", self.id);
        }
        self.transition(WorkerState::Stopped);
        Ok(())
    }

    async fn consume(
        &self,
        consumer: &mut dyn QueueConsumer,
        message: &QueueMessage,
    ) -> BatchResult<()> {
        self.transition(WorkerState::Processing);
        let outcome = self.process(message).await?;
        consumer.commit(message).await?;
        metrics::worker_message(outcome.as_str());
        debug!(
            "Worker {} committed [partition: {}] [offset: {}] ({})",
            self.id,
            message.partition,
            message.offset,
            outcome.as_str()
        );
        Ok(())
    }

    /// Handle one message up to, but not including, the commit.
    ///
    /// Errors here are infrastructure faults on the record read path; the
    /// caller must not commit.
    pub async fn process(&self, message: &QueueMessage) -> BatchResult<MessageOutcome> {
        let queued = match QueuedItem::decode(&message.payload) {
            Ok(queued) => queued,
            Err(e) => {
                error!(
                    "Worker {} dropping undecodable message [offset: {}]: {e}",
                    self.id, message.offset
                );
                return Ok(MessageOutcome::Poison);
            }
        };
        let id = queued.correlation_id.as_str();
        let Ok(index) = usize::try_from(queued.index) else {
            error!("Worker {} negative index [request id: {id}] [index: {}]", self.id, queued.index);
            return Ok(MessageOutcome::Poison);
        };

        match self.current_slot(id, index).await? {
            None => {
                info!("Async batch request gone, skipping [request id: {id}] [index: {index}]");
                return Ok(MessageOutcome::Expired);
            }
            Some(slot) if !slot.is_empty() => {
                info!("Item already processed [request id: {id}] [index: {index}]");
                return Ok(MessageOutcome::Duplicate);
            }
            Some(_) => {}
        }

        let response = self.executor.run_item(&queued.item, &queued.identity).await;
        metrics::item_completed(metrics::MODE_ASYNC, response.status_code);
        let encoded = match serde_json::to_string(&response) {
            Ok(encoded) => encoded,
            Err(e) => serde_json::to_string(&ResponseItem::from_error(&BatchError::Serialization(e)))?,
        };

        match self.store.set_slot(id, index, encoded).await {
            Ok(()) => {
                info!(
                    "Item processed [request id: {id}] [index: {index}] [status: {}]",
                    response.status_code
                );
                Ok(MessageOutcome::Stored)
            }
            Err(e) => {
                error!("Failed to store item result [request id: {id}] [index: {index}]: {e}");
                Ok(MessageOutcome::WriteFailed)
            }
        }
    }

    /// Read the slot, retrying briefly when the record is missing: a worker
    /// can see the message before the submitter has created the record.
    async fn current_slot(&self, id: &str, index: usize) -> BatchResult<Option<String>> {
        let mut attempt = 0;
        loop {
            if let Some(slot) = self.store.slot(id, index).await? {
                return Ok(Some(slot));
            }
            if attempt >= self.settings.missing_record_retries {
                return Ok(None);
            }
            attempt += 1;
            tokio::time::sleep(self.settings.missing_record_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::{
        backend::{testing::MockHttpClient, MemoryQueue, MemoryResultStore},
        batch::{RequestItem, TargetMap, TargetResolver},
        core::QueueProducer,
    };

    fn settings() -> WorkerSettings {
        WorkerSettings {
            idle_timeout: Duration::from_millis(20),
            missing_record_retries: 1,
            missing_record_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn worker(
        queue: &MemoryQueue,
        store: &Arc<MemoryResultStore>,
        client: Arc<MockHttpClient>,
    ) -> Worker {
        let targets = TargetMap::new(HashMap::from([(
            "svc".to_string(),
            "http://svc.internal".to_string(),
        )]));
        let resolver = Arc::new(TargetResolver::new(targets, "X-Identity-ID").unwrap());
        Worker::new(
            1,
            Arc::new(queue.clone()),
            store.clone(),
            BatchExecutor::new(resolver, client),
            settings(),
        )
    }

    fn message(id: &str, index: i64, target: &str) -> QueueMessage {
        let queued = QueuedItem {
            correlation_id: id.to_string(),
            index,
            item: RequestItem::new("POST", target).with_body(json!({"n": index})),
            identity: "user-9".to_string(),
        };
        QueueMessage {
            key: queued.item.partition_key("user-9"),
            payload: queued.encode().unwrap(),
            partition: 0,
            offset: index,
        }
    }

    async fn record(store: &MemoryResultStore, id: &str, n: usize) {
        store.push_placeholders(id, n).await.unwrap();
        store.expire(id, Duration::from_secs(60)).await.unwrap();
    }

    #[tokio::test]
    async fn test_process_fills_slot() {
        let queue = MemoryQueue::new("t", "batch_async");
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(MockHttpClient::new());
        record(&store, "r1", 2).await;

        let w = worker(&queue, &store, client.clone());
        let outcome = w.process(&message("r1", 1, "svc://things")).await.unwrap();
        assert_eq!(outcome, MessageOutcome::Stored);

        let slots = store.slots("r1").await.unwrap();
        assert!(slots[0].is_empty());
        let stored: ResponseItem = serde_json::from_str(&slots[1]).unwrap();
        assert_eq!(stored.status_code, 200);
        assert_eq!(stored.body["url"], "http://svc.internal/things");
        assert_eq!(stored.body["identity"], "user-9");
        assert_eq!(stored.body["body"], json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_redelivery_does_not_reexecute() {
        let queue = MemoryQueue::new("t", "batch_async");
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(MockHttpClient::new());
        record(&store, "r1", 1).await;

        let w = worker(&queue, &store, client.clone());
        let msg = message("r1", 0, "svc://once");
        assert_eq!(w.process(&msg).await.unwrap(), MessageOutcome::Stored);
        let first = store.slots("r1").await.unwrap();

        assert_eq!(w.process(&msg).await.unwrap(), MessageOutcome::Duplicate);
        assert_eq!(client.call_count(), 1);
        assert_eq!(store.slots("r1").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_failed_item_stored_as_error() {
        let queue = MemoryQueue::new("t", "batch_async");
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(MockHttpClient::new());
        record(&store, "r1", 1).await;

        let w = worker(&queue, &store, client);
        let outcome = w.process(&message("r1", 0, "nope://x")).await.unwrap();
        assert_eq!(outcome, MessageOutcome::Stored);

        let stored: ResponseItem =
            serde_json::from_str(&store.slots("r1").await.unwrap()[0]).unwrap();
        assert_eq!(stored.status_code, 500);
        assert_eq!(stored.body["error"], "unrecognized_service");
    }

    #[tokio::test]
    async fn test_missing_record_and_poison_are_skipped() {
        let queue = MemoryQueue::new("t", "batch_async");
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(MockHttpClient::new());
        let w = worker(&queue, &store, client.clone());

        assert_eq!(
            w.process(&message("gone", 0, "svc://x")).await.unwrap(),
            MessageOutcome::Expired
        );
        let poison = QueueMessage {
            key: "k".into(),
            payload: b"not json".to_vec(),
            partition: 0,
            offset: 7,
        };
        assert_eq!(w.process(&poison).await.unwrap(), MessageOutcome::Poison);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_run_joins_configured_group() {
        let queue = MemoryQueue::new("t", "reporting");
        let store = Arc::new(MemoryResultStore::new());
        let w = worker(&queue, &store, Arc::new(MockHttpClient::new()));
        let (_quit_tx, quit_rx) = watch::channel(false);

        let err = w.run(quit_rx).await.unwrap_err();
        assert!(matches!(err, BatchError::WorkerFault(_)));
    }

    #[tokio::test]
    async fn test_run_consumes_and_stops_on_quit() {
        let queue = MemoryQueue::new("t", "batch_async");
        let store = Arc::new(MemoryResultStore::new());
        let client = Arc::new(MockHttpClient::new());
        record(&store, "r1", 2).await;

        let mut producer = queue.producer().await.unwrap();
        for idx in 0..2 {
            let msg = message("r1", idx, "svc://a");
            producer.publish(&msg.key, msg.payload).await.unwrap();
        }

        let w = Arc::new(worker(&queue, &store, client));
        let (quit_tx, quit_rx) = watch::channel(false);
        let running = {
            let w = w.clone();
            tokio::spawn(async move { w.run(quit_rx).await })
        };

        for _ in 0..100 {
            if store.slots("r1").await.unwrap().iter().all(|s| !s.is_empty()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.slots("r1").await.unwrap().iter().all(|s| !s.is_empty()));

        quit_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("worker should stop on quit")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(queue.pending_len(), 0);
    }
}
