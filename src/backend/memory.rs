//! In-process queue and result store.
//!
//! `MemoryQueue` behaves like a single-partition topic read by one named
//! consumer group: each message goes to one consumer, and messages a consumer
//! received but never committed go back to the head of the queue when that
//! consumer is closed or dropped (including when its worker panics).
//!
//! `MemoryResultStore` keeps correlation records in a `DashMap` and
//! expires them lazily on access.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, info, warn};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use tokio::sync::Notify;

use crate::{
    core::{
        BatchError, BatchQueue, BatchResult, QueueConsumer, QueueMessage, QueueProducer,
        ResultStore,
    },
    queue_error, store_error,
};

#[derive(Default)]
struct QueueShared {
    pending: Mutex<VecDeque<QueueMessage>>,
    notify: Notify,
    next_offset: AtomicI64,
    closed: AtomicBool,
}

impl QueueShared {
    fn pending(&self) -> MutexGuard<'_, VecDeque<QueueMessage>> {
        // a poisoned queue still holds consistent data; keep serving it
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, message: QueueMessage) {
        self.pending().push_back(message);
        self.notify.notify_one();
    }

    fn requeue(&self, mut messages: Vec<QueueMessage>) {
        if messages.is_empty() {
            return;
        }
        messages.sort_by_key(|m| m.offset);
        let count = messages.len();
        {
            let mut pending = self.pending();
            for message in messages.into_iter().rev() {
                pending.push_front(message);
            }
        }
        for _ in 0..count {
            self.notify.notify_one();
        }
    }
}

/// In-memory topic with consumer-group semantics.
#[derive(Clone)]
pub struct MemoryQueue {
    topic: String,
    group: String,
    shared: Arc<QueueShared>,
}

impl MemoryQueue {
    pub fn new(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: group.into(),
            shared: Arc::new(QueueShared::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Messages published and not yet handed to a consumer.
    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    /// Wake every consumer and make `recv` return `None` once drained.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl BatchQueue for MemoryQueue {
    async fn producer(&self) -> BatchResult<Box<dyn QueueProducer>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(queue_error!("topic {} is shut down", self.topic));
        }
        Ok(Box::new(MemoryProducer {
            shared: self.shared.clone(),
        }))
    }

    async fn consumer(&self, group: &str) -> BatchResult<Box<dyn QueueConsumer>> {
        if group != self.group {
            return Err(queue_error!(
                "topic {} is read by consumer group {}, not {group}",
                self.topic,
                self.group
            ));
        }
        debug!("Consumer joined group {group} on topic {}", self.topic);
        Ok(Box::new(MemoryConsumer {
            shared: self.shared.clone(),
            in_flight: HashMap::new(),
        }))
    }
}

struct MemoryProducer {
    shared: Arc<QueueShared>,
}

#[async_trait]
impl QueueProducer for MemoryProducer {
    async fn publish(&mut self, key: &str, payload: Vec<u8>) -> BatchResult<(i32, i64)> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(queue_error!("queue is shut down"));
        }
        let offset = self.shared.next_offset.fetch_add(1, Ordering::SeqCst);
        self.shared.push(QueueMessage {
            key: key.to_string(),
            payload,
            partition: 0,
            offset,
        });
        Ok((0, offset))
    }

    async fn close(&mut self) -> BatchResult<()> {
        Ok(())
    }
}

struct MemoryConsumer {
    shared: Arc<QueueShared>,
    in_flight: HashMap<i64, QueueMessage>,
}

impl MemoryConsumer {
    fn release_in_flight(&mut self) {
        let uncommitted: Vec<QueueMessage> = self.in_flight.drain().map(|(_, m)| m).collect();
        if !uncommitted.is_empty() {
            info!(
                "Returning {} uncommitted message(s) to the queue",
                uncommitted.len()
            );
            self.shared.requeue(uncommitted);
        }
    }
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn recv(&mut self) -> BatchResult<Option<QueueMessage>> {
        loop {
            let notified = self.shared.notify.notified();
            // pop and record without an await in between: cancel safe
            if let Some(message) = self.shared.pending().pop_front() {
                self.in_flight.insert(message.offset, message.clone());
                return Ok(Some(message));
            }
            if self.shared.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            notified.await;
        }
    }

    async fn commit(&mut self, message: &QueueMessage) -> BatchResult<()> {
        match self.in_flight.remove(&message.offset) {
            Some(_) => Ok(()),
            None => Err(queue_error!(
                "offset {} is not held by this consumer",
                message.offset
            )),
        }
    }

    async fn close(&mut self) -> BatchResult<()> {
        self.release_in_flight();
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.release_in_flight();
    }
}

struct Record {
    slots: Vec<String>,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory correlation record store.
#[derive(Default)]
pub struct MemoryResultStore {
    records: DashMap<String, Record>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired records. Reads already ignore them; this only frees memory.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        before - self.records.len()
    }

    /// Remove `id` if it has expired, returning whether a live record remains.
    fn live(&self, id: &str) -> bool {
        let now = Instant::now();
        if self
            .records
            .remove_if(id, |_, record| record.is_expired(now))
            .is_some()
        {
            debug!("Correlation record {id} expired");
            return false;
        }
        self.records.contains_key(id)
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn push_placeholders(&self, id: &str, count: usize) -> BatchResult<()> {
        self.live(id);
        let mut record = self.records.entry(id.to_string()).or_insert_with(|| Record {
            slots: Vec::new(),
            expires_at: None,
        });
        record.slots.extend(std::iter::repeat(String::new()).take(count));
        Ok(())
    }

    async fn expire(&self, id: &str, ttl: Duration) -> BatchResult<()> {
        if !self.live(id) {
            return Err(BatchError::NotFoundOrExpired(id.to_string()));
        }
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.expires_at = Some(Instant::now() + ttl);
                Ok(())
            }
            None => Err(BatchError::NotFoundOrExpired(id.to_string())),
        }
    }

    async fn exists(&self, id: &str) -> BatchResult<bool> {
        Ok(self.live(id))
    }

    async fn slot(&self, id: &str, index: usize) -> BatchResult<Option<String>> {
        if !self.live(id) {
            return Ok(None);
        }
        Ok(self
            .records
            .get(id)
            .and_then(|record| record.slots.get(index).cloned()))
    }

    async fn set_slot(&self, id: &str, index: usize, value: String) -> BatchResult<()> {
        if !self.live(id) {
            return Err(BatchError::NotFoundOrExpired(id.to_string()));
        }
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| BatchError::NotFoundOrExpired(id.to_string()))?;
        let len = record.slots.len();
        match record.slots.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => {
                warn!("Slot {index} out of range for record {id} ({len} slots)");
                Err(store_error!("index {} out of range for {}", index, id))
            }
        }
    }

    async fn slots(&self, id: &str) -> BatchResult<Vec<String>> {
        if !self.live(id) {
            return Ok(Vec::new());
        }
        Ok(self
            .records
            .get(id)
            .map(|record| record.slots.clone())
            .unwrap_or_default())
    }
}

/// Periodically frees expired correlation records.
pub struct StoreJanitor {
    store: Arc<MemoryResultStore>,
    interval: Duration,
}

impl StoreJanitor {
    pub fn new(store: Arc<MemoryResultStore>, interval: Duration) -> Self {
        Self { store, interval }
    }
}

#[async_trait]
impl BackgroundService for StoreJanitor {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let purged = self.store.purge_expired();
                    if purged > 0 {
                        debug!("Purged {purged} expired correlation record(s)");
                    }
                }
            }
        }
    }
}
