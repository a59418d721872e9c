//! Capability interfaces for batchgate
//!
//! The executor, submitter, aggregator and workers only ever talk to the
//! outside world through these traits. Implementations are injected by the
//! composition root (or by tests).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::batch::ResponseItem;

use super::error::BatchResult;

/// A fully resolved outbound request.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    /// JSON payload; `None` when the item carried no body.
    pub body: Option<Bytes>,
}

/// Executes outbound sub-requests
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform the call and decode the response into a `ResponseItem`
    async fn execute(&self, request: OutboundRequest) -> BatchResult<ResponseItem>;
}

/// A message read from the queue
#[derive(Clone, Debug, PartialEq)]
pub struct QueueMessage {
    pub key: String,
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

/// Publishes serialized queued items
#[async_trait]
pub trait QueueProducer: Send {
    /// Publish one message, returning `(partition, offset)`
    async fn publish(&mut self, key: &str, payload: Vec<u8>) -> BatchResult<(i32, i64)>;

    /// Release the producer
    async fn close(&mut self) -> BatchResult<()>;
}

/// Consumer group member
#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait for the next message. Must be cancel safe: a cancelled call
    /// never loses a message. `None` means the queue was shut down.
    async fn recv(&mut self) -> BatchResult<Option<QueueMessage>>;

    /// Acknowledge a message so it is not delivered again
    async fn commit(&mut self, message: &QueueMessage) -> BatchResult<()>;

    /// Leave the consumer group. Uncommitted messages become available to
    /// other members.
    async fn close(&mut self) -> BatchResult<()>;
}

/// Factory for queue handles
#[async_trait]
pub trait BatchQueue: Send + Sync {
    async fn producer(&self) -> BatchResult<Box<dyn QueueProducer>>;
    /// Join `group`. Members of one group share the topic's messages.
    async fn consumer(&self, group: &str) -> BatchResult<Box<dyn QueueConsumer>>;
}

/// Keyed ordered-list store holding correlation records
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create a record of `count` empty slots
    async fn push_placeholders(&self, id: &str, count: usize) -> BatchResult<()>;

    /// Set the record's time to live
    async fn expire(&self, id: &str, ttl: Duration) -> BatchResult<()>;

    /// Whether the record exists and has not expired
    async fn exists(&self, id: &str) -> BatchResult<bool>;

    /// Read one slot. `None` when the record or slot does not exist.
    async fn slot(&self, id: &str, index: usize) -> BatchResult<Option<String>>;

    /// Overwrite one slot. Fails with `NotFoundOrExpired` when the record
    /// is gone.
    async fn set_slot(&self, id: &str, index: usize, value: String) -> BatchResult<()>;

    /// All slots in index order, empty when the record does not exist
    async fn slots(&self, id: &str) -> BatchResult<Vec<String>>;
}
