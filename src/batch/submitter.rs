//! Asynchronous submission: one queue message per item, then a
//! correlation record of empty slots with a TTL.

use std::{sync::Arc, time::Duration};

use log::{error, info, warn};
use uuid::Uuid;

use crate::{
    core::{BatchError, BatchQueue, BatchResult, QueueProducer, ResultStore},
    metrics,
};

use super::item::{QueuedItem, RequestItem};

pub struct AsyncSubmitter {
    queue: Arc<dyn BatchQueue>,
    store: Arc<dyn ResultStore>,
    expire: Duration,
}

impl AsyncSubmitter {
    pub fn new(queue: Arc<dyn BatchQueue>, store: Arc<dyn ResultStore>, expire: Duration) -> Self {
        Self {
            queue,
            store,
            expire,
        }
    }

    /// Queue every item and return the correlation id.
    ///
    /// Any queue or store failure aborts the submission with
    /// `BatchError::Submission`. Messages already published are not rolled
    /// back; without a correlation record their results are never stored.
    pub async fn submit(&self, items: Vec<RequestItem>, identity: &str) -> BatchResult<String> {
        let mut producer = self.queue.producer().await.map_err(|e| {
            error!("Unable to acquire async batch producer: {e}");
            BatchError::Submission(e.to_string())
        })?;

        let correlation_id = Uuid::new_v4().to_string();
        let published = publish_all(producer.as_mut(), &correlation_id, items, identity).await;
        if let Err(e) = producer.close().await {
            warn!("Error closing async batch producer: {e}");
        }
        let count = published?;

        self.store
            .push_placeholders(&correlation_id, count)
            .await
            .map_err(|e| {
                error!("Error saving new async batch request: [request id: {correlation_id}] (error: {e})");
                BatchError::Submission(e.to_string())
            })?;

        self.store
            .expire(&correlation_id, self.expire)
            .await
            .map_err(|e| {
                error!("Error setting expiration on async batch request: [request id: {correlation_id}] (error: {e})");
                BatchError::Submission(e.to_string())
            })?;

        info!("New async batch request stored: [request id: {correlation_id}] [num items: {count}]");
        metrics::items_processed(metrics::MODE_ASYNC, count);
        Ok(correlation_id)
    }
}

async fn publish_all(
    producer: &mut dyn QueueProducer,
    correlation_id: &str,
    items: Vec<RequestItem>,
    identity: &str,
) -> BatchResult<usize> {
    let count = items.len();
    for (idx, item) in items.into_iter().enumerate() {
        let key = item.partition_key(identity);
        let queued = QueuedItem {
            correlation_id: correlation_id.to_string(),
            index: idx as i64,
            item,
            identity: identity.to_string(),
        };
        let payload = queued
            .encode()
            .map_err(|e| BatchError::Submission(e.to_string()))?;

        let (partition, offset) = producer.publish(&key, payload).await.map_err(|e| {
            error!("Error sending async batch item to queue: [request id: {correlation_id}] [index: {idx}] (error: {e})");
            BatchError::Submission(e.to_string())
        })?;
        log::debug!(
            "Item queued: [request id: {correlation_id}] [index: {idx}] [partition: {partition}] [offset: {offset}]"
        );
    }
    Ok(count)
}
