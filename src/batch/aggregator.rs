//! Retrieval of async batch results.

use std::sync::Arc;

use log::{debug, info};

use crate::core::{BatchError, BatchResult, ResultStore};

use super::item::ResponseItem;

/// Outcome of polling a correlation id.
#[derive(Clone, Debug, PartialEq)]
pub enum Retrieval {
    /// Every slot is filled; responses are in submission order.
    Complete(Vec<ResponseItem>),
    /// At least one slot is still empty.
    Pending,
}

pub struct ResultAggregator {
    store: Arc<dyn ResultStore>,
}

impl ResultAggregator {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self { store }
    }

    /// Read-only: never mutates the correlation record.
    pub async fn retrieve(&self, correlation_id: &str) -> BatchResult<Retrieval> {
        if !self.store.exists(correlation_id).await? {
            info!("Async batch request not found: [request id: {correlation_id}]");
            return Err(BatchError::NotFoundOrExpired(correlation_id.to_string()));
        }

        let slots = self.store.slots(correlation_id).await?;
        // expired between the two reads
        if slots.is_empty() {
            return Err(BatchError::NotFoundOrExpired(correlation_id.to_string()));
        }

        let filled = slots.iter().filter(|s| !s.is_empty()).count();
        if filled < slots.len() {
            debug!(
                "Async batch request pending: [request id: {correlation_id}] [{filled}/{}]",
                slots.len()
            );
            return Ok(Retrieval::Pending);
        }

        let responses = slots
            .iter()
            .enumerate()
            .map(|(idx, slot)| {
                serde_json::from_str::<ResponseItem>(slot).unwrap_or_else(|e| {
                    log::error!(
                        "Corrupt slot in async batch request: [request id: {correlation_id}] [index: {idx}] (error: {e})"
                    );
                    ResponseItem::from_error(&BatchError::Serialization(e))
                })
            })
            .collect();
        Ok(Retrieval::Complete(responses))
    }
}
