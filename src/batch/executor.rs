//! Synchronous fan-out/fan-in execution.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, warn};

use crate::{
    core::{BatchError, BatchResult, HttpClient},
    metrics,
};

use super::{
    item::{RequestItem, ResponseItem},
    resolver::TargetResolver,
};

/// Runs request items against their targets.
#[derive(Clone)]
pub struct BatchExecutor {
    resolver: Arc<TargetResolver>,
    client: Arc<dyn HttpClient>,
}

impl BatchExecutor {
    pub fn new(resolver: Arc<TargetResolver>, client: Arc<dyn HttpClient>) -> Self {
        Self { resolver, client }
    }

    /// Resolve and execute one item.
    pub async fn execute_item(&self, item: &RequestItem, identity: &str) -> BatchResult<ResponseItem> {
        let request = self.resolver.resolve(item, identity)?;
        debug!("Executing batch item {} {}", request.method, request.url);
        self.client.execute(request).await
    }

    /// Like [`execute_item`](Self::execute_item) but folds any failure into
    /// an error `ResponseItem`.
    pub async fn run_item(&self, item: &RequestItem, identity: &str) -> ResponseItem {
        match self.execute_item(item, identity).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Batch item {} {} failed: {e}", item.method, item.target);
                ResponseItem::from_error(&e)
            }
        }
    }

    /// Execute every item concurrently. The result has the same length and
    /// order as `items` whatever order the calls complete in; failures
    /// become 500 items and never fail the batch.
    pub async fn run_batch(&self, items: Vec<RequestItem>, identity: &str) -> Vec<ResponseItem> {
        let handles = items
            .into_iter()
            .map(|item| {
                let executor = self.clone();
                let identity = identity.to_string();
                tokio::spawn(async move { executor.execute_item(&item, &identity).await })
            })
            .collect::<Vec<_>>();

        let responses = join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(idx, joined)| {
                let outcome = joined.unwrap_or_else(|e| {
                    Err(BatchError::Internal(format!("batch item task aborted: {e}")))
                });
                let response = outcome.unwrap_or_else(|e| {
                    warn!("Batch item {idx} failed: {e}");
                    ResponseItem::from_error(&e)
                });
                metrics::item_completed(metrics::MODE_SYNC, response.status_code);
                response
            })
            .collect::<Vec<_>>();

        metrics::items_processed(metrics::MODE_SYNC, responses.len());
        responses
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{backend::testing::MockHttpClient, batch::resolver::TargetMap};

    fn executor(client: Arc<MockHttpClient>) -> BatchExecutor {
        let targets: TargetMap = [("svc".to_string(), "http://svc.internal".to_string())]
            .into_iter()
            .collect();
        let resolver = Arc::new(TargetResolver::new(targets, "X-Identity-ID").unwrap());
        BatchExecutor::new(resolver, client)
    }

    #[tokio::test]
    async fn test_order_independent_of_latency() {
        let client = Arc::new(
            MockHttpClient::new()
                .with_delay("http://svc.internal/slow", Duration::from_millis(120))
                .with_delay("http://svc.internal/medium", Duration::from_millis(60)),
        );
        let items = vec![
            RequestItem::new("GET", "svc://slow"),
            RequestItem::new("GET", "svc://medium"),
            RequestItem::new("GET", "svc://fast"),
        ];

        let responses = executor(client.clone()).run_batch(items, "me").await;

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].body["url"], "http://svc.internal/slow");
        assert_eq!(responses[1].body["url"], "http://svc.internal/medium");
        assert_eq!(responses[2].body["url"], "http://svc.internal/fast");
        // the fast call finished first
        assert_eq!(client.completed_order()[0], "http://svc.internal/fast");
    }

    #[tokio::test]
    async fn test_failures_become_items() {
        let client = Arc::new(
            MockHttpClient::new()
                .with_status("https://ext.example.com/missing", 404)
                .with_failure("https://ext.example.com/down"),
        );
        let items = vec![
            RequestItem::new("GET", "unknown://x"),
            RequestItem::new("GET", "https://ext.example.com/missing"),
            RequestItem::new("GET", "https://ext.example.com/down"),
            RequestItem::new("POST", "svc://ok").with_body(json!({"a": 1})),
        ];

        let responses = executor(client.clone()).run_batch(items, "me").await;

        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0].status_code, 500);
        assert_eq!(responses[0].body["error"], "unrecognized_service");
        assert_eq!(responses[1].status_code, 404);
        assert_eq!(responses[2].status_code, 500);
        assert_eq!(responses[2].body["error"], "transport");
        assert_eq!(responses[3].status_code, 200);
        assert_eq!(responses[3].body["method"], "POST");
        assert_eq!(responses[3].body["identity"], "me");
        // the unresolvable item never reached the client
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_upstream_5xx_counted_as_failure() {
        let client = Arc::new(
            MockHttpClient::new()
                .with_status("https://ext.example.com/busy", 503)
                .with_failure("https://ext.example.com/down"),
        );
        let items = vec![
            RequestItem::new("GET", "https://ext.example.com/busy"),
            RequestItem::new("GET", "https://ext.example.com/down"),
        ];

        let before = metrics::item_failures(metrics::MODE_SYNC);
        let responses = executor(client).run_batch(items, "me").await;

        assert_eq!(responses[0].status_code, 503);
        assert_eq!(responses[1].status_code, 500);
        assert!(metrics::item_failures(metrics::MODE_SYNC) >= before + 2);
    }

    #[tokio::test]
    async fn test_panicking_item_is_contained() {
        let client = Arc::new(MockHttpClient::new().with_panic_once("http://svc.internal/boom"));
        let items = vec![
            RequestItem::new("GET", "svc://boom"),
            RequestItem::new("GET", "svc://fine"),
        ];

        let responses = executor(client).run_batch(items, "me").await;

        assert_eq!(responses[0].status_code, 500);
        assert_eq!(responses[0].body["error"], "internal");
        assert_eq!(responses[1].status_code, 200);
    }
}
