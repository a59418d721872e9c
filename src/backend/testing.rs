//! Scripted HTTP client for tests.
//!
//! Every call echoes `{url, method, identity, body}` back with status 200
//! unless a rule for the URL says otherwise.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::{
    batch::ResponseItem,
    core::{BatchError, BatchResult, HttpClient, OutboundRequest},
};

#[derive(Default)]
pub struct MockHttpClient {
    delays: HashMap<String, Duration>,
    statuses: HashMap<String, u16>,
    failures: HashSet<String>,
    panic_once: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    calls_by_url: Mutex<HashMap<String, usize>>,
    completed: Mutex<Vec<String>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, url: &str, delay: Duration) -> Self {
        self.delays.insert(url.to_string(), delay);
        self
    }

    pub fn with_status(mut self, url: &str, status: u16) -> Self {
        self.statuses.insert(url.to_string(), status);
        self
    }

    pub fn with_failure(mut self, url: &str) -> Self {
        self.failures.insert(url.to_string());
        self
    }

    /// The first call to `url` panics, later calls succeed.
    pub fn with_panic_once(self, url: &str) -> Self {
        self.panic_once.lock().unwrap().insert(url.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls_by_url.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn completed_order(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: OutboundRequest) -> BatchResult<ResponseItem> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_url
            .lock()
            .unwrap()
            .entry(request.url.clone())
            .or_default() += 1;

        let should_panic = self.panic_once.lock().unwrap().remove(&request.url);
        if should_panic {
            panic!("scripted panic for {}", request.url);
        }

        if let Some(delay) = self.delays.get(&request.url) {
            tokio::time::sleep(*delay).await;
        }
        self.completed.lock().unwrap().push(request.url.clone());

        if self.failures.contains(&request.url) {
            return Err(BatchError::Transport(format!(
                "connection refused: {}",
                request.url
            )));
        }

        let body = match &request.body {
            Some(bytes) => serde_json::from_slice(bytes)?,
            None => JsonValue::Null,
        };
        let identity = request
            .headers
            .get("x-identity-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        let status = self.statuses.get(&request.url).copied().unwrap_or(200);
        Ok(ResponseItem::new(
            status,
            json!({
                "url": request.url,
                "method": request.method.as_str(),
                "identity": identity,
                "body": body,
            }),
        ))
    }
}
