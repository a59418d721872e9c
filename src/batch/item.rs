//! Batch envelope data model.
//!
//! The JSON field names follow the wire format existing clients already
//! send: `url`/`code`/`requestId`/`idx`/`identityId`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::core::{BatchError, BatchResult};

/// A single HTTP-style call inside a batch.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestItem {
    #[serde(default)]
    pub method: String,
    /// Either an absolute `http(s)://` URL or `service://path`.
    #[serde(rename = "url", alias = "target")]
    pub target: String,
    #[serde(default)]
    pub body: JsonValue,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl RequestItem {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: JsonValue) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Method normalized to upper case; an empty method means `GET`.
    pub fn normalized_method(&self) -> String {
        let method = self.method.trim();
        if method.is_empty() {
            "GET".to_string()
        } else {
            method.to_ascii_uppercase()
        }
    }

    /// Routing key used when the item is published to the queue.
    pub fn partition_key(&self, identity: &str) -> String {
        format!("{identity}{}", self.target)
    }
}

/// The result of one sub-request. Present for every submitted item,
/// failures included.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseItem {
    #[serde(rename = "code", alias = "statusCode")]
    pub status_code: u16,
    #[serde(default)]
    pub body: JsonValue,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ResponseItem {
    pub fn new(status_code: u16, body: JsonValue) -> Self {
        Self {
            status_code,
            body,
            headers: HashMap::new(),
        }
    }

    /// Error item describing a per-item failure. Always a 500.
    pub fn from_error(err: &BatchError) -> Self {
        Self::new(
            500,
            json!({
                "error": err.kind(),
                "message": err.to_string(),
            }),
        )
    }
}

/// Ordered list of request items submitted in one envelope.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchRequest(pub Vec<RequestItem>);

impl BatchRequest {
    pub fn from_slice(data: &[u8]) -> BatchResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| BatchError::ClientInput(format!("Unable to parse JSON: {e}")))
    }

    /// Rejects empty envelopes and envelopes larger than `max`.
    pub fn validate(&self, max: usize) -> BatchResult<()> {
        if self.0.is_empty() {
            return Err(BatchError::ClientInput("No batch items received".to_string()));
        }
        if self.0.len() > max {
            return Err(BatchError::ClientInput(format!(
                "Too many batch requests at once. Max allowed: {max} Sent: {}",
                self.0.len()
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn items(&self) -> &[RequestItem] {
        &self.0
    }

    pub fn into_items(self) -> Vec<RequestItem> {
        self.0
    }
}

impl From<Vec<RequestItem>> for BatchRequest {
    fn from(items: Vec<RequestItem>) -> Self {
        BatchRequest(items)
    }
}

/// One queue message: a request item tagged with its correlation id and
/// original position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    #[serde(rename = "requestId")]
    pub correlation_id: String,
    #[serde(rename = "idx")]
    pub index: i64,
    pub item: RequestItem,
    #[serde(rename = "identityId", default)]
    pub identity: String,
}

impl QueuedItem {
    pub fn encode(&self) -> BatchResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> BatchResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}
