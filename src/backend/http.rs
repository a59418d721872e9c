//! Outbound HTTP client backed by reqwest.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use log::debug;
use serde_json::Value as JsonValue;

use crate::{
    batch::ResponseItem,
    core::{BatchError, BatchResult, HttpClient, OutboundRequest},
};

/// Real HTTP client implementation using reqwest.
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client whose calls are bounded by `timeout`.
    pub fn new(timeout: Duration) -> BatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BatchError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: OutboundRequest) -> BatchResult<ResponseItem> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = first_values(response.headers());
        let bytes = response.bytes().await?;
        debug!("Batch item response: status {status}, {} bytes", bytes.len());

        Ok(ResponseItem {
            status_code: status,
            body: decode_body(&bytes)?,
            headers,
        })
    }
}

/// Responses must carry JSON; an empty body decodes as `null`.
pub fn decode_body(bytes: &[u8]) -> BatchResult<JsonValue> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(JsonValue::Null);
    }
    serde_json::from_slice(bytes).map_err(|e| BatchError::Decode(e.to_string()))
}

fn first_values(headers: &http::HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(headers.keys_len());
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    out
}
