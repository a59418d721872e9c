//! Target resolution.
//!
//! Turns a [`RequestItem`] into an [`OutboundRequest`]: external targets
//! (`http://`, `https://`) are used verbatim, internal `service://path`
//! targets are resolved through the [`TargetMap`].

use std::collections::HashMap;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use serde_json::Value as JsonValue;

use crate::core::{BatchError, BatchResult, OutboundRequest};

use super::item::RequestItem;

const EXTERNAL_SCHEMES: &[&str] = &["http://", "https://"];
const SERVICE_SEPARATOR: &str = "://";

/// Read-only mapping of logical service name to base URL.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetMap {
    hosts: HashMap<String, String>,
}

impl TargetMap {
    pub fn new(hosts: HashMap<String, String>) -> Self {
        Self { hosts }
    }

    pub fn get(&self, service: &str) -> Option<&str> {
        self.hosts.get(service).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Destination URL for an internal `service://path` target.
    pub fn internal_url(&self, target: &str) -> BatchResult<String> {
        let (service, path) = target.split_once(SERVICE_SEPARATOR).ok_or_else(|| {
            BatchError::RequestConstruction(format!(
                "target '{target}' is neither an http(s) URL nor service://path"
            ))
        })?;

        let base = self.get(service).ok_or_else(|| {
            log::warn!("Unable to resolve batch target {target}: service unrecognized");
            BatchError::UnrecognizedService(service.to_string())
        })?;

        // exactly one '/' between base and path
        let path = path.trim_start_matches('/');
        if base.ends_with('/') {
            Ok(format!("{base}{path}"))
        } else {
            Ok(format!("{base}/{path}"))
        }
    }
}

impl FromIterator<(String, String)> for TargetMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        TargetMap::new(iter.into_iter().collect())
    }
}

pub fn is_external(target: &str) -> bool {
    let lower = target.trim_start().to_ascii_lowercase();
    EXTERNAL_SCHEMES.iter().any(|scheme| lower.starts_with(scheme))
}

/// Builds outbound requests for request items.
///
/// The identity header is attached to internal and external requests alike
/// and replaces any value the item set for the same header.
#[derive(Clone, Debug)]
pub struct TargetResolver {
    targets: TargetMap,
    identity_header: HeaderName,
}

impl TargetResolver {
    pub fn new(targets: TargetMap, identity_header: &str) -> BatchResult<Self> {
        let identity_header = HeaderName::from_bytes(identity_header.as_bytes()).map_err(|e| {
            BatchError::Configuration(format!("invalid identity header '{identity_header}': {e}"))
        })?;
        Ok(Self {
            targets,
            identity_header,
        })
    }

    pub fn targets(&self) -> &TargetMap {
        &self.targets
    }

    /// Destination URL for the item, internal or external.
    pub fn destination(&self, item: &RequestItem) -> BatchResult<String> {
        if is_external(&item.target) {
            Ok(item.target.trim().to_string())
        } else {
            self.targets.internal_url(&item.target)
        }
    }

    pub fn resolve(&self, item: &RequestItem, identity: &str) -> BatchResult<OutboundRequest> {
        let url = self.destination(item)?;
        url.parse::<Uri>()
            .map_err(|e| BatchError::RequestConstruction(format!("invalid URL '{url}': {e}")))?;

        let method = Method::from_bytes(item.normalized_method().as_bytes()).map_err(|e| {
            BatchError::RequestConstruction(format!("invalid method '{}': {e}", item.method))
        })?;

        let mut headers = HeaderMap::with_capacity(item.headers.len() + 1);
        for (name, value) in &item.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                BatchError::RequestConstruction(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                BatchError::RequestConstruction(format!("invalid value for header '{name}': {e}"))
            })?;
            headers.append(name, value);
        }

        let identity = HeaderValue::from_str(identity).map_err(|e| {
            BatchError::RequestConstruction(format!("invalid identity value: {e}"))
        })?;
        headers.insert(self.identity_header.clone(), identity);

        let body = match &item.body {
            JsonValue::Null => None,
            body => Some(Bytes::from(serde_json::to_vec(body)?)),
        };
        if body.is_some() && !headers.contains_key(http::header::CONTENT_TYPE) {
            headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        Ok(OutboundRequest {
            method,
            url,
            headers,
            body,
        })
    }
}
