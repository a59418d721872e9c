//! Batch HTTP API.
//!
//! `POST /batch` runs a batch synchronously, `POST /batch/async` queues one
//! and `GET /batch/async/{requestId}` polls for its results.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use http::{header, HeaderMap, HeaderName, Method, Response, StatusCode};
use log::{debug, error, info};
use matchit::{Match, Router};
use pingora::{apps::http_app::ServeHttp, protocols::http::ServerSession};
use serde_json::json;

use crate::{
    batch::{AsyncSubmitter, BatchExecutor, BatchRequest, ResultAggregator, Retrieval},
    config,
    core::{BatchError, BatchResult},
    metrics,
    utils::response::{CommonErrors, ResponseBuilder},
};

pub const ASYNC_RESULT_PREFIX: &str = "/batch/async/";

/// Components and limits behind the batch routes.
pub struct BatchApi {
    executor: BatchExecutor,
    submitter: AsyncSubmitter,
    aggregator: ResultAggregator,
    max_requests: usize,
    max_requests_async: usize,
}

impl BatchApi {
    pub fn new(
        executor: BatchExecutor,
        submitter: AsyncSubmitter,
        aggregator: ResultAggregator,
        cfg: &config::Batch,
    ) -> Self {
        Self {
            executor,
            submitter,
            aggregator,
            max_requests: cfg.max_requests,
            max_requests_async: cfg.max_requests_async,
        }
    }

    pub async fn run_sync(&self, body: &[u8], identity: &str) -> Response<Vec<u8>> {
        let batch = match parse_batch(body, self.max_requests) {
            Ok(batch) => batch,
            Err(e) => return ResponseBuilder::error(&e),
        };
        info!("Sync batch received: [identity: {identity}] [num items: {}]", batch.len());
        metrics::batch_accepted(metrics::MODE_SYNC);

        let responses = self.executor.run_batch(batch.into_items(), identity).await;
        ResponseBuilder::json(StatusCode::OK, &responses)
    }

    pub async fn submit_async(&self, body: &[u8], identity: &str) -> Response<Vec<u8>> {
        let batch = match parse_batch(body, self.max_requests_async) {
            Ok(batch) => batch,
            Err(e) => return ResponseBuilder::error(&e),
        };
        metrics::batch_accepted(metrics::MODE_ASYNC);

        match self.submitter.submit(batch.into_items(), identity).await {
            Ok(id) => ResponseBuilder::json_with_location(
                StatusCode::ACCEPTED,
                &json!({ "requestId": id }),
                &result_location(&id),
            ),
            Err(e) => {
                log_failure("Async batch submission", identity, &e);
                ResponseBuilder::error(&e)
            }
        }
    }

    pub async fn retrieve(&self, request_id: &str) -> Response<Vec<u8>> {
        match self.aggregator.retrieve(request_id).await {
            Ok(Retrieval::Complete(responses)) => {
                info!(
                    "Async batch request complete: [request id: {request_id}] [num items: {}]",
                    responses.len()
                );
                ResponseBuilder::json(StatusCode::OK, &responses)
            }
            Ok(Retrieval::Pending) => ResponseBuilder::json_with_location(
                StatusCode::ACCEPTED,
                &json!({ "requestId": request_id }),
                &result_location(request_id),
            ),
            Err(e) => {
                log_failure("Async batch retrieval", request_id, &e);
                ResponseBuilder::error(&e)
            }
        }
    }
}

fn log_failure(action: &str, subject: &str, e: &BatchError) {
    if e.is_infrastructure() {
        error!("{action} failed [{subject}]: {e}");
    } else {
        debug!("{action} rejected [{subject}]: {e}");
    }
}

fn parse_batch(body: &[u8], max: usize) -> BatchResult<BatchRequest> {
    let batch = BatchRequest::from_slice(body)?;
    batch.validate(max)?;
    Ok(batch)
}

pub fn result_location(request_id: &str) -> String {
    format!("{ASYNC_RESULT_PREFIX}{request_id}")
}

/// Inbound request after routing, ready for a handler.
pub struct ApiRequest {
    pub params: HashMap<String, String>,
    pub identity: String,
    pub body: Vec<u8>,
}

#[async_trait]
trait Handler {
    async fn handle(&self, api: &BatchApi, request: ApiRequest) -> Response<Vec<u8>>;
}

struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, _api: &BatchApi, _request: ApiRequest) -> Response<Vec<u8>> {
        ResponseBuilder::text(StatusCode::OK, "PONG!")
    }
}

struct SyncBatchHandler;

#[async_trait]
impl Handler for SyncBatchHandler {
    async fn handle(&self, api: &BatchApi, request: ApiRequest) -> Response<Vec<u8>> {
        api.run_sync(&request.body, &request.identity).await
    }
}

struct AsyncSubmitHandler;

#[async_trait]
impl Handler for AsyncSubmitHandler {
    async fn handle(&self, api: &BatchApi, request: ApiRequest) -> Response<Vec<u8>> {
        api.submit_async(&request.body, &request.identity).await
    }
}

struct AsyncResultHandler;

#[async_trait]
impl Handler for AsyncResultHandler {
    async fn handle(&self, api: &BatchApi, request: ApiRequest) -> Response<Vec<u8>> {
        match request.params.get("requestId") {
            Some(id) => api.retrieve(id).await,
            None => ResponseBuilder::error(&BatchError::ClientInput("Missing request id".into())),
        }
    }
}

pub struct BatchHttpApp {
    api: Arc<BatchApi>,
    router: Router<HashMap<Method, Box<dyn Handler + Send + Sync>>>,
    identity_header: HeaderName,
    max_body_bytes: usize,
}

impl BatchHttpApp {
    pub fn new(api: Arc<BatchApi>, cfg: &config::Batch) -> BatchResult<Self> {
        let identity_header = HeaderName::from_bytes(cfg.identity_header.as_bytes())
            .map_err(|e| BatchError::Configuration(format!("identity header: {e}")))?;

        let mut this = Self {
            api,
            router: Router::new(),
            identity_header,
            max_body_bytes: cfg.max_body_bytes,
        };

        this.route("/ping", Method::GET, Box::new(PingHandler))?
            .route("/batch", Method::POST, Box::new(SyncBatchHandler))?
            .route("/batch/async", Method::POST, Box::new(AsyncSubmitHandler))?
            .route(
                "/batch/async/{requestId}",
                Method::GET,
                Box::new(AsyncResultHandler),
            )?;

        Ok(this)
    }

    fn route(
        &mut self,
        path: &str,
        method: Method,
        handler: Box<dyn Handler + Send + Sync>,
    ) -> BatchResult<&mut Self> {
        if self.router.at(path).is_err() {
            let mut handlers: HashMap<Method, Box<dyn Handler + Send + Sync>> = HashMap::new();
            handlers.insert(method, handler);
            self.router
                .insert(path, handlers)
                .map_err(|e| BatchError::Configuration(format!("route {path}: {e}")))?;
        } else if let Ok(routes) = self.router.at_mut(path) {
            routes.value.insert(method, handler);
        }
        Ok(self)
    }

    /// Whether `method` on `path` resolves to a handler.
    fn matches(&self, method: &Method, path: &str) -> bool {
        self.router
            .at(path)
            .map(|m| m.value.contains_key(method))
            .unwrap_or(false)
    }

    /// Route an already-read request.
    pub async fn dispatch(
        &self,
        method: &Method,
        path: &str,
        identity: String,
        body: Vec<u8>,
    ) -> Response<Vec<u8>> {
        if method == Method::OPTIONS {
            return ResponseBuilder::empty(StatusCode::NO_CONTENT);
        }

        match self.router.at(path) {
            Ok(Match { value, params }) => match value.get(method) {
                Some(handler) => {
                    let params = params
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    let request = ApiRequest {
                        params,
                        identity,
                        body,
                    };
                    handler.handle(&self.api, request).await
                }
                None => CommonErrors::method_not_allowed(),
            },
            Err(_) => CommonErrors::not_found(),
        }
    }

    /// Identity of the caller, empty when the header is missing or not
    /// visible ASCII.
    fn identity(&self, headers: &HeaderMap) -> String {
        headers
            .get(&self.identity_header)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    /// Read the body, giving up once it grows past `max_body_bytes`.
    async fn read_body(&self, http_session: &mut ServerSession) -> Result<Vec<u8>, Response<Vec<u8>>> {
        let mut body = LimitedBody::new(self.max_body_bytes);
        body.check_declared(&http_session.req_header().headers)?;

        loop {
            match http_session.read_request_body().await {
                Ok(Some(bytes)) => body.push(&bytes)?,
                Ok(None) => return Ok(body.into_inner()),
                Err(e) => {
                    debug!("Failed to read request body: {e}");
                    return Err(ResponseBuilder::error(&BatchError::ClientInput(
                        "Unable to read request body".into(),
                    )));
                }
            }
        }
    }
}

/// Request body buffer capped at a byte limit.
struct LimitedBody {
    limit: usize,
    data: Vec<u8>,
}

impl LimitedBody {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            data: Vec::new(),
        }
    }

    /// Reject up front when Content-Length already exceeds the limit.
    fn check_declared(&self, headers: &HeaderMap) -> Result<(), Response<Vec<u8>>> {
        let declared = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        match declared {
            Some(len) if len > self.limit => Err(CommonErrors::payload_too_large(self.limit)),
            _ => Ok(()),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Result<(), Response<Vec<u8>>> {
        if self.data.len() + chunk.len() > self.limit {
            return Err(CommonErrors::payload_too_large(self.limit));
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

#[async_trait]
impl ServeHttp for BatchHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        let (path, method, identity) = {
            let req_header = http_session.req_header();
            (
                req_header.uri.path().to_string(),
                req_header.method.clone(),
                self.identity(&req_header.headers),
            )
        };

        let body = if method == Method::POST && self.matches(&method, &path) {
            match self.read_body(http_session).await {
                Ok(body) => body,
                Err(resp) => {
                    http_session.set_keepalive(None);
                    return resp;
                }
            }
        } else {
            Vec::new()
        };

        self.dispatch(&method, &path, identity, body).await
    }
}
