use async_trait::async_trait;
use http::{Response, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};
use serde::Serialize;

use crate::{
    config::Status,
    core::status,
    utils::response::{CommonErrors, ResponseBuilder},
};

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: String,
    workers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Readiness probe, kept off the batch listeners so load balancers can
/// check it without going through the API.
///
/// - 200 OK with {"status": "ok", "workers": n} once bootstrapped
/// - 503 Service Unavailable before that
pub struct StatusHttpApp {
    config: Status,
}

impl StatusHttpApp {
    pub fn new(cfg: &Status) -> Self {
        Self {
            config: cfg.clone(),
        }
    }

    pub fn status_http_service(cfg: &Status) -> Service<Self> {
        let app = Self::new(cfg);
        let addr = &app.config.address.to_string();
        let mut service = Service::new("Status HTTP".to_string(), app);
        service.add_tcp(addr);
        service
    }
}

#[async_trait]
impl ServeHttp for StatusHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        match http_session.req_header().uri.path() {
            "/status/ready" => ready_response(),
            _ => CommonErrors::not_found(),
        }
    }
}

fn ready_response() -> Response<Vec<u8>> {
    let workers = status::workers_running();
    if status::is_ready() {
        let response = StatusResponse {
            status: "ok".to_string(),
            workers,
            error: None,
        };
        ResponseBuilder::json(StatusCode::OK, &response)
    } else {
        let response = StatusResponse {
            status: "error".to_string(),
            workers,
            error: Some("Gateway not bootstrapped yet".to_string()),
        };
        ResponseBuilder::json(StatusCode::SERVICE_UNAVAILABLE, &response)
    }
}
