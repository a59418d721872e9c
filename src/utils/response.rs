//! Response helpers shared by the batch API and the status endpoint.

use http::{header, HeaderValue, Response, StatusCode};
use serde::Serialize;
use serde_json::json;

use crate::core::BatchError;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
}

pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Build a response with an optional content type
    pub fn http(status: StatusCode, body: Vec<u8>, content_type: Option<&str>) -> Response<Vec<u8>> {
        let mut builder = Response::builder().status(status);

        if let Some(ct) = content_type {
            match HeaderValue::from_str(ct) {
                Ok(header_value) => {
                    builder = builder.header(header::CONTENT_TYPE, header_value);
                }
                Err(e) => {
                    log::error!("Invalid content type '{}': {}", ct, e);
                }
            }
        }

        builder.body(body).unwrap_or_else(|e| {
            log::error!("Failed to build response: {}", e);
            Self::fallback()
        })
    }

    /// Plain text body
    pub fn text(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        Self::http(
            status,
            message.as_bytes().to_vec(),
            Some(content_type::TEXT_PLAIN),
        )
    }

    /// Empty body
    pub fn empty(status: StatusCode) -> Response<Vec<u8>> {
        Self::http(status, Vec::new(), None)
    }

    /// Serialize `data` as the JSON body
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(data) {
            Ok(json_body) => Self::http(status, json_body, Some(content_type::APPLICATION_JSON)),
            Err(e) => {
                log::error!("Failed to serialize JSON response: {}", e);
                Self::error(&BatchError::Serialization(e))
            }
        }
    }

    /// JSON body plus a `Location` header pointing at `location`
    pub fn json_with_location<T: Serialize>(
        status: StatusCode,
        data: &T,
        location: &str,
    ) -> Response<Vec<u8>> {
        let mut response = Self::json(status, data);
        match HeaderValue::from_str(location) {
            Ok(value) => {
                response.headers_mut().insert(header::LOCATION, value);
            }
            Err(e) => log::error!("Invalid location '{}': {}", location, e),
        }
        response
    }

    /// `{"error": kind, "message": text}` with the error's status code
    pub fn error(err: &BatchError) -> Response<Vec<u8>> {
        let body = json!({
            "error": err.kind(),
            "message": err.to_string(),
        });
        match serde_json::to_vec(&body) {
            Ok(json_body) => Self::http(
                err.status_code(),
                json_body,
                Some(content_type::APPLICATION_JSON),
            ),
            Err(_) => Self::fallback(),
        }
    }

    fn fallback() -> Response<Vec<u8>> {
        let mut response = Response::new(b"Internal Server Error".to_vec());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    }
}

/// Common error response helpers
pub struct CommonErrors;

impl CommonErrors {
    pub fn not_found() -> Response<Vec<u8>> {
        ResponseBuilder::text(StatusCode::NOT_FOUND, "Not Found")
    }

    pub fn method_not_allowed() -> Response<Vec<u8>> {
        ResponseBuilder::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed")
    }

    pub fn payload_too_large(limit: usize) -> Response<Vec<u8>> {
        let body = json!({
            "error": "client_input",
            "message": format!("Request body exceeds {limit} bytes"),
        });
        ResponseBuilder::json(StatusCode::PAYLOAD_TOO_LARGE, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_response() {
        let response = ResponseBuilder::text(StatusCode::OK, "PONG!");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body(), b"PONG!");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            content_type::TEXT_PLAIN
        );
    }

    #[test]
    fn test_json_response() {
        let data = json!({"message": "success", "code": 200});
        let response = ResponseBuilder::json(StatusCode::OK, &data);
        assert_eq!(response.status(), StatusCode::OK);
        let expected = r#"{"code":200,"message":"success"}"#;
        assert_eq!(response.body(), expected.as_bytes());
    }

    #[test]
    fn test_error_response() {
        let err = BatchError::NotFoundOrExpired("abc".into());
        let response = ResponseBuilder::error(&err);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["error"], "not_found_or_expired");
        assert!(body["message"].as_str().unwrap().contains("abc"));
    }

    #[test]
    fn test_location_header() {
        let response = ResponseBuilder::json_with_location(
            StatusCode::ACCEPTED,
            &json!({"requestId": "abc"}),
            "/batch/async/abc",
        );
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()[header::LOCATION], "/batch/async/abc");
    }
}
