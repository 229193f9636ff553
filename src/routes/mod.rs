//! HTTP routes for Postern

pub mod health;
pub mod upload;

pub use health::{health_check, version_info};
pub use upload::handle_upload;

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};

/// Build a JSON response with the given status
pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

/// Build a `400 {"error": ...}` response
pub fn error_response(message: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::BAD_REQUEST,
        &serde_json::json!({ "error": message }),
    )
}
