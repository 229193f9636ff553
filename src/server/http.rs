//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. One suspendable task
//! per connection; the router is a plain `match` over (method, path).

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Args;
use crate::ledger::{IdentityResolver, LedgerClient};
use crate::logging::AuditLog;
use crate::ratelimit::RateLimiter;
use crate::routes;
use crate::store::{ContentStore, HttpObjectStore, ObjectStore};
use crate::types::PosternError;
use crate::upload::{PipelineConfig, UploadPipeline};

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Audit log for policy rejections (file sink attached in main)
    pub audit: AuditLog,
    /// The upload admission pipeline
    pub pipeline: UploadPipeline,
    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    /// Wire the production collaborators from configuration.
    pub fn new(args: Args) -> crate::Result<Self> {
        let request_windows = args.request_windows().map_err(PosternError::Config)?;
        let data_windows = args.data_windows().map_err(PosternError::Config)?;

        let request_limits = Arc::new(RateLimiter::new("requests", request_windows));
        let data_limits = Arc::new(RateLimiter::new("data", data_windows));

        let resolver: Arc<dyn IdentityResolver> =
            Arc::new(LedgerClient::new(args.ledger_url.clone()));
        let object_store: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(
            args.storage_url.clone(),
            args.storage_bucket.clone(),
        ));
        let content_store = ContentStore::new(object_store, args.public_url());

        let audit = AuditLog::new(args.node_id.to_string());

        let pipeline = UploadPipeline::new(
            resolver,
            content_store,
            request_limits,
            data_limits,
            audit.clone(),
            PipelineConfig {
                min_reputation: args.min_reputation,
                allow_test_signer: args.allow_test_signer,
                test_signer_key: args.test_signer_key.clone(),
            },
        )?;

        Ok(Self {
            args,
            audit,
            pipeline,
            started_at: Instant::now(),
        })
    }
}

/// Run the HTTP server until the process is stopped.
pub async fn run(state: Arc<AppState>) -> crate::Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Postern listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        // Liveness probe
        (Method::GET, "/health") | (Method::GET, "/healthz") => routes::health_check(&state),

        // Version info for deployment verification
        (Method::GET, "/version") => routes::version_info(),

        // CORS preflight
        (Method::OPTIONS, _) => preflight_response(),

        // Signed upload: POST /{accountName}/{signatureHex}
        (Method::POST, p) => match parse_upload_path(p) {
            Some((account, signature_hex)) => {
                return Ok(
                    routes::handle_upload(req, addr, Arc::clone(&state), account, signature_hex)
                        .await,
                );
            }
            None => not_found_response(&path),
        },

        _ => not_found_response(&path),
    };

    Ok(response)
}

/// Split `/{account}/{signature}` into its two segments.
///
/// Empty segments pass through: the pipeline's parameter gate owns the
/// error message for them.
fn parse_upload_path(path: &str) -> Option<(String, String)> {
    let mut segments = path.trim_start_matches('/').split('/');
    let account = segments.next()?;
    let signature = segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    Some((account.to_string(), signature.to_string()))
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Headers", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
        "hint": "POST /{accountName}/{signatureHex} with a multipart body"
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload_path() {
        assert_eq!(
            parse_upload_path("/alice/deadbeef"),
            Some(("alice".to_string(), "deadbeef".to_string()))
        );
        // Empty segments pass through for the pipeline to reject
        assert_eq!(
            parse_upload_path("/alice/"),
            Some(("alice".to_string(), String::new()))
        );
        assert_eq!(parse_upload_path("/alice"), None);
        assert_eq!(parse_upload_path("/a/b/c"), None);
    }
}
