//! Signed upload endpoint
//!
//! `POST /{accountName}/{signatureHex}` with a multipart body carrying
//! either one file field, or a `filename` text field plus a `filebase64`
//! text field.
//!
//! The handler only does transport work: it stages the multipart body and
//! hands the raw pieces to the admission pipeline, which owns gate order
//! and every client-visible failure. A malformed multipart body is not an
//! error here - it simply yields an absent payload, so the pipeline's own
//! gates (IP rate check first) decide what the caller sees.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyDataStream, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::routes::{error_response, json_response};
use crate::server::AppState;
use crate::upload::{StagedFile, UploadRequest};

/// Handle a signed upload request.
pub async fn handle_upload(
    req: Request<Incoming>,
    addr: SocketAddr,
    state: Arc<AppState>,
    account: String,
    signature_hex: String,
) -> Response<Full<Bytes>> {
    let client_ip = client_ip(&req, addr, state.args.trust_proxy);
    let form = extract_form(req).await;

    let request = UploadRequest {
        account,
        signature_hex,
        client_ip,
        staged_file: form.staged,
        filename: form.filename,
        filebase64: form.filebase64,
    };

    match state.pipeline.admit(request).await {
        Ok(stored) => json_response(
            StatusCode::OK,
            &serde_json::json!({ "url": stored.url }),
        ),
        Err(reject) => error_response(&reject.to_string()),
    }
}

/// Caller IP for rate limiting: the peer address, or the first
/// X-Forwarded-For entry when the fronting proxy is trusted.
fn client_ip(req: &Request<Incoming>, addr: SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(forwarded) = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
        {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    addr.ip().to_string()
}

/// Fields collected from the multipart body
#[derive(Default)]
struct UploadForm {
    staged: Option<StagedFile>,
    filename: Option<String>,
    filebase64: Option<String>,
}

/// Stage the multipart body: the first file field goes to a temp file,
/// `filename`/`filebase64` text fields are collected as strings.
///
/// Parse errors are downgraded to an absent payload; the pipeline reports
/// the missing piece after its earlier gates have run.
async fn extract_form(req: Request<Incoming>) -> UploadForm {
    let boundary = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok());

    let Some(boundary) = boundary else {
        debug!("Upload request without a multipart content type");
        return UploadForm::default();
    };

    let stream = BodyDataStream::new(req.into_body());
    let mut multipart = multer::Multipart::new(stream, boundary);
    let mut form = UploadForm::default();

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if let Err(e) = collect_field(field, &mut form).await {
                    debug!("Discarding malformed multipart field: {}", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Multipart parse error: {}", e);
                break;
            }
        }
    }

    form
}

/// Collect one multipart field into the form.
async fn collect_field(
    mut field: multer::Field<'static>,
    form: &mut UploadForm,
) -> Result<(), String> {
    let field_name = field.name().map(|s| s.to_string());
    let file_name = field.file_name().map(|s| s.to_string());

    if let Some(original) = file_name {
        // First file field wins; later ones are skipped.
        if form.staged.is_some() {
            return Ok(());
        }

        let path = std::env::temp_dir().join(format!("postern-{}.part", Uuid::new_v4()));
        // The guard owns the path from the start: any error below (or a
        // cancelled request) removes the partial file.
        let staged = StagedFile::new(path.clone(), original);

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| e.to_string())?;
        while let Some(chunk) = field.chunk().await.map_err(|e| e.to_string())? {
            file.write_all(&chunk).await.map_err(|e| e.to_string())?;
        }
        file.flush().await.map_err(|e| e.to_string())?;

        form.staged = Some(staged);
        return Ok(());
    }

    match field_name.as_deref() {
        Some("filename") => {
            form.filename = Some(field.text().await.map_err(|e| e.to_string())?);
        }
        Some("filebase64") => {
            form.filebase64 = Some(field.text().await.map_err(|e| e.to_string())?);
        }
        _ => {}
    }

    Ok(())
}
