//! Upload admission pipeline
//!
//! The ten-gate state machine that decides whether a signed upload is
//! persisted. Gates run in strict order and each either advances or
//! terminates the request with a distinct client-visible rejection:
//!
//! 1. Per-IP request rate check
//! 2. Parameter presence check
//! 3. Signature parse
//! 4. Account resolution against the ledger
//! 5. Reputation gate (log10-normalized, boundary inclusive)
//! 6. Posting-key authorization weight gate (position-0 key only)
//! 7. Payload extraction (staged multipart file or inline base64)
//! 8. Per-account data-volume rate check
//! 9. Signature verification over the content digest
//! 10. Content-addressed store write
//!
//! There are no retries: every gate evaluates once per request, and a
//! storage write either fully succeeds or the request terminates without
//! a stored object.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::ledger::{normalize_reputation, IdentityResolver};
use crate::logging::AuditLog;
use crate::ratelimit::RateLimiter;
use crate::signature;
use crate::store::{ContentStore, StoredObject};
use crate::types::PosternError;

const BYTES_PER_MEGABYTE: f64 = 1_048_576.0;

/// A multipart file staged to a temp file on disk.
///
/// The file is removed when the payload is read, and removed again on drop
/// for every path that never reaches the read: an earlier gate rejecting
/// the request, a handler error, or task cancellation.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    filename: String,
    removed: bool,
}

impl StagedFile {
    pub fn new(path: PathBuf, filename: String) -> Self {
        Self {
            path,
            filename,
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Read the staged bytes and remove the file.
    ///
    /// Removal happens whether or not the read succeeds.
    pub async fn read_and_discard(mut self) -> std::io::Result<Vec<u8>> {
        let result = tokio::fs::read(&self.path).await;
        self.remove();
        result
    }

    fn remove(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), "Failed to remove staged file: {}", e);
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Raw request pieces as extracted from transport, before any gate has run.
pub struct UploadRequest {
    pub account: String,
    pub signature_hex: String,
    pub client_ip: String,
    pub staged_file: Option<StagedFile>,
    pub filename: Option<String>,
    pub filebase64: Option<String>,
}

/// The payload source gate 2 settled on.
#[derive(Debug)]
enum Payload {
    Staged(StagedFile),
    Inline { filename: String, data: String },
}

impl UploadRequest {
    /// Gate 2: require account, signature, and exactly one payload source.
    fn into_validated(self) -> Result<(String, String, Payload), UploadReject> {
        if self.account.is_empty() {
            return Err(UploadReject::InvalidParams("missing account name"));
        }
        if self.signature_hex.is_empty() {
            return Err(UploadReject::InvalidParams("missing signature"));
        }

        let payload = match (self.staged_file, self.filebase64) {
            (Some(staged), None) => Payload::Staged(staged),
            (Some(_), Some(_)) => {
                return Err(UploadReject::InvalidParams("conflicting upload sources"))
            }
            (None, Some(data)) => {
                let filename = self
                    .filename
                    .filter(|f| !f.is_empty())
                    .ok_or(UploadReject::InvalidParams("missing filename field"))?;
                Payload::Inline { filename, data }
            }
            (None, None) => {
                return Err(UploadReject::InvalidParams(if self.filename.is_some() {
                    "missing filebase64 field"
                } else {
                    "missing upload file"
                }))
            }
        };

        Ok((self.account, self.signature_hex, payload))
    }
}

/// Terminal rejection states of the pipeline, one per gate failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadReject {
    RateLimited,
    InvalidParams(&'static str),
    MalformedSignature,
    AccountNotFound,
    LedgerUnavailable,
    ReputationTooLow,
    UnsupportedKeyConfig,
    PayloadUnreadable,
    DataRateLimited,
    SignatureMismatch,
    StoreFailed,
}

impl std::fmt::Display for UploadReject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadReject::RateLimited => write!(f, "rate limited"),
            UploadReject::InvalidParams(what) => write!(f, "{}", what),
            UploadReject::MalformedSignature => write!(f, "cannot parse signature"),
            UploadReject::AccountNotFound => write!(f, "account not found"),
            UploadReject::LedgerUnavailable => write!(f, "account lookup failed"),
            UploadReject::ReputationTooLow => write!(f, "reputation too low"),
            UploadReject::UnsupportedKeyConfig => {
                write!(f, "unsupported posting key configuration")
            }
            UploadReject::PayloadUnreadable => write!(f, "upload failed"),
            UploadReject::DataRateLimited => write!(f, "rate limited (size)"),
            UploadReject::SignatureMismatch => write!(f, "signature did not verify"),
            UploadReject::StoreFailed => write!(f, "upload error"),
        }
    }
}

impl std::error::Error for UploadReject {}

/// Admission policy knobs, immutable for the process lifetime.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum normalized reputation admitted (boundary inclusive).
    pub min_reputation: i32,
    /// Accept the test signer key as an additional verifier. Testing only.
    pub allow_test_signer: bool,
    /// Base58 test signer public key, consulted only when the flag is set.
    pub test_signer_key: Option<String>,
}

/// The upload admission orchestrator.
pub struct UploadPipeline {
    resolver: Arc<dyn IdentityResolver>,
    store: ContentStore,
    request_limits: Arc<RateLimiter>,
    data_limits: Arc<RateLimiter>,
    audit: AuditLog,
    min_reputation: i32,
    test_signer: Option<ed25519_dalek::VerifyingKey>,
}

impl UploadPipeline {
    pub fn new(
        resolver: Arc<dyn IdentityResolver>,
        store: ContentStore,
        request_limits: Arc<RateLimiter>,
        data_limits: Arc<RateLimiter>,
        audit: AuditLog,
        config: PipelineConfig,
    ) -> crate::Result<Self> {
        let test_signer = if config.allow_test_signer {
            let encoded = config.test_signer_key.as_deref().ok_or_else(|| {
                PosternError::Config("test signer enabled without a test signer key".to_string())
            })?;
            let key = signature::parse_public_key(encoded)
                .map_err(|e| PosternError::Config(format!("invalid test signer key: {}", e)))?;
            warn!("Test signer key enabled - do not run this configuration in production");
            Some(key)
        } else {
            None
        };

        Ok(Self {
            resolver,
            store,
            request_limits,
            data_limits,
            audit,
            min_reputation: config.min_reputation,
            test_signer,
        })
    }

    /// Run a request through the gates.
    ///
    /// Consumes the request; a staged temp file is removed on every exit
    /// path, including rejections before the payload is ever read.
    pub async fn admit(&self, request: UploadRequest) -> Result<StoredObject, UploadReject> {
        // Gate 1: per-IP request rate
        if let Err(denied) = self.request_limits.check(&request.client_ip, 1.0).await {
            warn!(ip = %request.client_ip, window = %denied.window, "Request rate limited");
            self.audit.log_request_rate_limited(&request.client_ip).await;
            return Err(UploadReject::RateLimited);
        }

        // Gate 2: parameter presence
        let client_ip = request.client_ip.clone();
        let (account_name, signature_hex, payload) = request.into_validated()?;

        // Gate 3: signature parse
        let sig = match signature::parse_signature(&signature_hex) {
            Ok(sig) => sig,
            Err(e) => {
                debug!(account = %account_name, "Unparsable signature: {}", e);
                return Err(UploadReject::MalformedSignature);
            }
        };

        // Gate 4: account resolution, fresh per request
        let account = match self.resolver.resolve(&account_name).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                debug!(account = %account_name, "Account not found in ledger");
                return Err(UploadReject::AccountNotFound);
            }
            Err(e) => {
                warn!(account = %account_name, error = %e, "Ledger lookup failed");
                return Err(UploadReject::LedgerUnavailable);
            }
        };

        // Gate 5: reputation, boundary inclusive
        let score = normalize_reputation(account.reputation);
        if score < self.min_reputation {
            warn!(
                account = %account_name,
                score = score,
                minimum = self.min_reputation,
                "Reputation below upload threshold"
            );
            self.audit
                .log_reputation_block(&account_name, score, self.min_reputation)
                .await;
            return Err(UploadReject::ReputationTooLow);
        }

        // Gate 6: position-0 posting key must carry the full threshold
        let (key_str, weight) = match account.primary_posting_auth() {
            Some(auth) => auth.clone(),
            None => {
                warn!(account = %account_name, "Account has no posting key auths");
                self.audit.log_key_config_rejected(&account_name).await;
                return Err(UploadReject::UnsupportedKeyConfig);
            }
        };
        if weight < account.weight_threshold {
            warn!(
                account = %account_name,
                weight = weight,
                threshold = account.weight_threshold,
                "Primary posting key below weight threshold"
            );
            self.audit.log_key_config_rejected(&account_name).await;
            return Err(UploadReject::UnsupportedKeyConfig);
        }
        let posting_key = match signature::parse_public_key(&key_str) {
            Ok(key) => key,
            Err(e) => {
                warn!(account = %account_name, "Unparsable posting key: {}", e);
                self.audit.log_key_config_rejected(&account_name).await;
                return Err(UploadReject::UnsupportedKeyConfig);
            }
        };

        // Gate 7: payload extraction
        let (bytes, filename) = match payload {
            Payload::Staged(staged) => {
                let filename = staged.filename().to_string();
                match staged.read_and_discard().await {
                    Ok(bytes) => (bytes, filename),
                    Err(e) => {
                        warn!(account = %account_name, error = %e, "Failed to read staged upload");
                        return Err(UploadReject::PayloadUnreadable);
                    }
                }
            }
            Payload::Inline { filename, data } => match decode_base64(&data) {
                Ok(bytes) => (bytes, filename),
                Err(e) => {
                    debug!(account = %account_name, "Base64 payload rejected: {}", e);
                    return Err(UploadReject::PayloadUnreadable);
                }
            },
        };
        let filename = sanitize_filename(&filename);

        // Gate 8: per-account data volume
        let megabytes = bytes.len() as f64 / BYTES_PER_MEGABYTE;
        if let Err(denied) = self.data_limits.check(&account_name, megabytes).await {
            warn!(
                account = %account_name,
                megabytes = megabytes,
                window = %denied.window,
                "Data volume rate limited"
            );
            self.audit
                .log_data_rate_limited(&account_name, megabytes)
                .await;
            return Err(UploadReject::DataRateLimited);
        }

        // Gate 9: signature must cover the content digest
        let digest = Sha256::digest(&bytes);
        let mut verified = signature::verify(&sig, &digest, &posting_key);
        if !verified {
            if let Some(ref test_key) = self.test_signer {
                verified = signature::verify(&sig, &digest, test_key);
                if verified {
                    debug!(account = %account_name, "Signature accepted via test signer key");
                }
            }
        }
        if !verified {
            warn!(account = %account_name, ip = %client_ip, "Signature did not verify");
            self.audit.log_signature_rejected(&account_name).await;
            return Err(UploadReject::SignatureMismatch);
        }

        // Gate 10: content-addressed store write
        match self.store.put(&bytes, &filename).await {
            Ok(stored) => {
                info!(
                    account = %account_name,
                    address = %stored.address,
                    size = bytes.len(),
                    "Upload stored"
                );
                self.audit
                    .log_upload_stored(&account_name, &stored.address, bytes.len() as u64)
                    .await;
                Ok(stored)
            }
            Err(e) => {
                error!(account = %account_name, error = %e, "Object storage write failed");
                Err(UploadReject::StoreFailed)
            }
        }
    }
}

/// Decode base64 payload data (standard or URL-safe, padded or not)
fn decode_base64(input: &str) -> Result<Vec<u8>, String> {
    use base64::{engine::general_purpose, Engine as _};

    if let Ok(data) = general_purpose::STANDARD.decode(input) {
        return Ok(data);
    }
    if let Ok(data) = general_purpose::URL_SAFE.decode(input) {
        return Ok(data);
    }
    if let Ok(data) = general_purpose::STANDARD_NO_PAD.decode(input) {
        return Ok(data);
    }
    if let Ok(data) = general_purpose::URL_SAFE_NO_PAD.decode(input) {
        return Ok(data);
    }

    Err("Invalid base64 encoding".to_string())
}

/// Keep only the final path component of a client-supplied filename.
pub(crate) fn sanitize_filename(name: &str) -> String {
    let trimmed = name.rsplit(['/', '\\']).next().unwrap_or(name);
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose, Engine as _};

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\temp\\shot.png"), "shot.png");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("dir/"), "upload");
    }

    #[test]
    fn test_decode_base64_variants() {
        let data = b"Test";

        let encoded = general_purpose::STANDARD.encode(data);
        assert_eq!(decode_base64(&encoded).unwrap(), data);

        let encoded = general_purpose::URL_SAFE.encode(data);
        assert_eq!(decode_base64(&encoded).unwrap(), data);

        let encoded = general_purpose::STANDARD_NO_PAD.encode(data);
        assert_eq!(decode_base64(&encoded).unwrap(), data);

        assert!(decode_base64("not*base64*at*all").is_err());
    }

    #[tokio::test]
    async fn test_staged_file_read_and_discard_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged.part");
        std::fs::write(&path, b"payload").unwrap();

        let staged = StagedFile::new(path.clone(), "photo.jpg".to_string());
        let bytes = staged.read_and_discard().await.unwrap();

        assert_eq!(bytes, b"payload");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_staged_file_removed_even_when_read_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged.part");
        // A dangling symlink: reads fail, but the link itself is removable.
        std::os::unix::fs::symlink(dir.path().join("missing"), &path).unwrap();

        let staged = StagedFile::new(path.clone(), "photo.jpg".to_string());
        let result = staged.read_and_discard().await;

        assert!(result.is_err());
        assert!(std::fs::symlink_metadata(&path).is_err());
    }

    #[test]
    fn test_staged_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged.part");
        std::fs::write(&path, b"payload").unwrap();

        {
            let _staged = StagedFile::new(path.clone(), "photo.jpg".to_string());
        }

        assert!(!path.exists());
    }

    fn bare_request() -> UploadRequest {
        UploadRequest {
            account: "alice".to_string(),
            signature_hex: "ab".repeat(64),
            client_ip: "10.0.0.1".to_string(),
            staged_file: None,
            filename: None,
            filebase64: None,
        }
    }

    #[test]
    fn test_validation_requires_account_and_signature() {
        let mut request = bare_request();
        request.account = String::new();
        assert_eq!(
            request.into_validated().unwrap_err(),
            UploadReject::InvalidParams("missing account name")
        );

        let mut request = bare_request();
        request.signature_hex = String::new();
        assert_eq!(
            request.into_validated().unwrap_err(),
            UploadReject::InvalidParams("missing signature")
        );
    }

    #[test]
    fn test_validation_requires_exactly_one_payload_source() {
        // Nothing at all
        assert_eq!(
            bare_request().into_validated().unwrap_err(),
            UploadReject::InvalidParams("missing upload file")
        );

        // Inline payload without a filename
        let mut request = bare_request();
        request.filebase64 = Some("AAAA".to_string());
        assert_eq!(
            request.into_validated().unwrap_err(),
            UploadReject::InvalidParams("missing filename field")
        );

        // Filename without the data field
        let mut request = bare_request();
        request.filename = Some("photo.jpg".to_string());
        assert_eq!(
            request.into_validated().unwrap_err(),
            UploadReject::InvalidParams("missing filebase64 field")
        );

        // Complete inline payload passes
        let mut request = bare_request();
        request.filename = Some("photo.jpg".to_string());
        request.filebase64 = Some("AAAA".to_string());
        assert!(request.into_validated().is_ok());
    }

    #[test]
    fn test_validation_rejects_conflicting_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged.part");
        std::fs::write(&path, b"payload").unwrap();

        let mut request = bare_request();
        request.staged_file = Some(StagedFile::new(path.clone(), "a.jpg".to_string()));
        request.filebase64 = Some("AAAA".to_string());

        assert_eq!(
            request.into_validated().unwrap_err(),
            UploadReject::InvalidParams("conflicting upload sources")
        );
        // The rejected request dropped its staged file.
        assert!(!path.exists());
    }
}
