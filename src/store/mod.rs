//! Content-addressed object storage
//!
//! Uploads are persisted under their SHA-256 digest: identical bytes always
//! map to the same object key, so re-uploading the same content overwrites
//! the same object (last writer wins, idempotent). The object-storage
//! backend is a single-method collaborator behind the [`ObjectStore`]
//! trait; a write either fully succeeds or the request fails with no
//! partial object left visible.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Compute the content address: SHA-256 of the payload, hex-encoded.
pub fn content_address(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Errors from object storage
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage write failed: {0}")]
    Write(String),

    #[error("Storage rejected object: HTTP {0}")]
    Status(u16),
}

/// Single-shot object write. No read, list, or delete operations; the
/// gateway only ever puts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// Object storage over HTTP PUT to `{base_url}/{bucket}/{key}`.
pub struct HttpObjectStore {
    base_url: String,
    bucket: String,
    http: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.into(),
            bucket: bucket.into(),
            http,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put_object(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let url = format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.bucket,
            key
        );

        let response = self
            .http
            .put(&url)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| StoreError::Write(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Status(response.status().as_u16()));
        }

        Ok(())
    }
}

/// Public URL parts for stored objects.
#[derive(Debug, Clone)]
pub struct PublicUrl {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl PublicUrl {
    /// Deterministic object URL: `scheme://host:port/address/filename`.
    pub fn object_url(&self, address: &str, filename: &str) -> String {
        format!(
            "{}://{}:{}/{}/{}",
            self.scheme, self.host, self.port, address, filename
        )
    }
}

/// A successfully stored upload.
#[derive(Debug, Clone, Serialize)]
pub struct StoredObject {
    pub address: String,
    pub url: String,
}

/// Content-addressed store: hash, persist, derive the public URL.
pub struct ContentStore {
    store: Arc<dyn ObjectStore>,
    public_url: PublicUrl,
}

impl ContentStore {
    pub fn new(store: Arc<dyn ObjectStore>, public_url: PublicUrl) -> Self {
        Self { store, public_url }
    }

    /// Persist `bytes` under its content address.
    pub async fn put(&self, bytes: &[u8], filename: &str) -> Result<StoredObject, StoreError> {
        let address = content_address(bytes);
        self.store.put_object(&address, bytes).await?;

        debug!(address = %address, size = bytes.len(), "Object stored");

        Ok(StoredObject {
            url: self.public_url.object_url(&address, filename),
            address,
        })
    }
}
