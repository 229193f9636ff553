//! Audit logging for admission policy decisions
//!
//! Logs policy rejections (and successful stores) in JSONL format for
//! abuse monitoring. Client input errors are not audited; the interesting
//! signal is who keeps tripping quotas and failing signature checks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Per-IP request quota tripped
    RequestRateLimited,
    /// Per-account data-volume quota tripped
    DataRateLimited,
    /// Account reputation below the upload threshold
    ReputationBlocked,
    /// Account posting-key configuration unsupported
    KeyConfigRejected,
    /// Content signature did not verify
    SignatureRejected,
    /// Upload admitted and persisted
    UploadStored,
}

/// One admission decision worth keeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Event type
    pub event_type: AuditEventType,
    /// Gateway node that made the decision
    pub node_id: String,
    /// Account the decision applies to (if resolved)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// Caller IP (for IP-keyed decisions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// Configured threshold the actor was measured against
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// Observed value that was compared to the threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<f64>,
    /// Payload size in bytes (for stored uploads)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Content address (for stored uploads)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl AuditEvent {
    /// Create a new audit event
    pub fn new(event_type: AuditEventType, node_id: String) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            node_id,
            account: None,
            client_ip: None,
            threshold: None,
            observed: None,
            bytes: None,
            address: None,
        }
    }

    /// Set the account
    pub fn with_account(mut self, account: String) -> Self {
        self.account = Some(account);
        self
    }

    /// Set the caller IP
    pub fn with_ip(mut self, client_ip: String) -> Self {
        self.client_ip = Some(client_ip);
        self
    }

    /// Set the threshold and the observed value
    pub fn with_threshold(mut self, threshold: f64, observed: f64) -> Self {
        self.threshold = Some(threshold);
        self.observed = Some(observed);
        self
    }

    /// Set the observed value alone (no configured threshold applies)
    pub fn with_observed(mut self, observed: f64) -> Self {
        self.observed = Some(observed);
        self
    }

    /// Set the payload size
    pub fn with_bytes(mut self, bytes: u64) -> Self {
        self.bytes = Some(bytes);
        self
    }

    /// Set the content address
    pub fn with_address(mut self, address: String) -> Self {
        self.address = Some(address);
        self
    }

    /// Convert to JSONL line
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Audit logger that writes events to a JSONL file
#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<Mutex<AuditLogInner>>,
    node_id: String,
}

struct AuditLogInner {
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Create a new audit logger. Events are dropped until a file is
    /// attached with [`init_file`](Self::init_file).
    pub fn new(node_id: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AuditLogInner {
                writer: None,
                path: None,
            })),
            node_id,
        }
    }

    /// Initialize file logging to the specified path
    pub async fn init_file(&self, path: PathBuf) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = BufWriter::new(file);

        let mut inner = self.inner.lock().await;
        inner.writer = Some(writer);
        inner.path = Some(path.clone());

        info!("Audit logging initialized to {}", path.display());
        Ok(())
    }

    /// Log an audit event
    pub async fn log(&self, event: AuditEvent) {
        let jsonl = match event.to_jsonl() {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        let mut inner = self.inner.lock().await;

        if let Some(ref mut writer) = inner.writer {
            if let Err(e) = writeln!(writer, "{}", jsonl) {
                error!("Failed to write audit event: {}", e);
            }
            if let Err(e) = writer.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        }
    }

    /// Log a tripped per-IP request quota
    pub async fn log_request_rate_limited(&self, client_ip: &str) {
        let event = AuditEvent::new(AuditEventType::RequestRateLimited, self.node_id.clone())
            .with_ip(client_ip.to_string());
        self.log(event).await;
    }

    /// Log a tripped per-account data-volume quota
    pub async fn log_data_rate_limited(&self, account: &str, megabytes: f64) {
        let event = AuditEvent::new(AuditEventType::DataRateLimited, self.node_id.clone())
            .with_account(account.to_string())
            .with_observed(megabytes);
        self.log(event).await;
    }

    /// Log a reputation block with the actor and the threshold
    pub async fn log_reputation_block(&self, account: &str, score: i32, minimum: i32) {
        let event = AuditEvent::new(AuditEventType::ReputationBlocked, self.node_id.clone())
            .with_account(account.to_string())
            .with_threshold(minimum as f64, score as f64);
        self.log(event).await;
    }

    /// Log an unsupported posting-key configuration
    pub async fn log_key_config_rejected(&self, account: &str) {
        let event = AuditEvent::new(AuditEventType::KeyConfigRejected, self.node_id.clone())
            .with_account(account.to_string());
        self.log(event).await;
    }

    /// Log a failed signature verification
    pub async fn log_signature_rejected(&self, account: &str) {
        let event = AuditEvent::new(AuditEventType::SignatureRejected, self.node_id.clone())
            .with_account(account.to_string());
        self.log(event).await;
    }

    /// Log an admitted and persisted upload
    pub async fn log_upload_stored(&self, account: &str, address: &str, bytes: u64) {
        let event = AuditEvent::new(AuditEventType::UploadStored, self.node_id.clone())
            .with_account(account.to_string())
            .with_address(address.to_string())
            .with_bytes(bytes);
        self.log(event).await;
    }

    /// Get the node ID
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = AuditEvent::new(
            AuditEventType::ReputationBlocked,
            "node-1".to_string(),
        )
        .with_account("mallory".to_string())
        .with_threshold(25.0, 12.0);

        let jsonl = event.to_jsonl().unwrap();
        assert!(jsonl.contains("reputation_blocked"));
        assert!(jsonl.contains("mallory"));
        assert!(jsonl.contains("25"));
    }

    #[test]
    fn test_unset_fields_are_omitted() {
        let event = AuditEvent::new(
            AuditEventType::RequestRateLimited,
            "node-1".to_string(),
        )
        .with_ip("10.0.0.1".to_string());

        let jsonl = event.to_jsonl().unwrap();
        assert!(jsonl.contains("request_rate_limited"));
        assert!(jsonl.contains("10.0.0.1"));
        assert!(!jsonl.contains("account"));
        assert!(!jsonl.contains("address"));
    }

    #[tokio::test]
    async fn test_events_append_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let log = AuditLog::new("node-1".to_string());
        log.init_file(path.clone()).await.unwrap();
        log.log_signature_rejected("mallory").await;
        log.log_upload_stored("alice", "abc123", 42).await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("signature_rejected"));
        assert!(lines[1].contains("upload_stored"));
    }
}
