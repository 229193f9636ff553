//! Ledger account lookup
//!
//! Resolves an account name to its posting-key authorizations, weight
//! threshold, and raw reputation via the ledger's JSON-RPC account API.
//! Lookups are never cached: key authorizations and reputation can change
//! between uploads, and a stale snapshot would let a rotated-out key keep
//! signing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// A posting-key authorization: base58 public key and its weight.
pub type KeyAuth = (String, u32);

/// Immutable account snapshot, fetched fresh per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub name: String,
    /// Ordered posting-key authorizations. Position 0 is authoritative.
    pub posting_key_auths: Vec<KeyAuth>,
    pub weight_threshold: u32,
    /// Raw ledger reputation; see [`normalize_reputation`].
    pub reputation: i64,
}

impl Account {
    /// First posting-key authorization. Only single-key accounts are
    /// supported; entries past position 0 are never consulted.
    pub fn primary_posting_auth(&self) -> Option<&KeyAuth> {
        self.posting_key_auths.first()
    }
}

/// Errors from ledger resolution
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger RPC failed: {0}")]
    Rpc(String),

    #[error("Malformed ledger response: {0}")]
    Malformed(String),
}

/// Account lookup against the ledger.
///
/// One method, typed optional result: the pipeline never sees the RPC
/// transport, only Found/NotFound/failed.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<Option<Account>, LedgerError>;
}

/// Normalize raw ledger reputation to the familiar log10 scale.
///
/// `sign(raw) * max(log10(|raw|) - 9, 0) * 9 + 25`, truncated toward zero.
/// Fresh accounts (raw near zero) land on 25.
pub fn normalize_reputation(raw: i64) -> i32 {
    if raw == 0 {
        return 25;
    }
    let mut scaled = ((raw.abs() as f64).log10() - 9.0).max(0.0);
    if raw < 0 {
        scaled = -scaled;
    }
    (scaled * 9.0 + 25.0) as i32
}

/// JSON-RPC client for the ledger's account-lookup API.
pub struct LedgerClient {
    url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Vec<AccountRow>>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct AccountRow {
    name: String,
    posting: PostingAuthority,
    #[serde(default)]
    reputation: RawReputation,
}

#[derive(Deserialize)]
struct PostingAuthority {
    weight_threshold: u32,
    key_auths: Vec<KeyAuth>,
}

/// Some ledger nodes report reputation as a bare integer, others as a
/// decimal string.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawReputation {
    Number(i64),
    Text(String),
}

impl Default for RawReputation {
    fn default() -> Self {
        Self::Number(0)
    }
}

impl RawReputation {
    fn value(&self) -> i64 {
        match self {
            Self::Number(n) => *n,
            Self::Text(s) => s.parse().unwrap_or(0),
        }
    }
}

impl LedgerClient {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl IdentityResolver for LedgerClient {
    async fn resolve(&self, name: &str) -> Result<Option<Account>, LedgerError> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "ledger_api.get_accounts",
            "params": [[name]],
        });

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::Rpc(format!("HTTP {}", response.status())));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Malformed(e.to_string()))?;

        if let Some(rpc_error) = body.error {
            return Err(LedgerError::Rpc(rpc_error.to_string()));
        }

        let row = match body.result.and_then(|rows| rows.into_iter().next()) {
            Some(row) => row,
            None => {
                debug!(account = %name, "Ledger returned no account");
                return Ok(None);
            }
        };

        Ok(Some(Account {
            name: row.name,
            posting_key_auths: row.posting.key_auths,
            weight_threshold: row.posting.weight_threshold,
            reputation: row.reputation.value(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_reputation_zero_is_baseline() {
        assert_eq!(normalize_reputation(0), 25);
    }

    #[test]
    fn test_normalize_reputation_small_positive_stays_baseline() {
        // Anything below 10^9 clamps to the baseline.
        assert_eq!(normalize_reputation(1), 25);
        assert_eq!(normalize_reputation(999_999_999), 25);
        assert_eq!(normalize_reputation(1_000_000_000), 25);
    }

    #[test]
    fn test_normalize_reputation_log_scale() {
        // log10(10^10) - 9 = 1, * 9 + 25 = 34
        assert_eq!(normalize_reputation(10_000_000_000), 34);
        // log10(10^12) - 9 = 3, * 9 + 25 = 52
        assert_eq!(normalize_reputation(1_000_000_000_000), 52);
    }

    #[test]
    fn test_normalize_reputation_negative() {
        assert_eq!(normalize_reputation(-10_000_000_000), 16);
        assert_eq!(normalize_reputation(-1), 25);
    }

    #[test]
    fn test_primary_posting_auth_is_position_zero() {
        let account = Account {
            name: "alice".to_string(),
            posting_key_auths: vec![
                ("KEY_A".to_string(), 1),
                ("KEY_B".to_string(), 2),
            ],
            weight_threshold: 1,
            reputation: 0,
        };
        assert_eq!(
            account.primary_posting_auth(),
            Some(&("KEY_A".to_string(), 1))
        );
    }

    #[test]
    fn test_account_row_parses_numeric_and_string_reputation() {
        let numeric: AccountRow = serde_json::from_value(json!({
            "name": "alice",
            "posting": { "weight_threshold": 1, "key_auths": [["KEY", 1]] },
            "reputation": 12345
        }))
        .unwrap();
        assert_eq!(numeric.reputation.value(), 12345);

        let text: AccountRow = serde_json::from_value(json!({
            "name": "alice",
            "posting": { "weight_threshold": 1, "key_auths": [["KEY", 1]] },
            "reputation": "67890"
        }))
        .unwrap();
        assert_eq!(text.reputation.value(), 67890);
    }

    #[test]
    fn test_account_row_defaults_missing_reputation() {
        let row: AccountRow = serde_json::from_value(json!({
            "name": "bob",
            "posting": { "weight_threshold": 1, "key_auths": [] }
        }))
        .unwrap();
        assert_eq!(row.reputation.value(), 0);
    }
}
