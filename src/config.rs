//! Configuration for Postern
//!
//! CLI arguments and environment variable handling using clap. Everything
//! is loaded once at startup and treated as immutable for the process
//! lifetime.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::ratelimit::RateWindow;
use crate::store::PublicUrl;

/// Postern - signed upload gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "postern")]
#[command(about = "Signed upload gateway with ledger-verified identity")]
pub struct Args {
    /// Unique node identifier for this gateway instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Ledger JSON-RPC endpoint for account lookups
    #[arg(long, env = "LEDGER_URL", default_value = "http://localhost:8090")]
    pub ledger_url: String,

    /// Object storage base URL
    #[arg(long, env = "STORAGE_URL", default_value = "http://localhost:9000")]
    pub storage_url: String,

    /// Object storage bucket for uploaded content
    #[arg(long, env = "STORAGE_BUCKET", default_value = "uploads")]
    pub storage_bucket: String,

    /// Scheme of public URLs returned for stored objects
    #[arg(long, env = "PUBLIC_SCHEME", default_value = "https")]
    pub public_scheme: String,

    /// Host of public URLs returned for stored objects
    #[arg(long, env = "PUBLIC_HOST", default_value = "localhost")]
    pub public_host: String,

    /// Port of public URLs returned for stored objects
    #[arg(long, env = "PUBLIC_PORT", default_value = "443")]
    pub public_port: u16,

    /// Minimum normalized reputation admitted to upload (boundary inclusive)
    #[arg(long, env = "MIN_REPUTATION", default_value = "25")]
    pub min_reputation: i32,

    /// Per-IP request quota windows, comma-separated `secs:max` pairs
    #[arg(
        long,
        env = "REQUEST_LIMITS",
        default_value = "60:10,3600:200,86400:1000"
    )]
    pub request_limits: String,

    /// Per-account upload-megabyte quota windows, comma-separated `secs:max` pairs
    #[arg(
        long,
        env = "DATA_LIMITS",
        default_value = "60:10,3600:100,86400:500,604800:2000"
    )]
    pub data_limits: String,

    /// Trust the first X-Forwarded-For entry from the fronting proxy
    #[arg(long, env = "TRUST_PROXY", default_value = "false")]
    pub trust_proxy: bool,

    /// Accept the test signer key as an additional verifier (testing only,
    /// never enable in production)
    #[arg(long, env = "ALLOW_TEST_SIGNER", default_value = "false")]
    pub allow_test_signer: bool,

    /// Base58 test signer public key, consulted only with --allow-test-signer
    #[arg(long, env = "TEST_SIGNER_KEY")]
    pub test_signer_key: Option<String>,

    /// Audit log path for JSONL policy-rejection events
    #[arg(long, env = "AUDIT_LOG")]
    pub audit_log: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Parsed per-IP request quota windows
    pub fn request_windows(&self) -> Result<Vec<RateWindow>, String> {
        parse_window_spec(&self.request_limits)
            .map_err(|e| format!("REQUEST_LIMITS: {}", e))
    }

    /// Parsed per-account data-volume quota windows
    pub fn data_windows(&self) -> Result<Vec<RateWindow>, String> {
        parse_window_spec(&self.data_limits).map_err(|e| format!("DATA_LIMITS: {}", e))
    }

    /// Public URL parts for stored objects
    pub fn public_url(&self) -> PublicUrl {
        PublicUrl {
            scheme: self.public_scheme.clone(),
            host: self.public_host.clone(),
            port: self.public_port,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        self.request_windows()?;
        self.data_windows()?;

        if self.allow_test_signer {
            match &self.test_signer_key {
                None => {
                    return Err(
                        "TEST_SIGNER_KEY is required when ALLOW_TEST_SIGNER is set".to_string()
                    )
                }
                Some(key) => {
                    crate::signature::parse_public_key(key)
                        .map_err(|e| format!("TEST_SIGNER_KEY: {}", e))?;
                }
            }
        }

        Ok(())
    }
}

/// Parse a quota window table: comma-separated `secs:max` pairs.
fn parse_window_spec(spec: &str) -> Result<Vec<RateWindow>, String> {
    let mut windows = Vec::new();

    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (secs, max) = part
            .split_once(':')
            .ok_or_else(|| format!("invalid window `{}` (expected secs:max)", part))?;
        let secs: u64 = secs
            .parse()
            .map_err(|_| format!("invalid window duration `{}`", secs))?;
        let max: f64 = max
            .parse()
            .map_err(|_| format!("invalid window max `{}`", max))?;
        if secs == 0 {
            return Err(format!("window duration must be positive in `{}`", part));
        }
        if max <= 0.0 {
            return Err(format!("window max must be positive in `{}`", part));
        }
        windows.push(RateWindow::new(Duration::from_secs(secs), max));
    }

    if windows.is_empty() {
        return Err("at least one window is required".to_string());
    }

    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_window_spec() {
        let windows = parse_window_spec("60:10,3600:200,86400:1000").unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0], RateWindow::new(Duration::from_secs(60), 10.0));
        assert_eq!(
            windows[2],
            RateWindow::new(Duration::from_secs(86400), 1000.0)
        );
    }

    #[test]
    fn test_parse_window_spec_tolerates_whitespace() {
        let windows = parse_window_spec(" 60:10 , 3600:200 ").unwrap();
        assert_eq!(windows.len(), 2);
    }

    #[test]
    fn test_parse_window_spec_fractional_max() {
        let windows = parse_window_spec("60:0.5").unwrap();
        assert_eq!(windows[0].max, 0.5);
    }

    #[test]
    fn test_parse_window_spec_rejects_garbage() {
        assert!(parse_window_spec("").is_err());
        assert!(parse_window_spec("60").is_err());
        assert!(parse_window_spec("sixty:10").is_err());
        assert!(parse_window_spec("60:lots").is_err());
        assert!(parse_window_spec("0:10").is_err());
        assert!(parse_window_spec("60:0").is_err());
    }
}
