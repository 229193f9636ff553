//! Signature parsing and verification
//!
//! Uploads are signed over the SHA-256 digest of their content with the
//! account's posting key (Ed25519). Signatures travel hex-encoded in the
//! URL path; public keys travel base58-encoded in ledger account records.
//!
//! Parsing is total: malformed input comes back as a typed error, never a
//! panic, so the pipeline can answer with a client error.

use ed25519_dalek::{Signature, VerifyingKey};

/// Ed25519 signature length in bytes
pub const SIGNATURE_LEN: usize = 64;

/// Ed25519 public key length in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

/// Errors from signature or key parsing
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("Invalid signature hex: {0}")]
    InvalidHex(String),

    #[error("Invalid signature length: expected {SIGNATURE_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("Invalid public key: {0}")]
    InvalidKey(String),
}

/// Parse a hex-encoded Ed25519 signature.
pub fn parse_signature(hex_str: &str) -> Result<Signature, SignatureError> {
    let bytes = hex::decode(hex_str).map_err(|e| SignatureError::InvalidHex(e.to_string()))?;
    let arr: [u8; SIGNATURE_LEN] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidLength(bytes.len()))?;
    Ok(Signature::from_bytes(&arr))
}

/// Parse a base58-encoded Ed25519 public key.
pub fn parse_public_key(encoded: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    let arr: [u8; PUBLIC_KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
        SignatureError::InvalidKey(format!(
            "expected {} bytes, got {}",
            PUBLIC_KEY_LEN,
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&arr).map_err(|e| SignatureError::InvalidKey(e.to_string()))
}

/// Encode a public key the way the ledger stores it.
pub fn encode_public_key(key: &VerifyingKey) -> String {
    bs58::encode(key.as_bytes()).into_string()
}

/// Verify `signature` over a content digest with `key`.
///
/// Pure check, no side effects.
pub fn verify(signature: &Signature, digest: &[u8], key: &VerifyingKey) -> bool {
    key.verify_strict(digest, signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use sha2::{Digest, Sha256};

    fn test_keypair(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let signing = test_keypair(7);
        let digest = Sha256::digest(b"payload bytes");
        let signature = signing.sign(&digest);

        let hex_sig = hex::encode(signature.to_bytes());
        let parsed = parse_signature(&hex_sig).unwrap();

        assert!(verify(&parsed, &digest, &signing.verifying_key()));
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let signing = test_keypair(7);
        let other = test_keypair(8);
        let digest = Sha256::digest(b"payload bytes");
        let signature = signing.sign(&digest);

        assert!(!verify(&signature, &digest, &other.verifying_key()));
    }

    #[test]
    fn test_wrong_digest_fails_verification() {
        let signing = test_keypair(7);
        let signature = signing.sign(&Sha256::digest(b"payload bytes"));
        let other_digest = Sha256::digest(b"different bytes");

        assert!(!verify(&signature, &other_digest, &signing.verifying_key()));
    }

    #[test]
    fn test_parse_signature_rejects_malformed_hex() {
        assert!(matches!(
            parse_signature("zz not hex"),
            Err(SignatureError::InvalidHex(_))
        ));
        assert!(matches!(
            parse_signature("abcd"),
            Err(SignatureError::InvalidLength(2))
        ));
        assert!(parse_signature("").is_err());
    }

    #[test]
    fn test_parse_public_key_roundtrip() {
        let key = test_keypair(9).verifying_key();
        let encoded = encode_public_key(&key);
        let parsed = parse_public_key(&encoded).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_parse_public_key_rejects_malformed_input() {
        // 0, O, I, l are outside the base58 alphabet
        assert!(parse_public_key("0OIl").is_err());
        // Valid base58 but wrong length
        assert!(parse_public_key("3mJr7A").is_err());
        assert!(parse_public_key("").is_err());
    }
}
