//! Webhook signature verification.
//!
//! GitHub and the Gitea family sign the raw body with HMAC-SHA256 over
//! the repo's webhook secret; GitLab sends the shared secret verbatim in
//! a header. Both checks are constant-time. A failed check is fatal for
//! the request and must happen before any state is touched.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use cinch_core::error::{CinchError, Result};

use crate::crypto::digest_eq;

type HmacSha256 = Hmac<Sha256>;

/// Verify an HMAC-SHA256 signature over the raw request body.
///
/// `signature` is the hex digest from the header, with any `sha256=`
/// prefix already stripped by the caller.
pub fn verify_hmac_sha256(secret: &str, body: &[u8], signature: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(CinchError::Auth("repo has no webhook secret".to_string()));
    }

    let expected = hex::decode(signature.trim())
        .map_err(|_| CinchError::Auth("malformed webhook signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| CinchError::Internal("HMAC key setup failed".to_string()))?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| CinchError::Auth("webhook signature mismatch".to_string()))
}

/// Compare a shared-secret header against the repo's webhook secret.
pub fn verify_shared_secret(secret: &str, presented: &str) -> Result<()> {
    if secret.is_empty() {
        return Err(CinchError::Auth("repo has no webhook secret".to_string()));
    }
    if !digest_eq(secret, presented) {
        return Err(CinchError::Auth("webhook token mismatch".to_string()));
    }
    Ok(())
}

/// Sign a body the way the HMAC forges do. Test helper for adapters.
#[cfg(test)]
pub fn sign_hmac_sha256(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_signature() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let sig = sign_hmac_sha256("hook-secret", body);
        assert!(verify_hmac_sha256("hook-secret", body, &sig).is_ok());
    }

    #[test]
    fn test_mutated_body_rejected() {
        let body = br#"{"ref":"refs/heads/main"}"#;
        let sig = sign_hmac_sha256("hook-secret", body);
        let mutated = br#"{"ref":"refs/heads/evil"}"#;
        let err = verify_hmac_sha256("hook-secret", mutated, &sig).unwrap_err();
        assert!(matches!(err, CinchError::Auth(_)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"payload";
        let sig = sign_hmac_sha256("secret-a", body);
        assert!(verify_hmac_sha256("secret-b", body, &sig).is_err());
    }

    #[test]
    fn test_garbage_signature_rejected() {
        assert!(verify_hmac_sha256("secret", b"payload", "not-hex").is_err());
        assert!(verify_hmac_sha256("secret", b"payload", "").is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        let sig = sign_hmac_sha256("", b"payload");
        assert!(verify_hmac_sha256("", b"payload", &sig).is_err());
    }

    #[test]
    fn test_shared_secret() {
        assert!(verify_shared_secret("tok", "tok").is_ok());
        assert!(verify_shared_secret("tok", "other").is_err());
        assert!(verify_shared_secret("", "").is_err());
    }
}
