//! At-rest encryption and worker-token hashing.
//!
//! Sensitive columns (webhook secrets, forge tokens, repo secret values)
//! are wrapped with AES-256-GCM under a single master key. Values written
//! before encryption was enabled are returned as-is on read and re-wrapped
//! on the next write.
//!
//! Worker credentials are random bearer tokens; only a salted SHA3-256
//! digest is persisted.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::RngCore;
use sha3::{Digest, Sha3_256};

use cinch_core::error::{CinchError, Result};
use cinch_core::model::TokenId;

/// Prefix marking a ciphertext column value.
const CIPHERTEXT_PREFIX: &str = "enc:v1:";

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// Per-token salt length in bytes.
const SALT_LEN: usize = 16;

/// Wraps and unwraps sensitive column values.
#[derive(Clone)]
pub struct SecretCipher {
    key: Option<[u8; 32]>,
}

impl SecretCipher {
    /// Build from a hex-encoded 32-byte master key.
    pub fn from_hex_key(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| CinchError::Config(format!("invalid master key hex: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CinchError::Config("master key must be 32 bytes".to_string()))?;
        Ok(Self { key: Some(key) })
    }

    /// A cipher that stores plaintext. Only for tests and migrations
    /// tooling; the server refuses to start without a key unless
    /// explicitly configured.
    pub fn disabled() -> Self {
        Self { key: None }
    }

    /// Whether encryption is active.
    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Encrypt a value for storage.
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        let Some(key) = &self.key else {
            return Ok(plaintext.to_string());
        };

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CinchError::Internal("encryption failed".to_string()))?;

        Ok(format!(
            "{}{}:{}",
            CIPHERTEXT_PREFIX,
            hex::encode(nonce_bytes),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypt a stored value. Legacy plaintext (no prefix) is passed
    /// through unchanged so pre-encryption rows keep working.
    pub fn open(&self, stored: &str) -> Result<String> {
        let Some(rest) = stored.strip_prefix(CIPHERTEXT_PREFIX) else {
            return Ok(stored.to_string());
        };

        let Some(key) = &self.key else {
            return Err(CinchError::Config(
                "encrypted value present but no master key configured".to_string(),
            ));
        };

        let (nonce_hex, ct_hex) = rest
            .split_once(':')
            .ok_or_else(|| CinchError::Internal("malformed ciphertext".to_string()))?;
        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|_| CinchError::Internal("malformed ciphertext nonce".to_string()))?;
        let ciphertext = hex::decode(ct_hex)
            .map_err(|_| CinchError::Internal("malformed ciphertext body".to_string()))?;

        if nonce_bytes.len() != NONCE_LEN {
            return Err(CinchError::Internal("malformed ciphertext nonce".to_string()));
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| CinchError::Internal("decryption failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CinchError::Internal("decrypted value is not UTF-8".to_string()))
    }

    /// Whether a stored value still needs wrapping.
    pub fn is_legacy_plaintext(&self, stored: &str) -> bool {
        self.key.is_some() && !stored.is_empty() && !stored.starts_with(CIPHERTEXT_PREFIX)
    }
}

/// A freshly issued worker credential. The plaintext leaves the process
/// exactly once, in the issuance response.
pub struct IssuedToken {
    pub id: TokenId,
    pub plaintext: String,
    pub salt_hex: String,
    pub hash_hex: String,
}

/// Issue a new worker token. The plaintext embeds the token id so
/// authentication can look up the row before hashing.
pub fn issue_token() -> IssuedToken {
    let id = TokenId::new();

    let mut secret = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut secret);
    let plaintext = format!("cinch_{}_{}", id.as_uuid().simple(), hex::encode(secret));

    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let salt_hex = hex::encode(salt);
    let hash_hex = hash_token(&plaintext, &salt_hex);

    IssuedToken {
        id,
        plaintext,
        salt_hex,
        hash_hex,
    }
}

/// Extract the token id embedded in a presented credential.
pub fn token_id_of(plaintext: &str) -> Option<TokenId> {
    let rest = plaintext.strip_prefix("cinch_")?;
    let (id_part, _secret) = rest.split_once('_')?;
    let uuid = uuid::Uuid::parse_str(id_part).ok()?;
    Some(TokenId::from_uuid(uuid))
}

/// Salted SHA3-256 digest of a credential, hex-encoded.
pub fn hash_token(plaintext: &str, salt_hex: &str) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(salt_hex.as_bytes());
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time equality over two hex digests.
pub fn digest_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher() -> SecretCipher {
        SecretCipher::from_hex_key(&hex::encode([7u8; 32])).unwrap()
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = test_cipher();
        let sealed = cipher.seal("hook-secret").unwrap();
        assert!(sealed.starts_with("enc:v1:"));
        assert_eq!(cipher.open(&sealed).unwrap(), "hook-secret");
    }

    #[test]
    fn test_seal_is_randomized() {
        let cipher = test_cipher();
        let a = cipher.seal("same").unwrap();
        let b = cipher.seal("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_legacy_plaintext_passthrough() {
        let cipher = test_cipher();
        assert_eq!(cipher.open("old-plain-secret").unwrap(), "old-plain-secret");
        assert!(cipher.is_legacy_plaintext("old-plain-secret"));
        let sealed = cipher.seal("x").unwrap();
        assert!(!cipher.is_legacy_plaintext(&sealed));
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = test_cipher().seal("secret").unwrap();
        let other = SecretCipher::from_hex_key(&hex::encode([9u8; 32])).unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_bad_master_key_rejected() {
        assert!(SecretCipher::from_hex_key("not-hex").is_err());
        assert!(SecretCipher::from_hex_key("abcd").is_err());
    }

    #[test]
    fn test_issue_and_verify_token() {
        let issued = issue_token();
        assert!(issued.plaintext.starts_with("cinch_"));
        assert_eq!(token_id_of(&issued.plaintext), Some(issued.id));
        assert_eq!(
            hash_token(&issued.plaintext, &issued.salt_hex),
            issued.hash_hex
        );
    }

    #[test]
    fn test_wrong_secret_digest_differs() {
        let issued = issue_token();
        let forged = format!("cinch_{}_{}", issued.id.as_uuid().simple(), "00".repeat(24));
        assert_ne!(hash_token(&forged, &issued.salt_hex), issued.hash_hex);
    }

    #[test]
    fn test_digest_eq() {
        assert!(digest_eq("abcd", "abcd"));
        assert!(!digest_eq("abcd", "abce"));
        assert!(!digest_eq("abcd", "abc"));
    }
}
