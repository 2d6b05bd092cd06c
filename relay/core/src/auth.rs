//! Caller Authentication
//!
//! Both transports authenticate with a signed bearer token. The verifier is a
//! seam ([`IdentityVerifier`]); [`SignedTokenVerifier`] is the built-in
//! implementation.
//!
//! # Token Format
//!
//! ```text
//! base64url(claims JSON) "." hex(sha256(secret "." payload))
//!
//! claims = { "sub": "<user id>", "role": "<role>", "exp": <unix seconds> }
//! ```
//!
//! Signatures are compared in constant time. Issuing tokens is out of scope
//! for the server; [`SignedTokenVerifier::issue`] exists for development and
//! tests.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::AuthError;

/// Verified caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// User id
    pub user_id: String,
    /// Role claim
    pub role: String,
}

/// Credential verification seam
pub trait IdentityVerifier: Send + Sync {
    /// Verify a bearer token
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] for missing, malformed, forged or expired tokens.
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default = "default_role")]
    role: String,
    exp: i64,
}

fn default_role() -> String {
    "user".to_string()
}

/// Longest lifetime [`SignedTokenVerifier::issue_for`] will sign
pub const MAX_TOKEN_TTL: std::time::Duration = std::time::Duration::from_secs(365 * 24 * 3600);

/// HMAC-style verifier over a shared secret
#[derive(Clone)]
pub struct SignedTokenVerifier {
    secret: Vec<u8>,
}

impl SignedTokenVerifier {
    /// Create a verifier for `secret`
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Mint a token valid for `ttl`
    #[must_use]
    pub fn issue(&self, user_id: &str, role: &str, ttl: chrono::Duration) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };
        // Serializing a struct of plain strings and integers cannot fail
        let json = serde_json::to_vec(&claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = self.sign(&payload);
        format!("{payload}.{signature}")
    }

    /// Mint a token valid for a std `ttl`, capped at [`MAX_TOKEN_TTL`]
    #[must_use]
    pub fn issue_for(&self, user_id: &str, role: &str, ttl: std::time::Duration) -> String {
        let ttl = ttl.min(MAX_TOKEN_TTL);
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
        self.issue(user_id, role, ttl)
    }

    fn sign(&self, payload: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(b".");
        hasher.update(payload.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for SignedTokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedTokenVerifier([REDACTED])")
    }
}

impl IdentityVerifier for SignedTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| AuthError::Invalid("expected payload.signature".to_string()))?;

        let expected = self.sign(payload);
        if !constant_time_compare(expected.as_bytes(), signature.as_bytes()) {
            return Err(AuthError::Invalid("signature mismatch".to_string()));
        }

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| AuthError::Invalid(format!("payload encoding: {e}")))?;
        let claims: Claims = serde_json::from_slice(&json)
            .map_err(|e| AuthError::Invalid(format!("claims: {e}")))?;

        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }

        Ok(Identity {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}

fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Extract the token from an `Authorization: Bearer …` value
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let verifier = SignedTokenVerifier::new("secret");
        let token = verifier.issue("alice", "admin", chrono::Duration::hours(1));
        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.role, "admin");
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = SignedTokenVerifier::new("a").issue("alice", "user", chrono::Duration::hours(1));
        assert!(matches!(
            SignedTokenVerifier::new("b").verify(&token),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let verifier = SignedTokenVerifier::new("secret");
        let token = verifier.issue("alice", "user", chrono::Duration::hours(1));
        let (_, signature) = token.split_once('.').unwrap();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"sub":"mallory","role":"admin","exp":9999999999}"#);
        assert!(verifier.verify(&format!("{forged}.{signature}")).is_err());
    }

    #[test]
    fn test_expired_token() {
        let verifier = SignedTokenVerifier::new("secret");
        let token = verifier.issue("alice", "user", chrono::Duration::seconds(-5));
        assert_eq!(verifier.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_missing_and_garbage() {
        let verifier = SignedTokenVerifier::new("secret");
        assert_eq!(verifier.verify(""), Err(AuthError::Missing));
        assert!(matches!(verifier.verify("garbage"), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer   abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer"), None);
    }

    #[test]
    fn test_debug_redacts_secret() {
        let verifier = SignedTokenVerifier::new("hunter2");
        assert!(!format!("{verifier:?}").contains("hunter2"));
    }
}
