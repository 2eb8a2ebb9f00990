//! HMAC-SHA256 signed compact tokens.
//!
//! Format: `base64url(header).base64url(claims).base64url(signature)` where the
//! signature covers the first two segments. Used to identify the calling user.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Access tokens live 15 minutes
pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;

/// Refresh tokens live 7 days
pub const REFRESH_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

/// Token purpose
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Claims carried by a token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub typ: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

/// Token verification errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Not three dot-separated segments, or undecodable segments
    InvalidFormat,
    /// Signature does not match
    InvalidSignature,
    /// Token kind differs from the one expected
    WrongKind,
    /// `exp` is in the past
    Expired,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::InvalidFormat => write!(f, "Invalid token format"),
            TokenError::InvalidSignature => write!(f, "Invalid token signature"),
            TokenError::WrongKind => write!(f, "Invalid token type"),
            TokenError::Expired => write!(f, "Token expired"),
        }
    }
}

impl std::error::Error for TokenError {}

/// Issues and verifies compact tokens with a process-wide secret.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issues a token for `user_id` valid for the default lifetime of `kind`.
    pub fn issue(&self, user_id: &str, kind: TokenKind) -> String {
        let ttl = match kind {
            TokenKind::Access => ACCESS_TOKEN_TTL_SECONDS,
            TokenKind::Refresh => REFRESH_TOKEN_TTL_SECONDS,
        };
        self.issue_with_ttl(user_id, kind, Duration::seconds(ttl))
    }

    pub fn issue_with_ttl(&self, user_id: &str, kind: TokenKind, ttl: Duration) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            typ: kind,
            iat: now,
            exp: now + ttl.num_seconds(),
        };
        let header = Header {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        };

        // Serializing plain structs of strings and integers cannot fail
        let header_json = serde_json::to_vec(&header).unwrap_or_default();
        let claims_json = serde_json::to_vec(&claims).unwrap_or_default();

        let signing_input = format!("{}.{}", B64URL.encode(header_json), B64URL.encode(claims_json));
        let signature = B64URL.encode(self.sign(signing_input.as_bytes()));

        format!("{}.{}", signing_input, signature)
    }

    /// Verifies signature, kind and expiry, returning the claims.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let (header, claims, signature) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(c), Some(s), None) if !h.is_empty() && !c.is_empty() && !s.is_empty() => {
                (h, c, s)
            }
            _ => return Err(TokenError::InvalidFormat),
        };

        let signature = B64URL
            .decode(signature)
            .map_err(|_| TokenError::InvalidFormat)?;

        let mut mac = self.mac();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(claims.as_bytes());
        // Constant-time comparison
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims_json = B64URL
            .decode(claims)
            .map_err(|_| TokenError::InvalidFormat)?;
        let claims: Claims =
            serde_json::from_slice(&claims_json).map_err(|_| TokenError::InvalidFormat)?;

        if claims.typ != expected {
            return Err(TokenError::WrongKind);
        }

        if claims.exp < Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length
        match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
        }
    }

    fn sign(&self, input: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(input);
        mac.finalize().into_bytes().to_vec()
    }
}
