//! Caller identity for OAuth routes.
//!
//! With a token secret configured, the user comes from the `sub` claim of an
//! `Authorization: Bearer` token and a `userId` parameter may only repeat it.
//! Without one, the `userId` parameter is trusted as is.

use super::AppError;
use crate::crypto::{TokenKind, TokenSigner};
use axum::http::HeaderMap;

/// Bearer header extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum BearerError {
    /// Authorization header not present
    Missing,
    /// Not "Bearer <token>" or not valid header text
    InvalidFormat,
    /// Token is empty string
    Empty,
}

impl std::fmt::Display for BearerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BearerError::Missing => write!(f, "Missing Authorization header"),
            BearerError::InvalidFormat => write!(f, "Invalid Authorization header format"),
            BearerError::Empty => write!(f, "Empty bearer token"),
        }
    }
}

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, BearerError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(BearerError::Missing)?
        .to_str()
        .map_err(|_| BearerError::InvalidFormat)?;

    let (scheme, token) = auth_header
        .split_once(' ')
        .ok_or(BearerError::InvalidFormat)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(BearerError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(BearerError::Empty);
    }

    Ok(token.to_string())
}

/// Resolves the acting user for a request.
///
/// # Arguments
/// * `headers` - Request headers (for the bearer token)
/// * `claimed` - `userId` from query or body, if any
/// * `signer` - Token verifier; `None` trusts `claimed`
///
/// # Errors
/// - BadRequest: no signer and no `userId`
/// - Unauthorized: missing, malformed, forged or expired token
/// - Forbidden: `userId` names someone other than the token subject
pub fn resolve_user(
    headers: &HeaderMap,
    claimed: Option<&str>,
    signer: Option<&TokenSigner>,
) -> Result<String, AppError> {
    let claimed = claimed.map(str::trim).filter(|u| !u.is_empty());

    let Some(signer) = signer else {
        return claimed
            .map(str::to_string)
            .ok_or_else(|| AppError::BadRequest("userId is required".to_string()));
    };

    let token = extract_bearer_token(headers)
        .map_err(|e| AppError::Unauthorized(e.to_string()))?;
    let claims = signer
        .verify(&token, TokenKind::Access)
        .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;

    match claimed {
        Some(user) if user != claims.sub => {
            tracing::warn!(
                subject = %claims.sub,
                claimed = %user,
                "userId does not match token subject"
            );
            Err(AppError::Forbidden(
                "userId does not match the authenticated user".to_string(),
            ))
        }
        _ => Ok(claims.sub),
    }
}
