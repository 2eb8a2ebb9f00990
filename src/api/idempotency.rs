//! Idempotency layer for mutating requests.
//!
//! Every POST, PUT, PATCH and DELETE must carry an `Idempotency-Key` header.
//! The key is bound to a fingerprint (SHA-256 over method, path with query,
//! and body) in a cache record at `idempotency:{key}`:
//!
//! ```text
//! absent --create--> in-progress --2xx--> done (replayed until TTL)
//!                         |
//!                         +--non-2xx--> absent (record deleted)
//! ```
//!
//! - `done`, same fingerprint: replay the stored status and body with
//!   `X-Idempotent-Replay: true`; the handler does not run
//! - any state, other fingerprint: 409 `different_request_body`
//! - `in-progress`, same fingerprint: 409 `already_in_progress`
//!
//! Record creation is the cache's atomic create-if-absent, so two racing
//! requests cannot both start. If the cache is unreachable the request passes
//! through without deduplication.

use super::{AppError, ConflictReason};
use crate::cache::{keys, TransientCache};
use crate::redact;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Request header carrying the client key
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Response header set on replayed responses
pub const REPLAY_HEADER: &str = "x-idempotent-replay";

/// Longest accepted key
const MAX_KEY_LENGTH: usize = 255;

/// Create attempts when a record vanishes between create and read
const MAX_CREATE_ATTEMPTS: usize = 3;

const STATUS_IN_PROGRESS: &str = "in-progress";
const STATUS_DONE: &str = "done";

/// Shared state for the idempotency layer
#[derive(Clone)]
pub struct IdempotencyState {
    pub cache: Arc<dyn TransientCache>,
    pub ttl_seconds: u64,
    pub max_body_bytes: usize,
}

/// Response captured from a completed request
#[derive(Debug, Clone, PartialEq)]
struct StoredResponse {
    status: StatusCode,
    content_type: Option<String>,
    body: String,
}

impl StoredResponse {
    fn into_replay(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        let headers = response.headers_mut();
        headers.remove(header::CONTENT_TYPE);
        if let Some(ct) = self.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
            headers.insert(header::CONTENT_TYPE, ct);
        }
        headers.insert(REPLAY_HEADER, HeaderValue::from_static("true"));
        response
    }
}

/// Outcome of looking up a key
#[derive(Debug, PartialEq)]
enum Decision {
    /// Record created, this request owns the key
    Proceed,
    Replay(StoredResponse),
    Conflict(ConflictReason),
    /// Cache failed, run without deduplication
    PassThrough,
}

/// True for methods that change server state.
pub fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// SHA-256 over `METHOD|path?query|body`, hex encoded.
pub fn fingerprint(method: &Method, path_and_query: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(path_and_query.as_bytes());
    hasher.update(b"|");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Idempotency middleware, for `axum::middleware::from_fn_with_state`.
pub async fn idempotency_layer(
    State(state): State<Arc<IdempotencyState>>,
    request: Request,
    next: Next,
) -> Response {
    if !is_mutating(request.method()) {
        return next.run(request).await;
    }

    let key = match idempotency_key(&request) {
        Ok(key) => key,
        Err(e) => return e.into_response(),
    };

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!(idempotency_key = %key, "Request body too large or unreadable");
            return AppError::PayloadTooLarge(format!(
                "Request body exceeds {} bytes",
                state.max_body_bytes
            ))
            .into_response();
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let fp = fingerprint(&parts.method, path_and_query, &bytes);
    let record_key = keys::idempotency(&key);

    debug!(
        idempotency_key = %key,
        fingerprint = %&fp[..8],
        method = %parts.method,
        body = %redact::mask_body(&bytes),
        "Idempotent request received"
    );

    let request = Request::from_parts(parts, Body::from(bytes));

    match begin(state.as_ref(), &record_key, &fp).await {
        Decision::Proceed => {}
        Decision::Replay(stored) => {
            info!(idempotency_key = %key, status = %stored.status, "Replaying stored response");
            return stored.into_replay();
        }
        Decision::Conflict(reason) => {
            warn!(
                idempotency_key = %key,
                fingerprint = %&fp[..8],
                reason = reason.as_str(),
                "Idempotency conflict"
            );
            return AppError::Conflict(reason).into_response();
        }
        Decision::PassThrough => return next.run(request).await,
    }

    let response = next.run(request).await;
    complete(state.as_ref(), &key, &record_key, response).await
}

fn idempotency_key(request: &Request) -> Result<String, AppError> {
    let value = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .ok_or_else(|| {
            AppError::BadRequest("Idempotency-Key header is required for this operation".to_string())
        })?
        .to_str()
        .map_err(|_| AppError::BadRequest("Idempotency-Key header is not valid text".to_string()))?
        .trim();

    if value.is_empty() || value.len() > MAX_KEY_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Idempotency-Key must be between 1 and {} characters",
            MAX_KEY_LENGTH
        )));
    }

    Ok(value.to_string())
}

/// Claims the key or decides how to answer without running the handler.
async fn begin(state: &IdempotencyState, record_key: &str, fp: &str) -> Decision {
    let started_at = Utc::now().to_rfc3339();
    let fields = [
        ("status", STATUS_IN_PROGRESS),
        ("fingerprint", fp),
        ("startedAt", started_at.as_str()),
    ];

    for _ in 0..MAX_CREATE_ATTEMPTS {
        match state
            .cache
            .hash_create_if_absent(record_key, &fields, state.ttl_seconds)
            .await
        {
            Ok(true) => return Decision::Proceed,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "Idempotency cache unavailable, passing request through");
                return Decision::PassThrough;
            }
        }

        let record = match state.cache.hash_get_all(record_key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Idempotency cache unavailable, passing request through");
                return Decision::PassThrough;
            }
        };

        // Expired or deleted since the create attempt; try to claim it again
        if record.is_empty() {
            continue;
        }

        return decide(&record, fp);
    }

    Decision::Conflict(ConflictReason::AlreadyInProgress)
}

/// Maps an existing record to the answer for a request with fingerprint `fp`.
fn decide(record: &HashMap<String, String>, fp: &str) -> Decision {
    if record.get("fingerprint").map(String::as_str) != Some(fp) {
        return Decision::Conflict(ConflictReason::DifferentRequestBody);
    }

    if record.get("status").map(String::as_str) != Some(STATUS_DONE) {
        return Decision::Conflict(ConflictReason::AlreadyInProgress);
    }

    let status = record
        .get("statusCode")
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(|s| StatusCode::from_u16(s).ok());

    match (status, record.get("response")) {
        (Some(status), Some(body)) => Decision::Replay(StoredResponse {
            status,
            content_type: record.get("contentType").cloned(),
            body: body.clone(),
        }),
        _ => {
            warn!("Malformed idempotency record, passing request through");
            Decision::PassThrough
        }
    }
}

/// Stores a 2xx response or clears the record, then returns the response.
async fn complete(
    state: &IdempotencyState,
    key: &str,
    record_key: &str,
    response: Response,
) -> Response {
    let (parts, body) = response.into_parts();

    if !parts.status.is_success() {
        debug!(idempotency_key = %key, status = %parts.status, "Clearing record after failure");
        release(state, record_key).await;
        return Response::from_parts(parts, body);
    }

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(idempotency_key = %key, error = %e, "Failed to read response body");
            release(state, record_key).await;
            return AppError::ServerError("Failed to read response body".to_string())
                .into_response();
        }
    };

    match std::str::from_utf8(&bytes) {
        Ok(text) => {
            let status_code = parts.status.as_u16().to_string();
            let completed_at = Utc::now().to_rfc3339();
            let content_type = parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");

            let mut fields = vec![
                ("status", STATUS_DONE),
                ("response", text),
                ("statusCode", status_code.as_str()),
                ("completedAt", completed_at.as_str()),
            ];
            if !content_type.is_empty() {
                fields.push(("contentType", content_type));
            }

            if let Err(e) = store(state, record_key, &fields).await {
                warn!(idempotency_key = %key, error = %e, "Failed to store response");
                release(state, record_key).await;
            } else {
                debug!(
                    idempotency_key = %key,
                    body = %redact::mask_body(&bytes),
                    "Stored response for replay"
                );
            }
        }
        Err(_) => {
            warn!(idempotency_key = %key, "Response body is not text, not storing for replay");
            release(state, record_key).await;
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

async fn store(
    state: &IdempotencyState,
    record_key: &str,
    fields: &[(&str, &str)],
) -> Result<(), crate::cache::CacheError> {
    state.cache.hash_set(record_key, fields).await?;
    state.cache.expire(record_key, state.ttl_seconds).await?;
    Ok(())
}

async fn release(state: &IdempotencyState, record_key: &str) {
    if let Err(e) = state.cache.delete(record_key).await {
        warn!(error = %e, "Failed to delete idempotency record");
    }
}
