//! OAuth connection endpoints.
//!
//! - `GET|POST /oauth/providerA/token` - client-credentials connect
//! - `GET /oauth/providerB/authorize` - start the redirect flow
//! - `GET /oauth/providerB/callback` - provider redirect target
//! - `GET /oauth/connections` - list a user's connections
//! - `DELETE /oauth/:provider` - disconnect
//! - `GET /oauth/error` - human-readable reason for an error code

use super::identity::resolve_user;
use super::AppError;
use crate::connections::{ConnectionSummary, Provider};
use crate::crypto::TokenSigner;
use crate::oauth::{describe_error, CallbackError, ErrorDescription, OAuthService};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared application state for OAuth API
#[derive(Clone)]
pub struct OAuthAppState {
    pub service: Arc<OAuthService>,
    /// Bearer token verifier; `None` trusts the `userId` parameter
    pub token_signer: Option<Arc<TokenSigner>>,
    /// Base URL for success and error redirects
    pub frontend_url: String,
}

#[derive(Deserialize)]
struct UserQuery {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

#[derive(Deserialize)]
struct UserBody {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct ErrorQuery {
    error: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    success: bool,
    provider: Provider,
    expires_in: i64,
}

#[derive(Serialize)]
struct ConnectionsResponse {
    connections: Vec<ConnectionSummary>,
}

#[derive(Serialize)]
struct DisconnectResponse {
    success: bool,
    message: String,
}

/// Create OAuth API router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route(
            "/oauth/providerA/token",
            get(issue_token_from_query).post(issue_token_from_body),
        )
        .route("/oauth/providerB/authorize", get(authorize))
        .route("/oauth/providerB/callback", get(callback))
        .route("/oauth/connections", get(list_connections))
        .route("/oauth/error", get(error_details))
        .route("/oauth/:provider", delete(disconnect))
        .with_state(Arc::new(state))
}

/// 302 to `location`
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn error_redirect(frontend_url: &str, code: &str) -> Response {
    found(&format!(
        "{}/oauth/error?error={}",
        frontend_url,
        urlencoding::encode(code)
    ))
}

/// GET /oauth/providerA/token?userId=
async fn issue_token_from_query(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> Result<Json<TokenResponse>, AppError> {
    let user_id = resolve_user(&headers, query.user_id.as_deref(), state.token_signer.as_deref())?;
    issue_token(&state, &user_id).await
}

/// POST /oauth/providerA/token with `{"userId": ...}` or `?userId=`
async fn issue_token_from_body(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
    body: Option<Json<UserBody>>,
) -> Result<Json<TokenResponse>, AppError> {
    let claimed = body
        .and_then(|Json(b)| b.user_id)
        .or(query.user_id);
    let user_id = resolve_user(&headers, claimed.as_deref(), state.token_signer.as_deref())?;
    issue_token(&state, &user_id).await
}

async fn issue_token(state: &OAuthAppState, user_id: &str) -> Result<Json<TokenResponse>, AppError> {
    let outcome = state
        .service
        .connect_client_credentials(user_id)
        .await
        .map_err(|e| {
            error!(user_id = %user_id, provider = %Provider::ProviderA, error = %e, "Token issuance failed");
            AppError::ServerError("Failed to get provider A access token".to_string())
        })?;

    Ok(Json(TokenResponse {
        success: true,
        provider: Provider::ProviderA,
        expires_in: outcome.expires_in,
    }))
}

/// GET /oauth/providerB/authorize?userId=
///
/// Records a CSRF state (5 minute TTL) and redirects to the provider.
async fn authorize(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> Result<Response, AppError> {
    let user_id = resolve_user(&headers, query.user_id.as_deref(), state.token_signer.as_deref())?;

    let url = state
        .service
        .begin_authorization(&user_id)
        .await
        .map_err(|e| {
            error!(user_id = %user_id, error = %e, "Failed to start authorization");
            AppError::ServerError("Failed to generate authorization URL".to_string())
        })?;

    Ok(found(&url))
}

/// GET /oauth/providerB/callback?code&state&error
///
/// Always ends in a redirect to the front end except for a malformed request.
async fn callback(
    State(state): State<Arc<OAuthAppState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(upstream) = query.error {
        warn!(
            provider = %Provider::ProviderB,
            error = %upstream,
            description = query.error_description.as_deref().unwrap_or(""),
            "Provider returned an authorization error"
        );
        return error_redirect(&state.frontend_url, &upstream);
    }

    let code = query.code.filter(|c| !c.is_empty());
    let csrf_state = query.state.filter(|s| !s.is_empty());
    let (Some(code), Some(csrf_state)) = (code, csrf_state) else {
        warn!(provider = %Provider::ProviderB, "Callback without code or state");
        return AppError::BadRequest("code and state are required".to_string()).into_response();
    };

    match state.service.complete_authorization(&code, &csrf_state).await {
        Ok(outcome) => {
            info!(
                user_id = %outcome.connection.user_id,
                provider = %Provider::ProviderB,
                "Callback completed"
            );
            found(&format!(
                "{}/oauth/success?provider={}",
                state.frontend_url,
                Provider::ProviderB
            ))
        }
        Err(e @ CallbackError::InvalidState) => {
            warn!(provider = %Provider::ProviderB, error = %e, "Rejected callback");
            error_redirect(&state.frontend_url, e.code().as_str())
        }
        Err(e) => {
            error!(provider = %Provider::ProviderB, error = %e, "Callback failed");
            error_redirect(&state.frontend_url, e.code().as_str())
        }
    }
}

/// GET /oauth/connections?userId=
async fn list_connections(
    State(state): State<Arc<OAuthAppState>>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> Result<Json<ConnectionsResponse>, AppError> {
    let user_id = resolve_user(&headers, query.user_id.as_deref(), state.token_signer.as_deref())?;

    let connections = state.service.list_connections(&user_id).map_err(|e| {
        error!(user_id = %user_id, error = %e, "Failed to list connections");
        AppError::ServerError("Failed to fetch OAuth connections".to_string())
    })?;

    Ok(Json(ConnectionsResponse { connections }))
}

/// DELETE /oauth/:provider?userId=
async fn disconnect(
    State(state): State<Arc<OAuthAppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> Result<Json<DisconnectResponse>, AppError> {
    let user_id = resolve_user(&headers, query.user_id.as_deref(), state.token_signer.as_deref())?;

    let provider = Provider::parse(&provider)
        .ok_or_else(|| AppError::BadRequest("Invalid provider".to_string()))?;

    let deleted = state
        .service
        .disconnect(&user_id, provider)
        .await
        .map_err(|e| {
            error!(user_id = %user_id, provider = %provider, error = %e, "Failed to disconnect");
            AppError::ServerError("Failed to delete OAuth connection".to_string())
        })?;

    if !deleted {
        return Err(AppError::NotFound("OAuth connection not found".to_string()));
    }

    Ok(Json(DisconnectResponse {
        success: true,
        message: "OAuth connection deleted".to_string(),
    }))
}

/// GET /oauth/error?error=
async fn error_details(Query(query): Query<ErrorQuery>) -> Json<ErrorDescription> {
    Json(describe_error(query.error.as_deref()))
}
