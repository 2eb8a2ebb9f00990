//! HTTP API: OAuth routes behind the idempotency layer and CORS.

mod error;
pub mod identity;
pub mod idempotency;
pub mod oauth;

pub use error::{AppError, ConflictReason};
pub use idempotency::{idempotency_layer, IdempotencyState, IDEMPOTENCY_KEY_HEADER, REPLAY_HEADER};
pub use oauth::{create_oauth_router, OAuthAppState};

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    response::{IntoResponse, Response},
    Router,
};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// Everything the HTTP surface needs
#[derive(Clone)]
pub struct AppState {
    pub oauth: OAuthAppState,
    pub idempotency: IdempotencyState,
    /// Prefix for every route, e.g. `/api/v1`; empty mounts at the root
    pub api_base_path: String,
    pub cors_origins: Vec<String>,
}

/// Create the complete API router.
///
/// Layer order, outermost first: CORS, idempotency, panic recovery, routes.
pub fn create_router(state: AppState) -> Router {
    let routes = create_oauth_router(state.oauth);

    let base = state.api_base_path.trim_end_matches('/');
    let routes = if base.is_empty() {
        routes
    } else {
        Router::new().nest(base, routes)
    };

    with_idempotency(routes, state.idempotency).layer(build_cors_layer(&state.cors_origins))
}

/// Puts `routes` behind the idempotency layer.
///
/// A panicking handler becomes a 500 below the layer, so its record is
/// released like any other failure.
pub fn with_idempotency(routes: Router, state: IdempotencyState) -> Router {
    routes
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(
            Arc::new(state),
            idempotency_layer,
        ))
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!("Request handler panicked");
    AppError::ServerError("Internal server error".to_string()).into_response()
}

/// Build CORS layer with configured allowed origins
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
        ])
        .expose_headers([HeaderName::from_static(REPLAY_HEADER)])
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
}
