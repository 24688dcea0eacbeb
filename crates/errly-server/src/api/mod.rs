//! HTTP surface.
//!
//! Three authentication zones share one router: the dashboard routes
//! (session cookie, enforced by the [`auth::RequireSession`] extractor),
//! the token-authenticated ingestion endpoint, and the unauthenticated
//! health check. Security headers are stamped on every response.

pub mod auth;
pub mod errors;
pub mod health;
pub mod ingest;
pub mod security;
pub mod stream;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, patch, post};
use axum::Router;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::GovernorLayer;

use crate::AppState;

/// Ingestion rate: one token per 600 ms with the full minute as burst,
/// i.e. ~100 requests per minute per client IP.
const INGEST_REFILL_MS: u64 = 600;
const INGEST_BURST: u32 = 100;

/// Build the full application router.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// the per-IP ingestion rate limit can fall back to the peer address.
pub fn router(state: AppState) -> Router {
    let governor_config = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .per_millisecond(INGEST_REFILL_MS)
        .burst_size(INGEST_BURST)
        .finish()
        .expect("invalid ingest rate limit configuration");

    let ingest_route = post(ingest::ingest)
        .layer::<_, std::convert::Infallible>(GovernorLayer {
            config: std::sync::Arc::new(governor_config),
        })
        .layer(DefaultBodyLimit::max(ingest::MAX_BODY_BYTES));

    Router::new()
        .route("/health", get(health::health))
        .route("/api/errors/stream", get(stream::stream))
        .route("/api/errors", get(errors::list).merge(ingest_route))
        .route("/api/errors/stats", get(errors::stats))
        .route("/api/errors/delete", post(errors::delete_many))
        .route("/api/errors/delete-all", post(errors::delete_all))
        .route("/api/errors/{id}", get(errors::detail))
        .route("/api/errors/{id}/related", get(errors::related))
        .route("/api/errors/{id}/status", patch(errors::update_status))
        .route("/api/services", get(errors::services))
        .route("/api/diagnostics", get(health::diagnostics))
        .layer(security::SecurityLayer::new())
        .with_state(state)
}
