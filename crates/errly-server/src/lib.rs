//! Errly - self-hosted error observability.
//!
//! Discovers a project's active deployments, subscribes to their log
//! streams, detects and assembles errors, deduplicates them into
//! persistent groups, and pushes live updates to connected dashboards.
//!
//! ```text
//! Platform API ──> LogWatcher ──> Assembler ──> ErrorGrouper ──> Store
//!                                                    │
//!                                                    v
//!                                 PushHub ──> dashboards (SSE)
//! ```
//!
//! [`api`] carries the HTTP surface; [`watcher`], [`retention`], and
//! [`hub`] own the long-running tasks. Everything is wired together in
//! `main.rs` from one [`AppState`].

pub mod api;
pub mod config;
pub mod error;
pub mod grouper;
pub mod hub;
pub mod meter;
pub mod retention;
pub mod watcher;
pub mod webhook;

use std::sync::Arc;
use std::time::Instant;

use errly_platform::PlatformClient;
use errly_store::Store;

pub use config::Config;
pub use error::ApiError;
pub use grouper::ErrorGrouper;
pub use hub::PushHub;
pub use meter::ErrorRateMeter;
pub use retention::RetentionSweeper;
pub use watcher::{LogWatcher, WatcherConfig};

/// Shared application state behind every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Arc<Config>,
    /// The embedded store.
    pub store: Store,
    /// Occurrence deduplication.
    pub grouper: Arc<ErrorGrouper>,
    /// Dashboard fan-out.
    pub hub: Arc<PushHub>,
    /// The log watcher, when auto-capture is enabled.
    pub watcher: Option<Arc<LogWatcher>>,
    /// The platform client, when auto-capture is enabled.
    pub platform: Option<Arc<PlatformClient>>,
    /// Error-rate meter for diagnostics.
    pub meter: Arc<ErrorRateMeter>,
    /// Process start, for the uptime figure.
    pub started_at: Instant,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A fully wired state over an in-memory store, with auto-capture off
    /// and password `test-password`.
    pub async fn test_state() -> AppState {
        let store = Store::open_in_memory().await.unwrap();
        let config = Arc::new(Config {
            password: Some("test-password".to_owned()),
            ..Config::default()
        });
        let hub = PushHub::new(store.clone(), config.max_sse_clients);
        AppState {
            grouper: Arc::new(ErrorGrouper::new(store.clone())),
            hub,
            watcher: None,
            platform: None,
            meter: Arc::new(ErrorRateMeter::new()),
            started_at: Instant::now(),
            store,
            config,
        }
    }
}
