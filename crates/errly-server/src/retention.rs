//! Retention sweeper.
//!
//! Runs once at startup and then hourly: prunes error groups older than
//! the configured retention window and tells dashboards what vanished -
//! the exact id list when it is small, one coalesced `bulk-cleared`
//! otherwise.

use std::sync::Arc;
use std::time::Duration;

use errly_store::Store;
use tokio_util::sync::CancellationToken;

use crate::hub::{PushEvent, PushHub};

/// Sweep cadence.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Largest deletion reported id-by-id; beyond this a single
/// `bulk-cleared` is published instead.
pub const CLEAR_NOTIFY_LIMIT: usize = 100;

/// Periodic retention pruner.
pub struct RetentionSweeper {
    store: Store,
    hub: Arc<PushHub>,
    cancel: CancellationToken,
}

impl RetentionSweeper {
    /// Create a sweeper.
    #[must_use]
    pub fn new(store: Store, hub: Arc<PushHub>, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self { store, hub, cancel })
    }

    /// Run the initial sweep and schedule the hourly ones.
    pub fn start(self: &Arc<Self>) {
        let sweeper = Arc::clone(self);
        tokio::spawn(async move {
            sweeper.run_sweep().await;
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately and duplicates the initial
            // sweep; consume it.
            interval.tick().await;
            loop {
                tokio::select! {
                    () = sweeper.cancel.cancelled() => return,
                    _ = interval.tick() => sweeper.run_sweep().await,
                }
            }
        });
    }

    /// One sweep: read the retention window, prune, notify.
    ///
    /// Failures are logged and the next tick tries again; the sweeper
    /// never crashes the process.
    pub async fn run_sweep(&self) {
        let days = match self.store.retention_days().await {
            Ok(days) => days,
            Err(e) => {
                tracing::warn!(error = %e, "could not read retention setting");
                return;
            }
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let ids = match self.store.delete_groups_by_retention(days, now_ms).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "retention sweep failed");
                return;
            }
        };

        if ids.is_empty() {
            return;
        }

        tracing::info!(deleted = ids.len(), retention_days = days, "retention sweep pruned groups");
        if ids.len() <= CLEAR_NOTIFY_LIMIT {
            self.hub.broadcast(&PushEvent::ErrorCleared { ids });
        } else {
            self.hub.broadcast(&PushEvent::BulkCleared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Frame;
    use errly_core::{ErrorEvent, ErrorSource, Severity};

    fn event(message: &str) -> ErrorEvent {
        ErrorEvent {
            service: "api".to_owned(),
            deployment_id: None,
            message: message.to_owned(),
            stack_trace: None,
            severity: Severity::Error,
            endpoint: None,
            raw_log: message.to_owned(),
            source: ErrorSource::Direct,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn sweep_publishes_cleared_ids() {
        let store = Store::open_in_memory().await.unwrap();
        let hub = PushHub::new(store.clone(), 8);
        let sweeper = RetentionSweeper::new(store.clone(), Arc::clone(&hub), CancellationToken::new());

        // One stale group, one fresh.
        let now = chrono::Utc::now().timestamp_millis();
        let (stale, _) = store
            .record_occurrence(&event("ancient"), now - 30 * 24 * 60 * 60 * 1000)
            .await
            .unwrap();
        store.record_occurrence(&event("fresh"), now).await.unwrap();

        let (_, mut rx) = hub.subscribe("session").unwrap();
        sweeper.run_sweep().await;

        let Frame::Event(json) = rx.recv().await.unwrap() else {
            panic!("expected event frame");
        };
        assert!(json.contains("error-cleared"));
        assert!(json.contains(&stale.id));
    }

    #[tokio::test]
    async fn sweep_with_nothing_to_prune_is_silent() {
        let store = Store::open_in_memory().await.unwrap();
        let hub = PushHub::new(store.clone(), 8);
        let sweeper = RetentionSweeper::new(store.clone(), Arc::clone(&hub), CancellationToken::new());

        let now = chrono::Utc::now().timestamp_millis();
        store.record_occurrence(&event("fresh"), now).await.unwrap();

        let (_, mut rx) = hub.subscribe("session").unwrap();
        sweeper.run_sweep().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn large_sweeps_coalesce_to_bulk_cleared() {
        let store = Store::open_in_memory().await.unwrap();
        let hub = PushHub::new(store.clone(), 8);
        let sweeper = RetentionSweeper::new(store.clone(), Arc::clone(&hub), CancellationToken::new());

        let now = chrono::Utc::now().timestamp_millis();
        let stale_at = now - 30 * 24 * 60 * 60 * 1000;
        for i in 0..(CLEAR_NOTIFY_LIMIT + 1) {
            store
                .record_occurrence(&event(&format!("stale {i}")), stale_at)
                .await
                .unwrap();
        }

        let (_, mut rx) = hub.subscribe("session").unwrap();
        sweeper.run_sweep().await;

        let Frame::Event(json) = rx.recv().await.unwrap() else {
            panic!("expected event frame");
        };
        assert_eq!(json.as_str(), r#"{"type":"bulk-cleared"}"#);
    }
}
