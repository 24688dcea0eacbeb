//! Error grouping.
//!
//! Folds each detected occurrence into its persistent group (insert or
//! upsert, transactionally, via the store) and fires the new-group webhook.
//! The caller receives the canonical group and passes its summary to the
//! push hub; the grouper itself never touches the hub.

use errly_core::{ErrorEvent, ErrorGroup};
use errly_store::{Store, StoreResult};

use crate::webhook::WebhookDispatcher;

/// Result of processing one occurrence.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// The canonical group after the upsert.
    pub group: ErrorGroup,
    /// Whether this occurrence created the group.
    pub is_new: bool,
}

/// Deduplicates error occurrences into persistent groups.
#[derive(Debug, Clone)]
pub struct ErrorGrouper {
    store: Store,
    webhook: WebhookDispatcher,
}

impl ErrorGrouper {
    /// Create a grouper over the given store.
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            webhook: WebhookDispatcher::new(),
        }
    }

    /// Process one occurrence.
    ///
    /// The select/insert-or-update runs inside a store transaction, so
    /// concurrent duplicate arrivals cannot trip the unique fingerprint
    /// index. A new group dispatches the webhook fire-and-forget, outside
    /// the transaction.
    pub async fn process(&self, event: ErrorEvent) -> StoreResult<ProcessOutcome> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (group, is_new) = self.store.record_occurrence(&event, now_ms).await?;

        if is_new {
            self.dispatch_webhook(&group);
        }

        Ok(ProcessOutcome { group, is_new })
    }

    /// Fire-and-forget webhook for a newly created group.
    fn dispatch_webhook(&self, group: &ErrorGroup) {
        let store = self.store.clone();
        let webhook = self.webhook.clone();
        let summary = group.summary();

        tokio::spawn(async move {
            let url = match store.webhook_url().await {
                Ok(Some(url)) if !url.is_empty() => url,
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "could not read webhook URL");
                    return;
                }
            };
            webhook.send_new_error(&url, &summary).await;
        });
    }
}
