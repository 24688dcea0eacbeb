//! String-keyed JSON settings.
//!
//! Holds the handful of operator-tunable values: retention window, service
//! aliases, webhook URL, and the direct-ingestion token.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::Row;

use crate::error::{StoreError, StoreResult};
use crate::Store;

/// Retention window bounds, in days.
pub const RETENTION_DAYS_MIN: i64 = 1;
/// Retention window upper bound, in days.
pub const RETENTION_DAYS_MAX: i64 = 90;
/// Default retention window, in days.
pub const RETENTION_DAYS_DEFAULT: i64 = 7;

/// Setting key for the retention window.
pub const KEY_RETENTION_DAYS: &str = "retentionDays";
/// Setting key for the service alias map.
pub const KEY_SERVICE_ALIASES: &str = "serviceAliases";
/// Setting key for the new-error webhook URL.
pub const KEY_WEBHOOK_URL: &str = "webhookUrl";
/// Setting key for the direct-ingestion token.
pub const KEY_INGEST_TOKEN: &str = "ingestToken";

impl Store {
    /// Read a setting, deserialising its JSON value.
    pub async fn get_setting<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        row.map(|r| {
            let text: String = r.get("value");
            serde_json::from_str(&text).map_err(|e| StoreError::Serialisation(e.to_string()))
        })
        .transpose()
    }

    /// Write a setting as JSON.
    pub async fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let text =
            serde_json::to_string(value).map_err(|e| StoreError::Serialisation(e.to_string()))?;
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(text)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// The retention window, clamped to [1, 90] days (default 7).
    pub async fn retention_days(&self) -> StoreResult<i64> {
        let days = self
            .get_setting::<i64>(KEY_RETENTION_DAYS)
            .await?
            .unwrap_or(RETENTION_DAYS_DEFAULT);
        Ok(days.clamp(RETENTION_DAYS_MIN, RETENTION_DAYS_MAX))
    }

    /// The configured webhook URL, if any.
    pub async fn webhook_url(&self) -> StoreResult<Option<String>> {
        self.get_setting(KEY_WEBHOOK_URL).await
    }

    /// The configured direct-ingestion token, if any.
    pub async fn ingest_token(&self) -> StoreResult<Option<String>> {
        self.get_setting(KEY_INGEST_TOKEN).await
    }

    /// Service display-name aliases (`platform name -> dashboard name`).
    pub async fn service_aliases(&self) -> StoreResult<HashMap<String, String>> {
        Ok(self
            .get_setting(KEY_SERVICE_ALIASES)
            .await?
            .unwrap_or_default())
    }
}
