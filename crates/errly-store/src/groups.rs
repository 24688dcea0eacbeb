//! Error-group persistence.
//!
//! Holds the indexed `fingerprint -> ErrorGroup` mapping and the
//! transactional insert-or-upsert the grouper runs for every occurrence.

use errly_core::{compute_fingerprint, ErrorEvent, ErrorGroup, ErrorSource, GroupStatus, Severity};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::Store;

/// Upper bound for the related-errors time window, in minutes.
pub const RELATED_WINDOW_MAX_MINUTES: i64 = 60;

/// Default related-errors time window, in minutes.
pub const RELATED_WINDOW_DEFAULT_MINUTES: i64 = 5;

/// Maximum related groups returned.
const RELATED_LIMIT: i64 = 20;

/// Time-range filter over `last_seen_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    /// Last hour.
    LastHour,
    /// Last 24 hours.
    LastDay,
    /// Last 7 days.
    LastWeek,
    /// Last 30 days.
    LastMonth,
}

impl TimeRange {
    /// The inclusive lower bound for `last_seen_at`, in epoch ms.
    #[must_use]
    pub const fn cutoff_ms(&self, now_ms: i64) -> i64 {
        const HOUR_MS: i64 = 60 * 60 * 1000;
        match self {
            Self::LastHour => now_ms - HOUR_MS,
            Self::LastDay => now_ms - 24 * HOUR_MS,
            Self::LastWeek => now_ms - 7 * 24 * HOUR_MS,
            Self::LastMonth => now_ms - 30 * 24 * HOUR_MS,
        }
    }
}

impl std::str::FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Self::LastHour),
            "24h" => Ok(Self::LastDay),
            "7d" => Ok(Self::LastWeek),
            "30d" => Ok(Self::LastMonth),
            other => Err(format!("unknown time range: {other}")),
        }
    }
}

/// Filter criteria for listing error groups.
#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
    /// Filter by service name.
    pub service: Option<String>,
    /// Filter by severity.
    pub severity: Option<Severity>,
    /// Filter by triage status.
    pub status: Option<GroupStatus>,
    /// Restrict to groups last seen within this range.
    pub time_range: Option<TimeRange>,
    /// Substring match over message and stack trace.
    pub search: Option<String>,
    /// Maximum rows returned.
    pub limit: i64,
    /// Pagination offset.
    pub offset: i64,
}

/// A bind value for the dynamically built filter queries.
enum Bind {
    Text(String),
    Int(i64),
}

fn apply_binds<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    binds: &'q [Bind],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Text(text) => query.bind(text),
            Bind::Int(value) => query.bind(value),
        };
    }
    query
}

impl GroupFilter {
    /// Build the WHERE clause and its bind values.
    fn where_clause(&self, now_ms: i64) -> (String, Vec<Bind>) {
        let mut conditions = Vec::new();
        let mut binds = Vec::new();

        if let Some(ref service) = self.service {
            conditions.push("service = ?".to_owned());
            binds.push(Bind::Text(service.clone()));
        }
        if let Some(severity) = self.severity {
            conditions.push("severity = ?".to_owned());
            binds.push(Bind::Text(severity.as_str().to_owned()));
        }
        if let Some(status) = self.status {
            conditions.push("status = ?".to_owned());
            binds.push(Bind::Text(status.as_str().to_owned()));
        }
        if let Some(range) = self.time_range {
            conditions.push("last_seen_at >= ?".to_owned());
            binds.push(Bind::Int(range.cutoff_ms(now_ms)));
        }
        if let Some(ref search) = self.search {
            conditions.push(
                r"(message LIKE ? ESCAPE '\' OR stack_trace LIKE ? ESCAPE '\')".to_owned(),
            );
            let pattern = format!("%{}%", escape_like(search));
            binds.push(Bind::Text(pattern.clone()));
            binds.push(Bind::Text(pattern));
        }

        if conditions.is_empty() {
            (String::new(), binds)
        } else {
            (format!("WHERE {}", conditions.join(" AND ")), binds)
        }
    }
}

/// One page of a filtered listing.
#[derive(Debug, Clone)]
pub struct GroupPage {
    /// The matching groups, most recently seen first.
    pub groups: Vec<ErrorGroup>,
    /// Total rows matching the filter, ignoring pagination.
    pub total: i64,
}

/// Aggregate counts for the stats endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    /// Total groups.
    pub total: i64,
    /// Groups seen in the last 24 hours.
    pub last_24h: i64,
    /// Groups currently at warn severity.
    pub warn: i64,
    /// Groups currently at error severity.
    pub error: i64,
    /// Groups currently at fatal severity.
    pub fatal: i64,
}

impl Store {
    /// List groups matching a filter, most recently seen first.
    pub async fn list_groups(&self, filter: &GroupFilter, now_ms: i64) -> StoreResult<GroupPage> {
        let (where_clause, binds) = filter.where_clause(now_ms);

        let count_sql = format!("SELECT COUNT(*) AS n FROM error_groups {where_clause}");
        let count_query = apply_binds(sqlx::query(&count_sql), &binds);
        let total: i64 = count_query.fetch_one(self.pool()).await?.get("n");

        let list_sql = format!(
            "SELECT * FROM error_groups {where_clause} \
             ORDER BY last_seen_at DESC LIMIT ? OFFSET ?"
        );
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        let list_query = apply_binds(sqlx::query(&list_sql), &binds)
            .bind(limit)
            .bind(filter.offset.max(0));

        let rows = list_query.fetch_all(self.pool()).await?;
        let groups = rows
            .iter()
            .map(row_to_group)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(GroupPage { groups, total })
    }

    /// Get a group by id.
    pub async fn get_group(&self, id: &str) -> StoreResult<Option<ErrorGroup>> {
        let row = sqlx::query("SELECT * FROM error_groups WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_group).transpose()
    }

    /// Get a group by fingerprint.
    pub async fn get_group_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> StoreResult<Option<ErrorGroup>> {
        let row = sqlx::query("SELECT * FROM error_groups WHERE fingerprint = ?")
            .bind(fingerprint)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(row_to_group).transpose()
    }

    /// Groups from *other* services seen within ±N minutes of this group's
    /// last occurrence. N is clamped to [1, 60].
    pub async fn related_groups(
        &self,
        id: &str,
        window_minutes: Option<i64>,
    ) -> StoreResult<Vec<ErrorGroup>> {
        let group = self
            .get_group(id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("error group {id}")))?;

        let minutes = window_minutes
            .unwrap_or(RELATED_WINDOW_DEFAULT_MINUTES)
            .clamp(1, RELATED_WINDOW_MAX_MINUTES);
        let window_ms = minutes * 60 * 1000;

        let rows = sqlx::query(
            "SELECT * FROM error_groups \
             WHERE service != ? AND last_seen_at BETWEEN ? AND ? \
             ORDER BY last_seen_at DESC LIMIT ?",
        )
        .bind(&group.service)
        .bind(group.last_seen_at - window_ms)
        .bind(group.last_seen_at + window_ms)
        .bind(RELATED_LIMIT)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(row_to_group).collect()
    }

    /// Delete groups by id; returns how many actually existed.
    pub async fn delete_groups(&self, ids: &[String]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("DELETE FROM error_groups WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(self.pool()).await?;
        Ok(result.rows_affected())
    }

    /// Delete every group. The confirmation flag is enforced at the API
    /// layer; this is the unconditional primitive.
    pub async fn delete_all_groups(&self) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM error_groups")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete groups last seen more than `days` ago; returns the deleted
    /// ids so the caller can notify dashboards.
    pub async fn delete_groups_by_retention(
        &self,
        days: i64,
        now_ms: i64,
    ) -> StoreResult<Vec<String>> {
        let cutoff = now_ms - days * 24 * 60 * 60 * 1000;

        let mut tx = self.pool().begin().await?;
        let rows = sqlx::query("SELECT id FROM error_groups WHERE last_seen_at < ?")
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await?;
        let ids: Vec<String> = rows.iter().map(|r| r.get("id")).collect();

        if !ids.is_empty() {
            sqlx::query("DELETE FROM error_groups WHERE last_seen_at < ?")
                .bind(cutoff)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Set a group's triage status. `status_changed_at` is stamped only
    /// when the status actually changes.
    pub async fn update_group_status(
        &self,
        id: &str,
        status: GroupStatus,
        now_ms: i64,
    ) -> StoreResult<ErrorGroup> {
        let group = self
            .get_group(id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("error group {id}")))?;

        if group.status == status {
            return Ok(group);
        }

        sqlx::query("UPDATE error_groups SET status = ?, status_changed_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now_ms)
            .bind(id)
            .execute(self.pool())
            .await?;

        self.get_group(id)
            .await?
            .ok_or_else(|| StoreError::invariant(format!("group {id} vanished during update")))
    }

    /// Distinct service names, for dashboard filters.
    pub async fn distinct_services(&self) -> StoreResult<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT service FROM error_groups ORDER BY service")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(|r| r.get("service")).collect())
    }

    /// Aggregate counts for the stats endpoint.
    pub async fn group_stats(&self, now_ms: i64) -> StoreResult<GroupStats> {
        let row = sqlx::query(
            "SELECT \
               COUNT(*) AS total, \
               SUM(CASE WHEN last_seen_at >= ? THEN 1 ELSE 0 END) AS last_24h, \
               SUM(CASE WHEN severity = 'warn' THEN 1 ELSE 0 END) AS warn, \
               SUM(CASE WHEN severity = 'error' THEN 1 ELSE 0 END) AS error, \
               SUM(CASE WHEN severity = 'fatal' THEN 1 ELSE 0 END) AS fatal \
             FROM error_groups",
        )
        .bind(now_ms - 24 * 60 * 60 * 1000)
        .fetch_one(self.pool())
        .await?;

        Ok(GroupStats {
            total: row.get("total"),
            last_24h: row.try_get::<Option<i64>, _>("last_24h")?.unwrap_or(0),
            warn: row.try_get::<Option<i64>, _>("warn")?.unwrap_or(0),
            error: row.try_get::<Option<i64>, _>("error")?.unwrap_or(0),
            fatal: row.try_get::<Option<i64>, _>("fatal")?.unwrap_or(0),
        })
    }

    /// Record one error occurrence: insert a new group or fold the
    /// occurrence into the existing one, atomically.
    ///
    /// Inside a single transaction: look up by fingerprint; insert with
    /// `occurrences = 1` and status `new` when absent; otherwise bump
    /// `last_seen_at`/`occurrences`, escalate severity, revert a resolved
    /// status to `new`, and refresh message/raw log/deployment. The row is
    /// re-read before commit so the caller gets canonical values.
    pub async fn record_occurrence(
        &self,
        event: &ErrorEvent,
        now_ms: i64,
    ) -> StoreResult<(ErrorGroup, bool)> {
        let fingerprint =
            compute_fingerprint(&event.service, &event.message, event.stack_trace.as_deref());

        let mut tx = self.pool().begin().await?;

        let existing = sqlx::query("SELECT * FROM error_groups WHERE fingerprint = ?")
            .bind(&fingerprint)
            .fetch_optional(&mut *tx)
            .await?;

        let (id, is_new) = match existing {
            None => {
                let id = Uuid::new_v4().to_string();
                let metadata = metadata_to_text(event.metadata.as_ref())?;
                sqlx::query(
                    "INSERT INTO error_groups \
                     (id, service, deployment_id, message, stack_trace, severity, status, \
                      endpoint, raw_log, source, metadata, fingerprint, first_seen_at, \
                      last_seen_at, occurrences, status_changed_at, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
                )
                .bind(&id)
                .bind(&event.service)
                .bind(&event.deployment_id)
                .bind(&event.message)
                .bind(&event.stack_trace)
                .bind(event.severity.as_str())
                .bind(GroupStatus::New.as_str())
                .bind(&event.endpoint)
                .bind(&event.raw_log)
                .bind(event.source.as_str())
                .bind(metadata)
                .bind(&fingerprint)
                .bind(now_ms)
                .bind(now_ms)
                .bind(now_ms)
                .bind(now_ms)
                .execute(&mut *tx)
                .await?;
                (id, true)
            }
            Some(row) => {
                let current = row_to_group(&row)?;
                let severity = current.severity.escalate(event.severity);
                let (status, status_changed_at) = if current.status == GroupStatus::Resolved {
                    (GroupStatus::New, now_ms)
                } else {
                    (current.status, current.status_changed_at)
                };
                let endpoint = event.endpoint.clone().or(current.endpoint);
                let metadata_text = match &event.metadata {
                    Some(value) => metadata_to_text(Some(value))?,
                    None => current
                        .metadata
                        .as_ref()
                        .map(|v| metadata_to_text(Some(v)))
                        .transpose()?
                        .flatten(),
                };
                let deployment_id = event.deployment_id.clone().or(current.deployment_id);

                sqlx::query(
                    "UPDATE error_groups SET \
                       last_seen_at = ?, occurrences = occurrences + 1, deployment_id = ?, \
                       raw_log = ?, message = ?, severity = ?, status = ?, \
                       status_changed_at = ?, endpoint = ?, metadata = ? \
                     WHERE fingerprint = ?",
                )
                .bind(now_ms)
                .bind(deployment_id)
                .bind(&event.raw_log)
                .bind(&event.message)
                .bind(severity.as_str())
                .bind(status.as_str())
                .bind(status_changed_at)
                .bind(endpoint)
                .bind(metadata_text)
                .bind(&fingerprint)
                .execute(&mut *tx)
                .await?;
                (current.id, false)
            }
        };

        let row = sqlx::query("SELECT * FROM error_groups WHERE fingerprint = ?")
            .bind(&fingerprint)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                StoreError::invariant(format!("group {id} missing after upsert"))
            })?;
        let group = row_to_group(&row)?;

        tx.commit().await?;
        Ok((group, is_new))
    }
}

/// Escape LIKE wildcards in user-supplied search input.
fn escape_like(input: &str) -> String {
    input
        .replace('\\', r"\\")
        .replace('%', r"\%")
        .replace('_', r"\_")
}

fn metadata_to_text(metadata: Option<&serde_json::Value>) -> StoreResult<Option<String>> {
    metadata
        .map(|value| {
            serde_json::to_string(value).map_err(|e| StoreError::Serialisation(e.to_string()))
        })
        .transpose()
}

/// Parse a row into an [`ErrorGroup`].
fn row_to_group(row: &SqliteRow) -> StoreResult<ErrorGroup> {
    let severity: String = row.get("severity");
    let status: String = row.get("status");
    let source: String = row.get("source");
    let metadata: Option<String> = row.get("metadata");

    Ok(ErrorGroup {
        id: row.get("id"),
        service: row.get("service"),
        deployment_id: row.get("deployment_id"),
        message: row.get("message"),
        stack_trace: row.get("stack_trace"),
        severity: severity
            .parse::<Severity>()
            .map_err(|e| StoreError::Serialisation(e.to_string()))?,
        status: status
            .parse::<GroupStatus>()
            .map_err(|e| StoreError::Serialisation(e.to_string()))?,
        endpoint: row.get("endpoint"),
        raw_log: row.get("raw_log"),
        source: source
            .parse::<ErrorSource>()
            .map_err(|e| StoreError::Serialisation(e.to_string()))?,
        metadata: metadata
            .map(|text| {
                serde_json::from_str(&text).map_err(|e| StoreError::Serialisation(e.to_string()))
            })
            .transpose()?,
        fingerprint: row.get("fingerprint"),
        first_seen_at: row.get("first_seen_at"),
        last_seen_at: row.get("last_seen_at"),
        occurrences: row.get("occurrences"),
        status_changed_at: row.get("status_changed_at"),
        created_at: row.get("created_at"),
    })
}
