//! Core types for error grouping.
//!
//! These types represent a single detected error occurrence flowing through
//! the pipeline and the persistent group it is deduplicated into.

use serde::{Deserialize, Serialize};

/// Severity of an error occurrence.
///
/// The derived `Ord` gives the escalation order `Warn < Error < Fatal`:
/// a group's severity only ever moves up this ladder, never down.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Degraded but functioning (4xx responses, deprecations, slow queries).
    Warn,
    /// A failure worth investigating.
    #[default]
    Error,
    /// Process-terminating or data-loss conditions (panics, OOM, signals).
    Fatal,
}

impl Severity {
    /// String representation used on the wire and in the store.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }

    /// Escalate: the greater of the two severities.
    #[must_use]
    pub fn escalate(self, incoming: Self) -> Self {
        self.max(incoming)
    }
}

impl std::str::FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" | "critical" => Ok(Self::Fatal),
            other => Err(UnknownVariant::new("severity", other)),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Triage status of an error group.
///
/// `Resolved` reverts to `New` when the error recurs; the two in-flight
/// statuses are preserved through recurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GroupStatus {
    /// Never triaged, or reopened by a recurrence.
    #[default]
    New,
    /// Someone is looking at it.
    Investigating,
    /// A fix is underway.
    InProgress,
    /// Believed fixed.
    Resolved,
}

impl GroupStatus {
    /// String representation used on the wire and in the store.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Investigating => "investigating",
            Self::InProgress => "in-progress",
            Self::Resolved => "resolved",
        }
    }
}

impl std::str::FromStr for GroupStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "investigating" => Ok(Self::Investigating),
            "in-progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            other => Err(UnknownVariant::new("status", other)),
        }
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an error occurrence entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorSource {
    /// Detected by the log watcher from a platform log stream.
    #[default]
    AutoCapture,
    /// Submitted directly via the ingestion API.
    Direct,
}

impl ErrorSource {
    /// String representation used on the wire and in the store.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AutoCapture => "auto-capture",
            Self::Direct => "direct",
        }
    }
}

impl std::str::FromStr for ErrorSource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto-capture" => Ok(Self::AutoCapture),
            "direct" => Ok(Self::Direct),
            other => Err(UnknownVariant::new("source", other)),
        }
    }
}

/// Parse failure for one of the string-backed enums above.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

/// One detected error occurrence, ready for grouping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    /// Service that emitted the error.
    pub service: String,
    /// Deployment the log line came from (absent for direct ingestion).
    pub deployment_id: Option<String>,
    /// Error message (first line of the trace).
    pub message: String,
    /// Assembled stack trace, if the error spanned multiple lines.
    pub stack_trace: Option<String>,
    /// Severity of this occurrence.
    pub severity: Severity,
    /// `"METHOD /path"` extracted from the log line, if any.
    pub endpoint: Option<String>,
    /// The raw first log line, unmodified.
    pub raw_log: String,
    /// How the occurrence entered the system.
    pub source: ErrorSource,
    /// Opaque key/value metadata supplied by direct ingestion.
    pub metadata: Option<serde_json::Value>,
}

/// A persisted group of identical errors, keyed by fingerprint.
///
/// Invariants: `occurrences` never decreases, `last_seen_at >= first_seen_at`,
/// and `severity` only escalates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorGroup {
    /// Stable identifier.
    pub id: String,
    /// Service that produced the error.
    pub service: String,
    /// Deployment of the most recent occurrence.
    pub deployment_id: Option<String>,
    /// Error message from the most recent occurrence.
    pub message: String,
    /// Stack trace, if any occurrence carried one.
    pub stack_trace: Option<String>,
    /// Highest severity seen across all occurrences.
    pub severity: Severity,
    /// Triage status.
    pub status: GroupStatus,
    /// `"METHOD /path"` if one was extracted.
    pub endpoint: Option<String>,
    /// Raw first log line of the most recent occurrence.
    pub raw_log: String,
    /// How occurrences of this group enter the system.
    pub source: ErrorSource,
    /// Opaque key/value metadata, if any.
    pub metadata: Option<serde_json::Value>,
    /// SHA-256 fingerprint - unique across the store.
    pub fingerprint: String,
    /// Epoch ms of the first occurrence.
    pub first_seen_at: i64,
    /// Epoch ms of the most recent occurrence.
    pub last_seen_at: i64,
    /// Total occurrences (>= 1).
    pub occurrences: i64,
    /// Epoch ms of the last status change.
    pub status_changed_at: i64,
    /// Epoch ms the row was created.
    pub created_at: i64,
}

impl ErrorGroup {
    /// Compact representation pushed to dashboards.
    #[must_use]
    pub fn summary(&self) -> GroupSummary {
        GroupSummary {
            id: self.id.clone(),
            service: self.service.clone(),
            message: self.message.clone(),
            severity: self.severity,
            status: self.status,
            endpoint: self.endpoint.clone(),
            fingerprint: self.fingerprint.clone(),
            last_seen_at: self.last_seen_at,
            occurrences: self.occurrences,
        }
    }
}

/// The slice of an [`ErrorGroup`] that dashboards need for live updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    /// Group identifier.
    pub id: String,
    /// Service name.
    pub service: String,
    /// Error message.
    pub message: String,
    /// Current (escalated) severity.
    pub severity: Severity,
    /// Current triage status.
    pub status: GroupStatus,
    /// Extracted endpoint, if any.
    pub endpoint: Option<String>,
    /// Fingerprint of the group.
    pub fingerprint: String,
    /// Epoch ms of the most recent occurrence.
    pub last_seen_at: i64,
    /// Total occurrences.
    pub occurrences: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_escalation_order() {
        assert!(Severity::Warn < Severity::Error);
        assert!(Severity::Error < Severity::Fatal);
        assert_eq!(Severity::Error.escalate(Severity::Warn), Severity::Error);
        assert_eq!(Severity::Warn.escalate(Severity::Fatal), Severity::Fatal);
    }

    #[test]
    fn severity_parsing() {
        assert_eq!("warn".parse::<Severity>().unwrap(), Severity::Warn);
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warn);
        assert_eq!("error".parse::<Severity>().unwrap(), Severity::Error);
        assert_eq!("critical".parse::<Severity>().unwrap(), Severity::Fatal);
        assert!("info".parse::<Severity>().is_err());
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            GroupStatus::New,
            GroupStatus::Investigating,
            GroupStatus::InProgress,
            GroupStatus::Resolved,
        ] {
            assert_eq!(status.as_str().parse::<GroupStatus>().unwrap(), status);
        }
    }

    #[test]
    fn status_serde_uses_kebab_case() {
        let json = serde_json::to_string(&GroupStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn source_roundtrip() {
        for source in [ErrorSource::AutoCapture, ErrorSource::Direct] {
            assert_eq!(source.as_str().parse::<ErrorSource>().unwrap(), source);
        }
    }
}
