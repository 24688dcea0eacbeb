//! Wire types for the platform API.

use serde::{Deserialize, Serialize};

/// A deployment reported by the platform's discovery query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    /// Deployment identifier.
    pub id: String,
    /// Identifier of the service this deployment belongs to.
    pub service_id: Option<String>,
    /// Human-readable service name.
    pub service_name: String,
    /// Environment the deployment runs in.
    pub environment_name: Option<String>,
    /// Platform-reported status.
    pub status: DeploymentStatus,
}

/// Platform deployment status.
///
/// A deployment is worth subscribing to while it is in (or heading
/// towards) a running state; crashed and removed deployments have no live
/// log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Running normally.
    Success,
    /// Rolling out.
    Deploying,
    /// Starting up.
    Initializing,
    /// Being built.
    Building,
    /// Queued behind another rollout.
    Waiting,
    /// Scaled to zero, will wake on traffic.
    Sleeping,
    /// Crashed and not restarting.
    Crashed,
    /// Torn down.
    Removed,
    /// Build or deploy failed.
    Failed,
    /// Anything this client does not know about.
    #[default]
    #[serde(other)]
    Unknown,
}

impl DeploymentStatus {
    /// Whether a deployment in this status has (or will have) a log stream.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Deploying
                | Self::Initializing
                | Self::Building
                | Self::Waiting
                | Self::Sleeping
        )
    }
}

/// One log line from a deployment's stream.
///
/// `severity` is the platform's own level for the line, which the watcher
/// consults when the text classifier finds nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// The log message body.
    pub message: String,
    /// Platform-reported severity (`info`, `warn`, `error`, ...), if any.
    #[serde(default)]
    pub severity: Option<String>,
    /// Platform timestamp (RFC 3339), if any.
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_status_set() {
        for status in [
            DeploymentStatus::Success,
            DeploymentStatus::Deploying,
            DeploymentStatus::Initializing,
            DeploymentStatus::Building,
            DeploymentStatus::Waiting,
            DeploymentStatus::Sleeping,
        ] {
            assert!(status.is_active(), "{status:?} should be active");
        }
        for status in [
            DeploymentStatus::Crashed,
            DeploymentStatus::Removed,
            DeploymentStatus::Failed,
            DeploymentStatus::Unknown,
        ] {
            assert!(!status.is_active(), "{status:?} should be inactive");
        }
    }

    #[test]
    fn unknown_statuses_deserialise_to_unknown() {
        let status: DeploymentStatus = serde_json::from_str("\"NEEDS_APPROVAL\"").unwrap();
        assert_eq!(status, DeploymentStatus::Unknown);
    }

    #[test]
    fn log_line_tolerates_missing_fields() {
        let line: LogLine = serde_json::from_str(r#"{"message":"hello"}"#).unwrap();
        assert_eq!(line.message, "hello");
        assert!(line.severity.is_none());
    }
}
