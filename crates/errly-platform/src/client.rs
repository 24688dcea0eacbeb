//! HTTP client for the platform API.
//!
//! Every unary request runs through the same guarded lifecycle: refuse if
//! the circuit breaker is open, refuse if the auth-error latch is set,
//! refuse while rate-limited, then send with a hard timeout. Responses
//! feed the breaker, the rate-limit tracker, and the auth latch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::{PlatformError, PlatformResult};
use crate::rate_limit::RateLimitTracker;
use crate::types::Deployment;

/// Default platform GraphQL endpoint.
pub const DEFAULT_API_URL: &str = "https://backboard.railway.com/graphql/v2";

/// Default log-stream endpoint.
pub const DEFAULT_LOGS_URL: &str = "https://backboard.railway.com/logs/v2";

/// Hard timeout for unary requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Platform client configuration.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// GraphQL endpoint URL.
    pub api_url: String,
    /// Log-stream endpoint URL.
    pub logs_url: String,
    /// API token.
    pub token: SecretString,
    /// Breaker thresholds.
    pub breaker: BreakerConfig,
}

impl PlatformConfig {
    /// Configuration for the public platform endpoints with this token.
    #[must_use]
    pub fn new(token: SecretString) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_owned(),
            logs_url: DEFAULT_LOGS_URL.to_owned(),
            token,
            breaker: BreakerConfig::default(),
        }
    }
}

/// Client for the platform API.
///
/// Owns the process-wide resiliency state (breaker, rate-limit tracker,
/// auth latch). Constructed at watcher start, disposed at watcher stop.
pub struct PlatformClient {
    http: reqwest::Client,
    config: PlatformConfig,
    breaker: CircuitBreaker,
    rate_limit: RateLimitTracker,
    auth_error: AtomicBool,
}

impl std::fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformClient")
            .field("api_url", &self.config.api_url)
            .field("breaker", &self.breaker.state())
            .field("auth_error", &self.auth_error.load(Ordering::Relaxed))
            .finish()
    }
}

impl PlatformClient {
    /// Create a new client.
    pub fn new(config: PlatformConfig) -> PlatformResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PlatformError::Config(e.to_string()))?;

        Ok(Self {
            http,
            breaker: CircuitBreaker::new(config.breaker.clone()),
            rate_limit: RateLimitTracker::new(),
            auth_error: AtomicBool::new(false),
            config,
        })
    }

    /// The circuit breaker, for diagnostics.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The rate-limit tracker, for diagnostics and adaptive cadence.
    #[must_use]
    pub const fn rate_limit(&self) -> &RateLimitTracker {
        &self.rate_limit
    }

    /// Whether the auth-error latch is set.
    #[must_use]
    pub fn auth_error(&self) -> bool {
        self.auth_error.load(Ordering::Relaxed)
    }

    /// Clear the auth-error latch after the operator updated the token.
    pub fn clear_auth_error(&self) {
        self.auth_error.store(false, Ordering::Relaxed);
    }

    pub(crate) fn latch_auth_error(&self) {
        if !self.auth_error.swap(true, Ordering::Relaxed) {
            tracing::error!(
                "platform rejected credentials; auto-capture disabled until the token is updated"
            );
        }
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn logs_url(&self) -> &str {
        &self.config.logs_url
    }

    pub(crate) fn bearer_token(&self) -> String {
        format!("Bearer {}", self.config.token.expose_secret())
    }

    /// Fetch all deployments of a project, newest first.
    ///
    /// The caller filters for active statuses and applies its environment
    /// and self-exclusion rules.
    pub async fn project_deployments(&self, project_id: &str) -> PlatformResult<Vec<Deployment>> {
        const QUERY: &str = r"
            query deployments($projectId: String!) {
                deployments(input: { projectId: $projectId }, first: 500) {
                    edges {
                        node {
                            id
                            status
                            serviceId
                            staticUrl
                            meta
                            service { name }
                            environment { name }
                        }
                    }
                }
            }
        ";

        let data = self
            .graphql(QUERY, json!({ "projectId": project_id }))
            .await?;

        let edges = data
            .pointer("/deployments/edges")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                PlatformError::InvalidResponse("deployments.edges missing".to_owned())
            })?;

        let mut deployments = Vec::with_capacity(edges.len());
        for edge in edges {
            let Some(node) = edge.get("node") else {
                continue;
            };
            let Some(id) = node.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let status = node
                .get("status")
                .and_then(|v| v.as_str())
                .map(|s| serde_json::from_value(serde_json::Value::String(s.to_owned())))
                .transpose()
                .map_err(|e| PlatformError::InvalidResponse(e.to_string()))?
                .unwrap_or_default();
            let service_name = node
                .pointer("/service/name")
                .and_then(|v| v.as_str())
                .unwrap_or(id)
                .to_owned();

            deployments.push(Deployment {
                id: id.to_owned(),
                service_id: node
                    .get("serviceId")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned),
                service_name,
                environment_name: node
                    .pointer("/environment/name")
                    .and_then(|v| v.as_str())
                    .map(str::to_owned),
                status,
            });
        }
        Ok(deployments)
    }

    /// Execute a GraphQL request through the guarded lifecycle.
    ///
    /// The auth latch and the rate limit are checked before the breaker is
    /// consulted: `allow_request` on an elapsed open window hands out the
    /// single half-open probe, and a request that the latch or the limit
    /// would refuse anyway must not consume it.
    pub(crate) async fn graphql(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> PlatformResult<serde_json::Value> {
        if self.auth_error() {
            return Err(PlatformError::AuthRejected);
        }
        if self.rate_limit.is_limited() {
            return Err(PlatformError::RateLimited);
        }
        self.breaker.allow_request()?;

        let response = self
            .http
            .post(&self.config.api_url)
            .header(reqwest::header::AUTHORIZATION, self.bearer_token())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.breaker.record_failure();
                return Err(PlatformError::Transport(e.to_string()));
            }
        };

        self.rate_limit.record_headers(response.headers());
        let status = response.status();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                // Auth errors do not cycle the breaker, but a granted
                // half-open probe must not be left dangling either.
                self.latch_auth_error();
                self.breaker.release_probe();
                Err(PlatformError::AuthRejected)
            }
            StatusCode::TOO_MANY_REQUESTS => {
                self.breaker.record_failure();
                Err(PlatformError::RateLimited)
            }
            s if s.is_server_error() || s.is_client_error() => {
                self.breaker.record_failure();
                Err(PlatformError::Transport(format!("platform returned {s}")))
            }
            _ => {
                let body: serde_json::Value = response.json().await.map_err(|e| {
                    self.breaker.record_failure();
                    PlatformError::Transport(e.to_string())
                })?;
                // The transport succeeded whatever the body says; record
                // it before the in-band checks so a probe always resolves.
                self.breaker.record_success();
                self.check_inband_errors(&body)?;
                body.get("data").cloned().ok_or_else(|| {
                    PlatformError::InvalidResponse("response has no data field".to_owned())
                })
            }
        }
    }

    /// GraphQL transports auth failures in-band as well; latch on those.
    fn check_inband_errors(&self, body: &serde_json::Value) -> PlatformResult<()> {
        let Some(errors) = body.get("errors").and_then(|v| v.as_array()) else {
            return Ok(());
        };
        if errors.is_empty() {
            return Ok(());
        }

        let joined = errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .collect::<Vec<_>>()
            .join("; ");
        let lowered = joined.to_lowercase();
        if ["unauthorized", "forbidden", "authentication"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            self.latch_auth_error();
            return Err(PlatformError::AuthRejected);
        }
        Err(PlatformError::Api(joined))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PlatformClient {
        PlatformClient::new(PlatformConfig::new(SecretString::from("test-token"))).unwrap()
    }

    #[tokio::test]
    async fn auth_latch_refuses_requests() {
        let c = client();
        c.latch_auth_error();
        let err = c.graphql("query { me }", json!({})).await.unwrap_err();
        assert!(matches!(err, PlatformError::AuthRejected));
    }

    #[tokio::test]
    async fn clearing_latch_restores_requests() {
        let c = client();
        c.latch_auth_error();
        assert!(c.auth_error());
        c.clear_auth_error();
        assert!(!c.auth_error());
        // The breaker was never cycled by the auth error.
        assert_eq!(c.breaker().state(), crate::CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn latched_auth_does_not_consume_the_probe() {
        let c = client();
        for _ in 0..5 {
            c.breaker().record_failure();
        }
        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        c.latch_auth_error();

        // Refused by the latch before the breaker is consulted: the
        // half-open probe slot stays available.
        let err = c.graphql("query { me }", json!({})).await.unwrap_err();
        assert!(matches!(err, PlatformError::AuthRejected));
        assert_eq!(c.breaker().state(), crate::CircuitState::Open);

        c.clear_auth_error();
        assert!(c.breaker().allow_request().is_ok());
    }

    #[tokio::test]
    async fn open_breaker_refuses_before_sending() {
        let c = client();
        for _ in 0..5 {
            c.breaker().record_failure();
        }
        let err = c.graphql("query { me }", json!({})).await.unwrap_err();
        assert!(matches!(err, PlatformError::CircuitOpen));
    }

    #[test]
    fn inband_auth_errors_latch() {
        let c = client();
        let body = json!({ "errors": [ { "message": "Not Authorized" } ] });
        // "authorized" alone does not match; "unauthorized" and friends do.
        assert!(matches!(
            c.check_inband_errors(&body),
            Err(PlatformError::Api(_))
        ));
        assert!(!c.auth_error());

        let body = json!({ "errors": [ { "message": "unauthorized request" } ] });
        assert!(matches!(
            c.check_inband_errors(&body),
            Err(PlatformError::AuthRejected)
        ));
        assert!(c.auth_error());
    }

    #[test]
    fn inband_clean_body_passes() {
        let c = client();
        assert!(c.check_inband_errors(&json!({ "data": {} })).is_ok());
        assert!(c.check_inband_errors(&json!({ "errors": [] })).is_ok());
    }
}
