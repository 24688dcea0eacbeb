//! Health and diagnostics endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::api::auth::RequireSession;
use crate::AppState;

/// Handle `GET /health` (unauthenticated).
#[tracing::instrument(skip(state))]
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let db_connected = state.store.is_healthy().await;

    let body = serde_json::json!({
        "status": if db_connected { "ok" } else { "degraded" },
        "uptime": state.started_at.elapsed().as_secs(),
        "dbConnected": db_connected,
        "autoCaptureEnabled": state.watcher.is_some(),
        "activeSubscriptions": state
            .watcher
            .as_ref()
            .map_or(0, |w| w.active_subscription_count()),
        "sseClients": state.hub.client_count(),
        "lastDiscoveryAt": state.watcher.as_ref().and_then(|w| w.last_discovery_at()),
    });

    let status = if db_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// Process memory figures, from `/proc/self/status`.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct MemoryInfo {
    /// Resident set size in bytes.
    rss_bytes: Option<u64>,
    /// Virtual size in bytes.
    vsize_bytes: Option<u64>,
}

/// Handle `GET /api/diagnostics` (session-authenticated).
#[tracing::instrument(skip(state, _session))]
pub async fn diagnostics(
    State(state): State<AppState>,
    _session: RequireSession,
) -> Json<serde_json::Value> {
    let now_ms = chrono::Utc::now().timestamp_millis();

    let platform = state.platform.as_ref().map(|platform| {
        let rate = platform.rate_limit().snapshot();
        serde_json::json!({
            "circuitState": platform.breaker().state().as_str(),
            "authError": platform.auth_error(),
            "rateLimit": {
                "remaining": rate.remaining,
                "limit": rate.limit,
                "resetsAt": rate.resets_at,
            },
        })
    });

    let subscriptions = state
        .watcher
        .as_ref()
        .map(|w| w.subscription_snapshot())
        .unwrap_or_default();

    Json(serde_json::json!({
        "platform": platform,
        "subscriptions": subscriptions,
        "errorsPerMinute": state.meter.per_minute(now_ms),
        "sseClients": state.hub.client_count(),
        "memory": read_memory(),
    }))
}

/// Parse VmRSS/VmSize out of `/proc/self/status`. Absent off Linux.
fn read_memory() -> MemoryInfo {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return MemoryInfo::default();
    };
    MemoryInfo {
        rss_bytes: parse_status_kb(&status, "VmRSS:"),
        vsize_bytes: parse_status_kb(&status, "VmSize:"),
    }
}

fn parse_status_kb(status: &str, field: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with(field))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;

    #[test]
    fn status_field_parsing() {
        let status = "Name:\terrly\nVmSize:\t  123456 kB\nVmRSS:\t    4096 kB\n";
        assert_eq!(parse_status_kb(status, "VmRSS:"), Some(4096 * 1024));
        assert_eq!(parse_status_kb(status, "VmSize:"), Some(123_456 * 1024));
        assert_eq!(parse_status_kb(status, "VmSwap:"), None);
    }

    #[tokio::test]
    async fn health_reports_db_and_clients() {
        let state = test_state().await;
        let response = health(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn diagnostics_without_watcher() {
        let state = test_state().await;
        let Json(body) =
            diagnostics(State(state), RequireSession("hash".to_owned())).await;
        assert!(body["platform"].is_null());
        assert_eq!(body["errorsPerMinute"], 0);
        assert!(body["subscriptions"].as_array().unwrap().is_empty());
    }
}
