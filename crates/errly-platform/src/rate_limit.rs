//! Rate-limit accounting from platform response headers.
//!
//! The platform reports its budget in `x-ratelimit-remaining`,
//! `x-ratelimit-limit`, and `x-ratelimit-reset`. The tracker records the
//! latest values and refuses requests while the budget is exhausted; the
//! log watcher also reads the snapshot to slow its discovery cadence
//! before the budget runs out.

use std::sync::Mutex;

use reqwest::header::HeaderMap;

/// Latest rate-limit information reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    /// Requests remaining in the current window.
    pub remaining: Option<i64>,
    /// Total requests allowed per window.
    pub limit: Option<i64>,
    /// Epoch ms at which the window resets.
    pub resets_at: Option<i64>,
}

impl RateLimitSnapshot {
    /// Fraction of the budget still available, if both numbers are known.
    #[must_use]
    pub fn available_fraction(&self) -> Option<f64> {
        match (self.remaining, self.limit) {
            (Some(remaining), Some(limit)) if limit > 0 => {
                #[allow(clippy::cast_precision_loss)]
                Some(remaining as f64 / limit as f64)
            }
            _ => None,
        }
    }
}

/// Tracks the platform's rate-limit budget across requests.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    inner: Mutex<RateLimitSnapshot>,
}

impl RateLimitTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the rate-limit headers of a response.
    pub fn record_headers(&self, headers: &HeaderMap) {
        let remaining = header_i64(headers, "x-ratelimit-remaining");
        let limit = header_i64(headers, "x-ratelimit-limit");
        let resets_at = header_i64(headers, "x-ratelimit-reset").map(reset_to_epoch_ms);

        let mut inner = self.inner.lock().expect("rate limit lock poisoned");
        if remaining.is_some() {
            inner.remaining = remaining;
        }
        if limit.is_some() {
            inner.limit = limit;
        }
        if resets_at.is_some() {
            inner.resets_at = resets_at;
        }
    }

    /// Whether the budget is exhausted and the window has not reset yet.
    #[must_use]
    pub fn is_limited(&self) -> bool {
        let inner = self.inner.lock().expect("rate limit lock poisoned");
        match (inner.remaining, inner.resets_at) {
            (Some(remaining), Some(resets_at)) => {
                remaining <= 0 && chrono::Utc::now().timestamp_millis() < resets_at
            }
            _ => false,
        }
    }

    /// Current snapshot, for diagnostics and the adaptive discovery cadence.
    #[must_use]
    pub fn snapshot(&self) -> RateLimitSnapshot {
        *self.inner.lock().expect("rate limit lock poisoned")
    }
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// The reset header is epoch seconds; values too small to be an epoch are
/// treated as seconds-from-now.
fn reset_to_epoch_ms(reset: i64) -> i64 {
    const EPOCH_CUTOVER: i64 = 1_000_000_000;
    if reset >= EPOCH_CUTOVER {
        reset * 1000
    } else {
        chrono::Utc::now().timestamp_millis() + reset * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(remaining: &str, limit: &str, reset: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from_str(remaining).unwrap(),
        );
        map.insert(
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderValue::from_str(limit).unwrap(),
        );
        map.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from_str(reset).unwrap(),
        );
        map
    }

    #[test]
    fn parses_headers() {
        let tracker = RateLimitTracker::new();
        tracker.record_headers(&headers("42", "100", "60"));
        let snap = tracker.snapshot();
        assert_eq!(snap.remaining, Some(42));
        assert_eq!(snap.limit, Some(100));
        assert!(snap.resets_at.is_some());
    }

    #[test]
    fn limited_when_exhausted_and_window_open() {
        let tracker = RateLimitTracker::new();
        tracker.record_headers(&headers("0", "100", "3600"));
        assert!(tracker.is_limited());
    }

    #[test]
    fn not_limited_after_window_reset() {
        let tracker = RateLimitTracker::new();
        let past_epoch = (chrono::Utc::now().timestamp() - 60).to_string();
        tracker.record_headers(&headers("0", "100", &past_epoch));
        assert!(!tracker.is_limited());
    }

    #[test]
    fn not_limited_with_budget() {
        let tracker = RateLimitTracker::new();
        tracker.record_headers(&headers("10", "100", "3600"));
        assert!(!tracker.is_limited());
    }

    #[test]
    fn missing_headers_leave_previous_values() {
        let tracker = RateLimitTracker::new();
        tracker.record_headers(&headers("42", "100", "60"));
        tracker.record_headers(&HeaderMap::new());
        assert_eq!(tracker.snapshot().remaining, Some(42));
    }

    #[test]
    fn available_fraction() {
        let snap = RateLimitSnapshot {
            remaining: Some(25),
            limit: Some(100),
            resets_at: None,
        };
        assert!((snap.available_fraction().unwrap() - 0.25).abs() < f64::EPSILON);
        assert!(RateLimitSnapshot::default().available_fraction().is_none());
    }
}
