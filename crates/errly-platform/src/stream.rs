//! Log-stream subscriptions.
//!
//! A subscription is a lazy sequence of log-line batches: the consumer
//! drains [`LogSubscription::next_batch`] cooperatively until it returns
//! `None` or the consumer calls [`LogSubscription::cancel`]. Behind it, a
//! background task reads the platform's chunked NDJSON stream and
//! reconnects on failure with exponential backoff (1 s doubling, capped at
//! 60 s, at most 10 attempts); a successful connect resets the budget.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::PlatformClient;
use crate::types::LogLine;

/// Initial reconnect delay.
const RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Maximum reconnect delay.
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// Reconnect attempts before the subscription gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Batches buffered between the reader task and the consumer.
const BATCH_CHANNEL_CAPACITY: usize = 32;

/// A live subscription to one deployment's log stream.
#[derive(Debug)]
pub struct LogSubscription {
    rx: mpsc::Receiver<Vec<LogLine>>,
    cancel: CancellationToken,
}

impl LogSubscription {
    /// Receive the next batch of log lines.
    ///
    /// Returns `None` once the stream has ended (cancellation, exhausted
    /// reconnect budget, or auth rejection).
    pub async fn next_batch(&mut self) -> Option<Vec<LogLine>> {
        self.rx.recv().await
    }

    /// Signal the producer to stop. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl PlatformClient {
    /// Open a log-stream subscription for one deployment.
    #[must_use]
    pub fn subscribe_logs(&self, deployment_id: &str) -> LogSubscription {
        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let task = StreamTask {
            http: self.http_client().clone(),
            url: format!("{}?deploymentId={deployment_id}", self.logs_url()),
            authorization: self.bearer_token(),
            deployment_id: deployment_id.to_owned(),
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        LogSubscription { rx, cancel }
    }
}

struct StreamTask {
    http: reqwest::Client,
    url: String,
    authorization: String,
    deployment_id: String,
    tx: mpsc::Sender<Vec<LogLine>>,
    cancel: CancellationToken,
}

impl StreamTask {
    async fn run(self) {
        let mut attempts: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.consume_once().await {
                StreamEnd::Cancelled => return,
                StreamEnd::AuthRejected => {
                    tracing::warn!(
                        deployment_id = %self.deployment_id,
                        "log stream rejected credentials; closing subscription"
                    );
                    return;
                }
                StreamEnd::Connected => {
                    // The stream delivered data before dropping; the
                    // reconnect budget starts over.
                    attempts = 0;
                }
                StreamEnd::Failed => {}
            }

            attempts += 1;
            if attempts > MAX_RECONNECT_ATTEMPTS {
                tracing::warn!(
                    deployment_id = %self.deployment_id,
                    attempts = MAX_RECONNECT_ATTEMPTS,
                    "log stream reconnect budget exhausted"
                );
                return;
            }

            let delay = reconnect_delay(attempts);
            tracing::debug!(
                deployment_id = %self.deployment_id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "log stream reconnecting"
            );
            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Connect once and pump batches until the stream drops.
    async fn consume_once(&self) -> StreamEnd {
        let response = tokio::select! {
            () = self.cancel.cancelled() => return StreamEnd::Cancelled,
            result = self
                .http
                .get(&self.url)
                .header(reqwest::header::AUTHORIZATION, self.authorization.as_str())
                .send() => result,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(deployment_id = %self.deployment_id, error = %e, "log stream connect failed");
                return StreamEnd::Failed;
            }
        };

        match response.status() {
            s if s == reqwest::StatusCode::UNAUTHORIZED || s == reqwest::StatusCode::FORBIDDEN => {
                return StreamEnd::AuthRejected;
            }
            s if !s.is_success() => {
                tracing::debug!(deployment_id = %self.deployment_id, status = %s, "log stream connect refused");
                return StreamEnd::Failed;
            }
            _ => {}
        }

        let mut body = response.bytes_stream();
        let mut carry = String::new();
        let mut delivered = false;

        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return StreamEnd::Cancelled,
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    let batch = parse_ndjson(&mut carry, &bytes);
                    if batch.is_empty() {
                        continue;
                    }
                    delivered = true;
                    // Cooperative backpressure: wait for the consumer.
                    tokio::select! {
                        () = self.cancel.cancelled() => return StreamEnd::Cancelled,
                        sent = self.tx.send(batch) => {
                            if sent.is_err() {
                                // Consumer dropped the subscription.
                                return StreamEnd::Cancelled;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(deployment_id = %self.deployment_id, error = %e, "log stream read failed");
                    return if delivered { StreamEnd::Connected } else { StreamEnd::Failed };
                }
                None => {
                    return if delivered { StreamEnd::Connected } else { StreamEnd::Failed };
                }
            }
        }
    }
}

enum StreamEnd {
    Cancelled,
    AuthRejected,
    Connected,
    Failed,
}

/// Exponential backoff: 1 s doubling per attempt, capped at 60 s.
fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 1_u64 << attempt.saturating_sub(1).min(6);
    RECONNECT_CAP.min(RECONNECT_BASE * u32::try_from(factor).unwrap_or(u32::MAX))
}

/// Split a chunk into complete NDJSON log lines, carrying any partial
/// trailing line over to the next chunk.
fn parse_ndjson(carry: &mut String, chunk: &[u8]) -> Vec<LogLine> {
    carry.push_str(&String::from_utf8_lossy(chunk));

    let mut lines = Vec::new();
    while let Some(pos) = carry.find('\n') {
        let raw: String = carry.drain(..=pos).collect();
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogLine>(raw) {
            Ok(line) => lines.push(line),
            Err(_) => {
                // Not JSON: surface the raw text as a plain message so the
                // classifier still sees it.
                lines.push(LogLine {
                    message: raw.to_owned(),
                    severity: None,
                    timestamp: None,
                });
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(4));
        assert_eq!(reconnect_delay(6), Duration::from_secs(32));
        assert_eq!(reconnect_delay(7), Duration::from_secs(60));
        assert_eq!(reconnect_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn ndjson_parses_complete_lines() {
        let mut carry = String::new();
        let lines = parse_ndjson(
            &mut carry,
            b"{\"message\":\"a\",\"severity\":\"info\"}\n{\"message\":\"b\"}\n",
        );
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "a");
        assert_eq!(lines[0].severity.as_deref(), Some("info"));
        assert_eq!(lines[1].message, "b");
        assert!(carry.is_empty());
    }

    #[test]
    fn ndjson_carries_partial_lines() {
        let mut carry = String::new();
        let lines = parse_ndjson(&mut carry, b"{\"message\":\"a\"}\n{\"mess");
        assert_eq!(lines.len(), 1);
        assert_eq!(carry, "{\"mess");

        let lines = parse_ndjson(&mut carry, b"age\":\"b\"}\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "b");
        assert!(carry.is_empty());
    }

    #[test]
    fn ndjson_falls_back_to_raw_text() {
        let mut carry = String::new();
        let lines = parse_ndjson(&mut carry, b"plain text error line\n");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "plain text error line");
    }

    #[tokio::test]
    async fn cancelled_subscription_ends() {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mut sub = LogSubscription { rx, cancel };
        sub.cancel();
        drop(tx);
        assert!(sub.next_batch().await.is_none());
    }
}
