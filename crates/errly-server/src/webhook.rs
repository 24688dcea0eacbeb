//! Webhook dispatch for new error groups.
//!
//! The configured URL is operator-supplied and therefore treated as
//! hostile: the scheme must be plain HTTP(S), the hostname must not be a
//! literal private or reserved address, and at dispatch time every A/AAAA
//! answer for the hostname is checked again so a rebinding DNS record
//! cannot steer the request into the private network.
//!
//! Dispatch is fire-and-forget: failures are logged at warn and swallowed.

use std::net::IpAddr;
use std::time::Duration;

use errly_core::GroupSummary;
use url::{Host, Url};

/// Hard timeout for webhook requests.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a webhook URL was rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WebhookUrlError {
    /// Not a parseable URL.
    #[error("malformed webhook URL: {0}")]
    Malformed(String),

    /// Scheme other than http/https.
    #[error("webhook URL scheme must be http or https")]
    BadScheme,

    /// No hostname present.
    #[error("webhook URL has no host")]
    NoHost,

    /// The host is (or resolves to) a private or reserved address.
    #[error("webhook host {0} is a private or reserved address")]
    PrivateAddress(String),

    /// The hostname did not resolve.
    #[error("webhook host did not resolve: {0}")]
    Unresolvable(String),
}

/// Validate scheme and literal host of a webhook URL.
pub fn validate_webhook_url(raw: &str) -> Result<Url, WebhookUrlError> {
    let url = Url::parse(raw).map_err(|e| WebhookUrlError::Malformed(e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(WebhookUrlError::BadScheme);
    }

    match url.host() {
        None => return Err(WebhookUrlError::NoHost),
        Some(Host::Ipv4(ip)) if is_private_ip(IpAddr::V4(ip)) => {
            return Err(WebhookUrlError::PrivateAddress(ip.to_string()));
        }
        Some(Host::Ipv6(ip)) if is_private_ip(IpAddr::V6(ip)) => {
            return Err(WebhookUrlError::PrivateAddress(ip.to_string()));
        }
        Some(Host::Domain(domain)) if domain.eq_ignore_ascii_case("localhost") => {
            return Err(WebhookUrlError::PrivateAddress(domain.to_owned()));
        }
        Some(_) => {}
    }
    Ok(url)
}

/// Resolve the URL's hostname and reject if any answer is private.
///
/// This runs at dispatch time so a DNS record cannot be swapped to a
/// private address between validation and use.
pub async fn check_resolved_addresses(url: &Url) -> Result<(), WebhookUrlError> {
    let Some(Host::Domain(domain)) = url.host() else {
        // Literal addresses were already checked.
        return Ok(());
    };
    let port = url.port_or_known_default().unwrap_or(443);

    let addrs = tokio::net::lookup_host((domain, port))
        .await
        .map_err(|e| WebhookUrlError::Unresolvable(e.to_string()))?;

    for addr in addrs {
        if is_private_ip(addr.ip()) {
            return Err(WebhookUrlError::PrivateAddress(format!(
                "{domain} -> {}",
                addr.ip()
            )));
        }
    }
    Ok(())
}

/// Whether an address belongs to a private or reserved range.
///
/// Rejected: 127/8, 10/8, 172.16/12, 192.168/16, 169.254/16, 0/8, IPv6
/// loopback/unspecified, fc00::/7, fe80::/10, and v4-mapped forms of any
/// of those.
#[must_use]
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || octets[0] == 0
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (segments[0] & 0xfe00) == 0xfc00 // fc00::/7 unique local
                || (segments[0] & 0xffc0) == 0xfe80 // fe80::/10 link local
        }
    }
}

/// Payload POSTed when a new group is created.
#[derive(Debug, serde::Serialize)]
struct WebhookPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    error: &'a GroupSummary,
    timestamp: i64,
}

/// Dispatches new-error webhooks.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    http: reqwest::Client,
}

impl WebhookDispatcher {
    /// Create a dispatcher with the hard webhook timeout.
    #[must_use]
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Send a new-error webhook. Never fails the caller: every problem is
    /// logged at warn and swallowed.
    pub async fn send_new_error(&self, raw_url: &str, summary: &GroupSummary) {
        let url = match validate_webhook_url(raw_url) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(error = %e, "webhook URL rejected");
                return;
            }
        };
        if let Err(e) = check_resolved_addresses(&url).await {
            tracing::warn!(error = %e, "webhook host rejected at dispatch time");
            return;
        }

        let payload = WebhookPayload {
            kind: "new-error",
            error: summary,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };

        match self.http.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(group_id = %summary.id, "webhook delivered");
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "webhook endpoint returned an error");
            }
            Err(e) => {
                tracing::warn!(error = %e, "webhook dispatch failed");
            }
        }
    }
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_private_literals() {
        for host in [
            "127.0.0.1",
            "10.0.0.1",
            "172.20.1.1",
            "192.168.0.1",
            "169.254.1.1",
            "0.0.0.0",
            "localhost",
            "[::1]",
            "[fc00::1]",
            "[fe80::1]",
        ] {
            let url = format!("http://{host}/hook");
            assert!(
                matches!(
                    validate_webhook_url(&url),
                    Err(WebhookUrlError::PrivateAddress(_))
                ),
                "{host} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_public_hosts() {
        assert!(validate_webhook_url("https://hooks.example.com/errly").is_ok());
        assert!(validate_webhook_url("http://93.184.216.34/hook").is_ok());
    }

    #[test]
    fn rejects_bad_schemes() {
        assert_eq!(
            validate_webhook_url("ftp://example.com/hook"),
            Err(WebhookUrlError::BadScheme)
        );
        assert_eq!(
            validate_webhook_url("file:///etc/passwd"),
            Err(WebhookUrlError::BadScheme)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            validate_webhook_url("not a url"),
            Err(WebhookUrlError::Malformed(_))
        ));
    }

    #[test]
    fn private_ip_matrix() {
        for addr in [
            "127.0.0.1",
            "10.0.0.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.0.1",
            "169.254.1.1",
            "0.0.0.0",
            "0.1.2.3",
            "::1",
            "fc00::1",
            "fdff::1",
            "fe80::1",
            "::ffff:127.0.0.1",
            "::ffff:10.0.0.5",
        ] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(is_private_ip(ip), "{addr} should be private");
        }
        for addr in ["93.184.216.34", "1.1.1.1", "172.32.0.1", "2606:4700::1111"] {
            let ip: IpAddr = addr.parse().unwrap();
            assert!(!is_private_ip(ip), "{addr} should be public");
        }
    }

    #[tokio::test]
    async fn dns_answers_are_checked() {
        // "localhost" resolves to loopback on every host; build the URL
        // directly so the literal check is bypassed and only the
        // resolution guard fires.
        let url = Url::parse("http://localhost:80/hook").unwrap();
        assert!(matches!(
            check_resolved_addresses(&url).await,
            Err(WebhookUrlError::PrivateAddress(_))
        ));
    }

    #[tokio::test]
    async fn literal_urls_skip_resolution() {
        let url = Url::parse("http://93.184.216.34/hook").unwrap();
        assert!(check_resolved_addresses(&url).await.is_ok());
    }
}
