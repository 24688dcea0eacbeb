//! Errly platform client - transport to the hosting platform's API.
//!
//! Provides unary GraphQL requests (project and deployment discovery) and
//! long-lived log-stream subscriptions, wrapped in the resiliency layer the
//! rest of the service relies on:
//!
//! - a three-state **circuit breaker** insulating the platform from retry
//!   storms ([`breaker`]),
//! - **rate-limit accounting** from response headers ([`rate_limit`]),
//! - a sticky **auth-error latch**: once the platform rejects credentials,
//!   no further request is attempted until an operator intervenes.
//!
//! All of this state lives in one [`PlatformClient`] value constructed at
//! watcher start and disposed at watcher stop; nothing here is a global.

pub mod breaker;
pub mod client;
pub mod error;
pub mod rate_limit;
pub mod stream;
pub mod types;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use client::{PlatformClient, PlatformConfig};
pub use error::{PlatformError, PlatformResult};
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};
pub use stream::LogSubscription;
pub use types::{Deployment, DeploymentStatus, LogLine};
