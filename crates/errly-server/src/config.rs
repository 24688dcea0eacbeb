//! Service configuration.
//!
//! Loaded from `errly.toml` (if present) and the environment, later
//! sources overriding earlier ones. The environment names follow the
//! platform's conventions (`RAILWAY_*`) plus the service's own `ERRLY_*`
//! namespace.

use std::path::PathBuf;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path.
pub const DEFAULT_DB_PATH: &str = "./data/errly.db";

/// Default cap on concurrent log-stream subscriptions.
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 50;

/// Default cap on connected dashboard streams.
pub const DEFAULT_MAX_SSE_CLIENTS: usize = 100;

/// Environment variables the service reads.
const ENV_VARS: &[&str] = &[
    "ERRLY_PASSWORD",
    "ERRLY_DB_PATH",
    "ERRLY_MAX_SUBSCRIPTIONS",
    "ERRLY_MAX_SSE_CLIENTS",
    "RAILWAY_API_TOKEN",
    "RAILWAY_PROJECT_ID",
    "RAILWAY_ENVIRONMENT_NAME",
    "RAILWAY_SERVICE_ID",
    "PORT",
    "NODE_ENV",
];

/// Service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dashboard password. Required.
    #[serde(rename = "errly_password")]
    pub password: Option<String>,

    /// Platform API token; auto-capture is enabled when present.
    #[serde(rename = "railway_api_token")]
    pub platform_token: Option<String>,

    /// Platform project whose deployments are watched.
    #[serde(rename = "railway_project_id")]
    pub project_id: Option<String>,

    /// Only watch deployments in this environment, when set.
    #[serde(rename = "railway_environment_name")]
    pub environment_name: Option<String>,

    /// This service's own id, excluded from watching.
    #[serde(rename = "railway_service_id")]
    pub self_service_id: Option<String>,

    /// HTTP listen port.
    pub port: u16,

    /// SQLite database path.
    #[serde(rename = "errly_db_path")]
    pub db_path: PathBuf,

    /// Cap on concurrent log-stream subscriptions.
    #[serde(rename = "errly_max_subscriptions")]
    pub max_subscriptions: usize,

    /// Cap on connected dashboard streams.
    #[serde(rename = "errly_max_sse_clients")]
    pub max_sse_clients: usize,

    /// Deployment environment name (`production` enables secure cookies).
    pub node_env: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            password: None,
            platform_token: None,
            project_id: None,
            environment_name: None,
            self_service_id: None,
            port: DEFAULT_PORT,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            max_sse_clients: DEFAULT_MAX_SSE_CLIENTS,
            node_env: None,
        }
    }
}

/// Configuration errors worth refusing to boot over.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration could not be read.
    #[error("configuration error: {0}")]
    Load(String),

    /// `ERRLY_PASSWORD` is not set.
    #[error("ERRLY_PASSWORD must be set")]
    MissingPassword,
}

impl Config {
    /// Load configuration from `errly.toml` and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file("errly.toml"))
            .merge(Env::raw().only(ENV_VARS))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Enforce required values and warn about weak ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let Some(ref password) = self.password else {
            return Err(ConfigError::MissingPassword);
        };
        if password.len() < 8 {
            tracing::warn!("ERRLY_PASSWORD is shorter than 8 characters");
        }
        if self.platform_token.is_some() && self.project_id.is_none() {
            tracing::warn!(
                "RAILWAY_API_TOKEN is set but RAILWAY_PROJECT_ID is not; auto-capture disabled"
            );
        }
        Ok(())
    }

    /// Whether the log watcher should run.
    #[must_use]
    pub const fn auto_capture_enabled(&self) -> bool {
        self.platform_token.is_some() && self.project_id.is_some()
    }

    /// Whether we are running in production mode.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.node_env.as_deref() == Some("production")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.db_path, PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.max_subscriptions, DEFAULT_MAX_SUBSCRIPTIONS);
        assert_eq!(config.max_sse_clients, DEFAULT_MAX_SSE_CLIENTS);
        assert!(!config.auto_capture_enabled());
    }

    #[test]
    fn validation_requires_password() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPassword)
        ));

        let config = Config {
            password: Some("hunter2hunter2".to_owned()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn auto_capture_needs_token_and_project() {
        let config = Config {
            platform_token: Some("token".to_owned()),
            ..Default::default()
        };
        assert!(!config.auto_capture_enabled());

        let config = Config {
            platform_token: Some("token".to_owned()),
            project_id: Some("proj".to_owned()),
            ..Default::default()
        };
        assert!(config.auto_capture_enabled());
    }

    #[test]
    fn production_detection() {
        let config = Config {
            node_env: Some("production".to_owned()),
            ..Default::default()
        };
        assert!(config.is_production());
        assert!(!Config::default().is_production());
    }
}
