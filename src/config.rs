// Copyright 2024. The Tari Project

use crate::consumer::ReconnectPolicy;
use crate::realtime::RegistrySettings;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use thiserror::Error;

const LOG_TARGET: &str = "teamup::realtime::config";

/// Names a JSON file with a [`RealtimeConfig`]
pub const CONFIG_PATH_ENV: &str = "TEAMUP_REALTIME_CONFIG";

const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Address the HTTP server binds to
    pub bind_address: String,
    /// Seconds between heartbeat frames
    pub heartbeat_interval_secs: u64,
    /// Frames buffered per stream before the client counts as stalled
    pub stream_buffer: usize,
    /// Close a user's previous stream when they open another one
    pub close_displaced_streams: bool,
    /// Shared secret the identity provider signs session tokens with
    pub jwt_secret: String,
    /// Expected `aud` claim of session tokens, unchecked when unset
    pub jwt_audience: Option<String>,
    pub log_level: String,
    /// Also log to this file when set
    pub log_file: Option<PathBuf>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8787".to_string(),
            heartbeat_interval_secs: 30,
            stream_buffer: 64,
            close_displaced_streams: false,
            jwt_secret: String::new(),
            jwt_audience: None,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl RealtimeConfig {
    /// Load from the file named by `TEAMUP_REALTIME_CONFIG` (if any), then
    /// apply `TEAMUP_*` environment overrides
    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(path, |key| std::env::var(key).ok()).await
    }

    pub async fn load_from(
        path: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| ConfigError::Read {
                        path: path.clone(),
                        source,
                    })?;
                serde_json::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?
            }
            None => Self::default(),
        };

        if let Some(value) = env("TEAMUP_BIND_ADDRESS") {
            config.bind_address = value;
        }
        if let Some(value) = env("TEAMUP_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = parse_env("TEAMUP_HEARTBEAT_SECS", value)?;
        }
        if let Some(value) = env("TEAMUP_STREAM_BUFFER") {
            config.stream_buffer = parse_env("TEAMUP_STREAM_BUFFER", value)?;
        }
        if let Some(value) = env("TEAMUP_CLOSE_DISPLACED_STREAMS") {
            config.close_displaced_streams = parse_env("TEAMUP_CLOSE_DISPLACED_STREAMS", value)?;
        }
        if let Some(value) = env("TEAMUP_JWT_SECRET") {
            config.jwt_secret = value;
        }
        if let Some(value) = env("TEAMUP_JWT_AUDIENCE") {
            config.jwt_audience = Some(value).filter(|v| !v.is_empty());
        }
        if let Some(value) = env("TEAMUP_LOG_LEVEL") {
            config.log_level = value;
        }
        if let Some(value) = env("TEAMUP_LOG_FILE") {
            config.log_file = Some(PathBuf::from(value)).filter(|p| !p.as_os_str().is_empty());
        }

        Ok(config)
    }

    /// Validate security requirements for the current configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let address: SocketAddr = self
            .bind_address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bind_address {:?} is not ip:port", self.bind_address)))?;
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_secs must be positive".to_string()));
        }
        if self.stream_buffer == 0 {
            return Err(ConfigError::Invalid("stream_buffer must be positive".to_string()));
        }
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::Invalid("jwt_secret must be set".to_string()));
        }
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::Invalid(format!("unknown log_level {:?}", self.log_level)));
        }

        if self.jwt_secret.len() < MIN_SECRET_LEN {
            log::warn!(target: LOG_TARGET, "jwt_secret is shorter than {} bytes", MIN_SECRET_LEN);
        }
        if address.ip().is_unspecified() {
            log::warn!(target: LOG_TARGET, "Realtime server configured to accept connections on all interfaces");
        }
        if self.close_displaced_streams {
            log::info!(target: LOG_TARGET, "Displaced streams will be closed when a user reconnects");
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            heartbeat_interval: self.heartbeat_interval(),
            stream_buffer: self.stream_buffer,
            close_displaced_streams: self.close_displaced_streams,
        }
    }
}

/// Configuration of the `realtime-listen` client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub stream_url: String,
    pub access_token: Option<String>,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl ConsumerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    pub fn from_env_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let stream_url = env("TEAMUP_STREAM_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8787/api/messages/stream".to_string());
        let access_token = env("TEAMUP_ACCESS_TOKEN").filter(|token| !token.is_empty());
        let reconnect = match env("TEAMUP_RECONNECT_POLICY") {
            Some(value) => serde_json::from_str(&value)
                .map_err(|_| ConfigError::InvalidEnv {
                    key: "TEAMUP_RECONNECT_POLICY",
                    value,
                })?,
            None => ReconnectPolicy::default(),
        };

        Ok(Self {
            stream_url,
            access_token,
            reconnect,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn valid() -> RealtimeConfig {
        RealtimeConfig {
            jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
            ..RealtimeConfig::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = RealtimeConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.bind_address, "127.0.0.1:8787");
        assert!(!config.close_displaced_streams);
        // No secret, must not start as is
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.stream_buffer = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.bind_address = "localhost".to_string();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_env_overrides() {
        let env = env_of(&[
            ("TEAMUP_BIND_ADDRESS", "0.0.0.0:9000"),
            ("TEAMUP_HEARTBEAT_SECS", "15"),
            ("TEAMUP_CLOSE_DISPLACED_STREAMS", "true"),
            ("TEAMUP_JWT_SECRET", "secret"),
            ("TEAMUP_JWT_AUDIENCE", "authenticated"),
        ]);
        let config = RealtimeConfig::load_from(None, env).await.unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:9000");
        assert_eq!(config.heartbeat_interval_secs, 15);
        assert!(config.close_displaced_streams);
        assert_eq!(config.jwt_secret, "secret");
        assert_eq!(config.jwt_audience.as_deref(), Some("authenticated"));

        let settings = config.registry_settings();
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(15));
        assert!(settings.close_displaced_streams);
    }

    #[tokio::test]
    async fn test_bad_env_value_rejected() {
        let env = env_of(&[("TEAMUP_HEARTBEAT_SECS", "soon")]);
        let result = RealtimeConfig::load_from(None, env).await;
        assert!(matches!(
            result,
            Err(ConfigError::InvalidEnv {
                key: "TEAMUP_HEARTBEAT_SECS",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("teamup-realtime-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, r#"{"bind_address":"127.0.0.1:9999","stream_buffer":8}"#)
            .await
            .unwrap();

        let config = RealtimeConfig::load_from(Some(path.clone()), env_of(&[])).await.unwrap();
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:9999");
        assert_eq!(config.stream_buffer, 8);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("teamup-realtime-does-not-exist.json");
        let result = RealtimeConfig::load_from(Some(path), env_of(&[])).await;
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_consumer_config_from_env() {
        let config = ConsumerConfig::from_env_with(env_of(&[
            ("TEAMUP_STREAM_URL", "http://example.test/api/messages/stream"),
            ("TEAMUP_ACCESS_TOKEN", "abc"),
            ("TEAMUP_RECONNECT_POLICY", r#"{"strategy":"fixed","delay_ms":5000}"#),
        ]))
        .unwrap();

        assert_eq!(config.stream_url, "http://example.test/api/messages/stream");
        assert_eq!(config.access_token.as_deref(), Some("abc"));
        assert_eq!(config.reconnect, ReconnectPolicy::fixed(Duration::from_secs(5)));

        let defaults = ConsumerConfig::from_env_with(env_of(&[])).unwrap();
        assert_eq!(defaults.access_token, None);
        assert_eq!(defaults.reconnect, ReconnectPolicy::default());
    }
}
