use crate::error::PubnubError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_ORIGIN: &str = "ps.pndsn.com";
pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_REQUEST_CAPACITY: usize = 4096;
pub const DEFAULT_REPLY_CAPACITY: usize = 32_000;
pub const DEFAULT_MAX_REPLY_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 310_000;
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_WAIT_INTERVAL_MS: u64 = 200;
pub const DEFAULT_THREAD_NAME: &str = "pubnub-ntf";

/// Smallest request buffer that can hold a subscribe path plus the SDK tag.
const MIN_REQUEST_CAPACITY: usize = 128;

/// Per-client settings: keys, endpoint and buffer sizing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
#[non_exhaustive]
pub struct ContextConfig {
    pub origin: String,
    pub port: u16,
    pub publish_key: Option<String>,
    pub subscribe_key: Option<String>,
    pub uuid: Option<String>,
    pub auth: Option<String>,
    pub request_capacity: usize,
    pub reply_capacity: usize,
    pub max_reply_bytes: usize,
    pub transaction_timeout_ms: u64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_owned(),
            port: DEFAULT_PORT,
            publish_key: None,
            subscribe_key: None,
            uuid: None,
            auth: None,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            reply_capacity: DEFAULT_REPLY_CAPACITY,
            max_reply_bytes: DEFAULT_MAX_REPLY_BYTES,
            transaction_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
        }
    }
}

impl ContextConfig {
    pub fn with_keys(publish_key: impl Into<String>, subscribe_key: impl Into<String>) -> Self {
        Self {
            publish_key: Some(publish_key.into()),
            subscribe_key: Some(subscribe_key.into()),
            ..Self::default()
        }
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), PubnubError> {
        if self.origin.trim().is_empty() {
            return Err(PubnubError::config("origin must not be empty"));
        }
        if self.port == 0 {
            return Err(PubnubError::config("port must be greater than zero"));
        }
        if self.request_capacity < MIN_REQUEST_CAPACITY {
            return Err(PubnubError::config(format!(
                "request_capacity must be at least {MIN_REQUEST_CAPACITY} bytes"
            )));
        }
        if self.reply_capacity == 0 {
            return Err(PubnubError::config("reply_capacity must be greater than zero"));
        }
        if self.max_reply_bytes < self.reply_capacity {
            return Err(PubnubError::config("max_reply_bytes must not be below reply_capacity"));
        }
        if self.transaction_timeout_ms == 0 {
            return Err(PubnubError::config("transaction_timeout_ms must be greater than zero"));
        }
        for (field, value) in [
            ("publish_key", &self.publish_key),
            ("subscribe_key", &self.subscribe_key),
            ("uuid", &self.uuid),
            ("auth", &self.auth),
        ] {
            if value.as_deref().is_some_and(|value| value.trim().is_empty()) {
                return Err(PubnubError::config(format!("{field} must not be blank when set")));
            }
        }
        Ok(())
    }
}

/// Settings for the notification engine's worker thread.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
#[non_exhaustive]
pub struct EngineConfig {
    pub poll_timeout_ms: u64,
    pub wait_interval_ms: u64,
    pub thread_stack_size_kb: Option<usize>,
    pub thread_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            wait_interval_ms: DEFAULT_WAIT_INTERVAL_MS,
            thread_stack_size_kb: None,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl EngineConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    pub fn validate(&self) -> Result<(), PubnubError> {
        if self.poll_timeout_ms == 0 || self.wait_interval_ms == 0 {
            return Err(PubnubError::config(
                "poll_timeout_ms and wait_interval_ms must be greater than zero",
            ));
        }
        if self.thread_stack_size_kb == Some(0) {
            return Err(PubnubError::config("thread_stack_size_kb must be greater than zero"));
        }
        if self.thread_name.trim().is_empty() {
            return Err(PubnubError::config("thread_name must not be empty"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    pub context: ContextConfig,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, PubnubError> {
        let config: Self =
            toml::from_str(raw).map_err(|err| PubnubError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PubnubError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            PubnubError::config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), PubnubError> {
        self.context.validate()?;
        self.engine.validate()
    }
}
