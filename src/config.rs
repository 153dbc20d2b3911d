//! Startup configuration, read from TOML. Every field has a default, so an
//! empty document is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sync::DEFAULT_FEED_CAPACITY;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Delimited file to watch
    pub csv_path: PathBuf,

    /// Field delimiter (single byte)
    pub delimiter: char,

    /// Quiet period before a burst of file events triggers a cycle
    pub debounce_ms: u64,

    /// Also stat the file on this interval; `None` relies on native events only
    pub poll_interval_ms: Option<u64>,

    /// Events buffered per broadcaster before it lags and resyncs
    pub feed_capacity: usize,

    pub socket: BroadcasterConfig,
    pub channels: BroadcasterConfig,
    pub pull_push: BroadcasterConfig,

    pub logging: LoggingConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            csv_path: PathBuf::from("retail_store_inventory.csv"),
            delimiter: ',',
            debounce_ms: 300,
            poll_interval_ms: Some(1000),
            feed_capacity: DEFAULT_FEED_CAPACITY,
            socket: BroadcasterConfig::on_port(8765),
            channels: BroadcasterConfig::on_port(8766),
            pull_push: BroadcasterConfig::on_port(8767),
            logging: LoggingConfig::default(),
        }
    }
}

/// Settings shared by all three broadcasters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
    /// Frames queued per client before the oldest is dropped
    pub client_buffer: usize,
    /// A client that cannot take one frame within this time is disconnected
    pub send_timeout_ms: u64,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self::on_port(0)
    }
}

impl BroadcasterConfig {
    pub fn on_port(port: u16) -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([127, 0, 0, 1], port)),
            client_buffer: 64,
            send_timeout_ms: 5000,
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `tablecast=debug`
    pub filter: String,
    /// Write a daily-rolling log file here in addition to stderr
    pub directory: Option<PathBuf>,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            directory: None,
            ansi: true,
        }
    }
}

impl StreamConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn delimiter_byte(&self) -> Result<u8, ConfigError> {
        u8::try_from(self.delimiter)
            .ok()
            .filter(|b| b.is_ascii() && *b != b'"' && *b != b'\n' && *b != b'\r')
            .ok_or_else(|| ConfigError::Invalid(format!("unusable delimiter {:?}", self.delimiter)))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    pub fn broadcasters(&self) -> [(&'static str, &BroadcasterConfig); 3] {
        [
            ("socket", &self.socket),
            ("channels", &self.channels),
            ("pull_push", &self.pull_push),
        ]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.delimiter_byte()?;

        if self.debounce_ms == 0 {
            return Err(ConfigError::Invalid("debounce_ms must be greater than zero".into()));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(ConfigError::Invalid("poll_interval_ms must be greater than zero".into()));
        }
        if self.feed_capacity == 0 {
            return Err(ConfigError::Invalid("feed_capacity must be at least 1".into()));
        }

        let enabled: Vec<_> = self.broadcasters().into_iter().filter(|(_, b)| b.enabled).collect();
        for (name, broadcaster) in &enabled {
            if broadcaster.client_buffer == 0 {
                return Err(ConfigError::Invalid(format!("{name}.client_buffer must be at least 1")));
            }
            if broadcaster.send_timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.send_timeout_ms must be greater than zero"
                )));
            }
        }

        for (i, (name, a)) in enabled.iter().enumerate() {
            for (other, b) in &enabled[i + 1..] {
                if a.bind.port() != 0 && a.bind == b.bind {
                    return Err(ConfigError::Invalid(format!(
                        "{name} and {other} both bind {}",
                        a.bind
                    )));
                }
            }
        }

        Ok(())
    }
}
