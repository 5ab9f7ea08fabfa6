use std::fs;
use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use crate::def::Error;
use crate::transport::{Cooperative, Polling, Transport};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    #[default]
    Cooperative,
    Polling
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    pub period_ms: u64,
    pub accept_timeout_ms: u64,
    pub io_timeout_ms: u64
}

impl Default for PollConfig {
    fn default() -> Self {
        Self { period_ms: 1000, accept_timeout_ms: 100, io_timeout_ms: 1000 }
    }
}

/// Server settings. Every field is optional in the TOML source.
///
/// ```toml
/// host = "127.0.0.1"
/// port = 8080
/// debug = true
/// driver = "polling"
///
/// [poll]
/// period_ms = 500
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub driver: Driver,
    pub max_request_size: usize,
    pub poll: PollConfig
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
            debug: false,
            driver: Driver::default(),
            max_request_size: 8192,
            poll: PollConfig::default()
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        match self.driver {
            Driver::Cooperative => Box::new(Cooperative::new(self.max_request_size)),
            Driver::Polling => Box::new(
                Polling::new(Duration::from_millis(self.poll.period_ms), Duration::from_millis(self.poll.accept_timeout_ms))
                    .with_io_timeout(Duration::from_millis(self.poll.io_timeout_ms))
                    .with_max_request_size(self.max_request_size)
            )
        }
    }
}
