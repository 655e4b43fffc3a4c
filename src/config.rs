use std::{collections::HashMap, fs::File, io::Read, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

/// Settings for a single consumer driver instance.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Upper bound on how long one demand-driven poll may block the driver
    /// thread. Every mailbox message waits behind the current poll, so this
    /// should stay in the tens of milliseconds.
    #[serde(default = "DriverConfig::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Period of the internal poll tick that keeps the client serviced when
    /// no requests or commits are arriving.
    #[serde(default = "DriverConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Name of the dedicated thread the driver runs on.
    #[serde(default = "DriverConfig::default_dispatcher")]
    pub dispatcher: String,
    /// Properties handed to the Kafka client verbatim. Must contain at
    /// least `bootstrap.servers`; `group.id` is required for subscriptions.
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl DriverConfig {
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path).context("failed to open consumer driver config")?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        Self::from_str(&contents)
    }

    fn from_str(contents: &str) -> Result<Self, anyhow::Error> {
        let config = serde_yaml::from_str::<'_, DriverConfig>(contents)?;

        Ok(config)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    fn default_poll_timeout_ms() -> u64 {
        50
    }

    fn default_poll_interval_ms() -> u64 {
        50
    }

    fn default_dispatcher() -> String {
        "kafka-consumer-driver".into()
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: Self::default_poll_timeout_ms(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            dispatcher: Self::default_dispatcher(),
            properties: HashMap::new(),
        }
    }
}
