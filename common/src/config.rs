use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    astronomy::RetryPolicy,
    time::{parse_clock_time, TimeSymbol},
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("astronomyApiCheckTime `{0}` is not a valid H:MM time")]
    InvalidCheckTime(String),
    #[error("astronomyApiUrl cannot be empty")]
    MissingAstronomyUrl,
    #[error("task time `{0}` must be sunrise, sunset or H:MM")]
    InvalidTaskTime(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfiguration {
    pub astronomy_api_url: String,
    pub astronomy_api_check_time: String,
    pub is_enabled: bool,
    pub home_only_mode_enabled: bool,
}

impl Default for SchedulerConfiguration {
    fn default() -> Self {
        Self {
            astronomy_api_url: String::new(),
            astronomy_api_check_time: "0:05".to_string(),
            is_enabled: false,
            home_only_mode_enabled: false,
        }
    }
}

impl SchedulerConfiguration {
    pub fn validate(&self, needs_astronomy: bool) -> Result<(), ConfigError> {
        if parse_clock_time(&self.astronomy_api_check_time).is_none() {
            return Err(ConfigError::InvalidCheckTime(
                self.astronomy_api_check_time.clone(),
            ));
        }
        if needs_astronomy && self.astronomy_api_url.trim().is_empty() {
            return Err(ConfigError::MissingAstronomyUrl);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub check_interval_ms: u64,
    pub time_sync_interval_ms: u64,
    pub alignment_poll_ms: u64,
    pub astronomy_retry_ms: u64,
    #[serde(default)]
    pub astronomy_max_attempts: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            time_sync_interval_ms: 86_400_000,
            alignment_poll_ms: 1_000,
            astronomy_retry_ms: 5_000,
            astronomy_max_attempts: None,
        }
    }
}

impl EngineConfig {
    pub fn sanitize(&mut self) {
        self.check_interval_ms = self.check_interval_ms.max(1_000);
        self.time_sync_interval_ms = self.time_sync_interval_ms.max(60_000);
        self.alignment_poll_ms = self.alignment_poll_ms.clamp(10, 1_000);
        self.astronomy_retry_ms = self.astronomy_retry_ms.max(100);
        if self.astronomy_max_attempts == Some(0) {
            self.astronomy_max_attempts = None;
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.astronomy_retry_ms),
            max_attempts: self.astronomy_max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub start: String,
    pub end: String,
}

impl TaskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for text in [&self.start, &self.end] {
            let valid = TimeSymbol::parse(text).is_astronomical() || parse_clock_time(text).is_some();
            if !valid {
                return Err(ConfigError::InvalidTaskTime(text.clone()));
            }
        }
        Ok(())
    }

    pub fn references_astronomy(&self) -> bool {
        TimeSymbol::parse(&self.start).is_astronomical()
            || TimeSymbol::parse(&self.end).is_astronomical()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SwitchOutputConfig {
    pub gpio_pin: i32,
    pub active_high: bool,
}

impl Default for SwitchOutputConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 5,
            active_high: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: Option<SchedulerConfiguration>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    pub timezone: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub switch: SwitchOutputConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            scheduler: None,
            tasks: Vec::new(),
            timezone: "America/Los_Angeles".to_string(),
            network: NetworkConfig::default(),
            switch: SwitchOutputConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.engine.sanitize();
        self.tasks
            .retain(|task| !task.start.trim().is_empty() && !task.end.trim().is_empty());
        if self.timezone.trim().is_empty() {
            self.timezone = RuntimeConfig::default().timezone;
        }
        if self.switch.gpio_pin < 0 {
            self.switch.gpio_pin = SwitchOutputConfig::default().gpio_pin;
        }
    }
}
