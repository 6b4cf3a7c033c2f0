//! Configuration for the tx-stream consumer.
//!
//! Loaded in layers: compiled-in defaults, then the operator's YAML file (with
//! env interpolation), then secret overrides from the environment. The result
//! is validated as a whole before anything starts.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub use txstream_core::config::{LogFormat, LoggerConfig, MetricsConfig};
use txstream_core::config::{load_layered, merge_yaml};
use txstream_core::error::YamlParseSnafu;

use crate::consumer::{ConsumerSettings, MAX_GRACE_PERIOD, RetryPolicy};
use crate::dlq::DeadLetterSettings;
use crate::error::ConfigError;

/// Embedded defaults.
pub const DEFAULT_CONFIG: &str = include_str!("default.yml");

const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Service name, used as the `service` log field.
    pub application: String,
    #[serde(default)]
    pub is_prod_mode: bool,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub retry: BackoffConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    pub store: StoreConfig,
    pub dead_letter: DeadLetterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    /// Consumer group id.
    pub consumer_name: String,
    pub topic: String,
    /// Upper bound on records handed out by one poll.
    pub records_per_poll: usize,
    /// Commit consumption positions back to Kafka.
    pub consume: bool,
    pub poll_timeout_ms: u64,
    pub session_timeout_ms: u64,
    /// Budget for poll, commit and startup connection failures.
    #[serde(default)]
    pub reconnect: BackoffConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    /// Cap on concurrently running partition workers.
    #[serde(default)]
    pub max_workers: Option<usize>,
}

/// Retry budget with exponential backoff. All fields are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Time in-flight records get to finish after a shutdown signal.
    pub grace_period_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default)]
    pub url: String,
    pub collection: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeadLetterConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    pub write_timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub backoff_ms: Option<u64>,
    pub max_in_flight: usize,
}

fn required<T: Copy>(value: Option<T>, key: &str, errors: &mut Vec<String>) -> Option<T> {
    if value.is_none() {
        errors.push(format!("{key} is required"));
    }
    value
}

impl BackoffConfig {
    /// Build the policy, or explain what is missing or out of range.
    pub fn to_policy(&self, section: &str) -> Result<RetryPolicy, Vec<String>> {
        let mut errors = Vec::new();
        let max_attempts = required(
            self.max_attempts,
            &format!("{section}.max_attempts"),
            &mut errors,
        );
        let initial = required(
            self.initial_backoff_ms,
            &format!("{section}.initial_backoff_ms"),
            &mut errors,
        );
        let max = required(
            self.max_backoff_ms,
            &format!("{section}.max_backoff_ms"),
            &mut errors,
        );

        if max_attempts == Some(0) {
            errors.push(format!("{section}.max_attempts must be at least 1"));
        }
        if let (Some(initial), Some(max)) = (initial, max) {
            if initial > max {
                errors.push(format!(
                    "{section}.initial_backoff_ms ({initial}) must not exceed max_backoff_ms ({max})"
                ));
            }
        }

        match (max_attempts, initial, max) {
            (Some(max_attempts), Some(initial), Some(max)) if errors.is_empty() => {
                Ok(RetryPolicy {
                    max_attempts,
                    initial_backoff: Duration::from_millis(initial),
                    max_backoff: Duration::from_millis(max),
                })
            }
            _ => Err(errors),
        }
    }
}

impl DeadLetterConfig {
    pub fn to_settings(&self) -> Result<DeadLetterSettings, Vec<String>> {
        let mut errors = Vec::new();
        let write_timeout = required(
            self.write_timeout_ms,
            "dead_letter.write_timeout_ms",
            &mut errors,
        );
        let max_attempts = required(self.max_attempts, "dead_letter.max_attempts", &mut errors);
        let backoff = required(self.backoff_ms, "dead_letter.backoff_ms", &mut errors);

        if write_timeout == Some(0) {
            errors.push("dead_letter.write_timeout_ms must be at least 1".to_string());
        }
        if max_attempts == Some(0) {
            errors.push("dead_letter.max_attempts must be at least 1".to_string());
        }
        if self.max_in_flight == 0 {
            errors.push("dead_letter.max_in_flight must be at least 1".to_string());
        }

        match (write_timeout, max_attempts, backoff) {
            (Some(write_timeout), Some(max_attempts), Some(backoff)) if errors.is_empty() => {
                Ok(DeadLetterSettings {
                    write_timeout: Duration::from_millis(write_timeout),
                    max_attempts,
                    backoff: Duration::from_millis(backoff),
                    max_in_flight: self.max_in_flight,
                })
            }
            _ => Err(errors),
        }
    }
}

impl Config {
    /// Load defaults, the file at `path` and environment overrides, then
    /// validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config: Config = load_layered(DEFAULT_CONFIG, path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse `yaml` on top of the defaults, without env handling or
    /// validation.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut merged: serde_yaml::Value =
            serde_yaml::from_str(DEFAULT_CONFIG).context(YamlParseSnafu)?;
        let overlay: serde_yaml::Value = serde_yaml::from_str(yaml).context(YamlParseSnafu)?;
        merge_yaml(&mut merged, overlay);
        serde_yaml::from_value(merged).context(YamlParseSnafu)
    }

    /// Apply secret overrides: `KAFKA_BROKERS` (comma separated),
    /// `STORE_URL`, `DEAD_LETTER_URL` and `IS_PROD_MODE`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(brokers) = lookup("KAFKA_BROKERS") {
            let brokers: Vec<String> = brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(String::from)
                .collect();
            if !brokers.is_empty() {
                self.kafka.brokers = brokers;
            }
        }
        if let Some(url) = lookup("STORE_URL").filter(|u| !u.is_empty()) {
            self.store.url = url;
        }
        if let Some(url) = lookup("DEAD_LETTER_URL").filter(|u| !u.is_empty()) {
            self.dead_letter.url = url;
        }
        if let Some(flag) = lookup("IS_PROD_MODE") {
            self.is_prod_mode = flag.trim().eq_ignore_ascii_case("true");
        }
    }

    /// Check every rule and report all violations together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.application.trim().is_empty() {
            errors.push("application must not be empty".to_string());
        }

        let kafka = &self.kafka;
        if kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            errors.push("kafka.brokers must list at least one broker".to_string());
        }
        if kafka.consumer_name.trim().is_empty() {
            errors.push("kafka.consumer_name must not be empty".to_string());
        }
        if kafka.topic.trim().is_empty() {
            errors.push("kafka.topic must not be empty".to_string());
        }
        if kafka.records_per_poll == 0 {
            errors.push("kafka.records_per_poll must be at least 1".to_string());
        }
        if kafka.poll_timeout_ms == 0 {
            errors.push("kafka.poll_timeout_ms must be at least 1".to_string());
        }
        if let Err(mut e) = kafka.reconnect.to_policy("kafka.reconnect") {
            errors.append(&mut e);
        }

        if self.consumer.max_workers == Some(0) {
            errors.push("consumer.max_workers must be at least 1 when set".to_string());
        }
        if let Err(mut e) = self.retry.to_policy("retry") {
            errors.append(&mut e);
        }
        match self.shutdown.grace_period_ms {
            None => errors.push("shutdown.grace_period_ms is required".to_string()),
            Some(ms) if u128::from(ms) > MAX_GRACE_PERIOD.as_millis() => errors.push(format!(
                "shutdown.grace_period_ms ({ms}) must not exceed {}",
                MAX_GRACE_PERIOD.as_millis()
            )),
            Some(_) => {}
        }

        if self.store.url.trim().is_empty() {
            errors.push("store.url is required".to_string());
        }
        if self.store.collection.trim().is_empty() {
            errors.push("store.collection must not be empty".to_string());
        }
        if self.dead_letter.url.trim().is_empty() {
            errors.push("dead_letter.url is required".to_string());
        }
        if let Err(mut e) = self.dead_letter.to_settings() {
            errors.append(&mut e);
        }

        if self.metrics.enabled && self.metrics.address.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "metrics.address '{}' is not a valid socket address",
                self.metrics.address
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MultipleErrors { errors })
        }
    }

    /// Consumer loop settings derived from the `kafka`, `consumer`, `retry`
    /// and `shutdown` sections.
    pub fn consumer_settings(&self) -> Result<ConsumerSettings, ConfigError> {
        let mut errors = Vec::new();
        let retry = self.retry.to_policy("retry").map_err(|e| errors.extend(e)).ok();
        let reconnect = self
            .kafka
            .reconnect
            .to_policy("kafka.reconnect")
            .map_err(|e| errors.extend(e))
            .ok();
        let grace = required(
            self.shutdown.grace_period_ms,
            "shutdown.grace_period_ms",
            &mut errors,
        );

        match (retry, reconnect, grace) {
            (Some(retry), Some(reconnect), Some(grace)) => Ok(ConsumerSettings {
                topic: self.kafka.topic.clone(),
                records_per_poll: self.kafka.records_per_poll.max(1),
                retry,
                reconnect,
                grace_period: Duration::from_millis(grace),
                max_workers: self.consumer.max_workers,
            }),
            _ => Err(ConfigError::MultipleErrors { errors }),
        }
    }

    pub fn dead_letter_settings(&self) -> Result<DeadLetterSettings, ConfigError> {
        self.dead_letter
            .to_settings()
            .map_err(|errors| ConfigError::MultipleErrors { errors })
    }

    /// Copy with storage credentials masked, for logging.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        for options in [
            &mut config.store.storage_options,
            &mut config.dead_letter.storage_options,
        ] {
            for value in options.values_mut() {
                *value = REDACTED.to_string();
            }
        }
        config
    }
}
