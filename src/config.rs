use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{failure::MAX_RETRIES, models::retry::RetryConfig};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_work_exchange")]
    pub work_exchange: String,
    #[serde(default = "default_retry_exchange")]
    pub retry_exchange: String,
    #[serde(default = "default_dead_letter_exchange")]
    pub dead_letter_exchange: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    /// Time-to-live of the retry queues, i.e. the fixed delay before a
    /// retried message re-enters its work queue.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    pub database_url: String,

    pub email_gateway_url: Option<String>,
    pub sms_gateway_url: Option<String>,
    #[serde(default = "default_gateway_timeout_seconds")]
    pub gateway_timeout_seconds: u64,

    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    #[serde(default = "default_initial_write_delay_ms")]
    pub initial_write_delay_ms: u64,
    #[serde(default = "default_max_write_delay_ms")]
    pub max_write_delay_ms: u64,
    #[serde(default = "default_write_backoff_multiplier")]
    pub write_backoff_multiplier: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    #[serde(default)]
    pub log_json: bool,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config = envy::from_iter::<_, Self>(vars)
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.prefetch_count == 0 {
            return Err(anyhow!("PREFETCH_COUNT must be at least 1"));
        }

        if self.max_write_attempts == 0 {
            return Err(anyhow!("MAX_WRITE_ATTEMPTS must be at least 1"));
        }

        let exchanges = [
            &self.work_exchange,
            &self.retry_exchange,
            &self.dead_letter_exchange,
        ];
        if exchanges.iter().any(|name| name.is_empty()) {
            return Err(anyhow!("Exchange names cannot be empty"));
        }
        if self.work_exchange == self.retry_exchange
            || self.work_exchange == self.dead_letter_exchange
            || self.retry_exchange == self.dead_letter_exchange
        {
            return Err(anyhow!(
                "Work, retry and dead-letter exchanges must be distinct"
            ));
        }

        Ok(())
    }

    /// Backoff used for local retries of outcome writes.
    pub fn write_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_write_attempts,
            initial_delay_ms: self.initial_write_delay_ms,
            max_delay_ms: self.max_write_delay_ms,
            backoff_multiplier: self.write_backoff_multiplier,
        }
    }
}

fn default_work_exchange() -> String {
    "notifications_topic".to_string()
}

fn default_retry_exchange() -> String {
    "notifications_retry".to_string()
}

fn default_dead_letter_exchange() -> String {
    "notifications_dlx".to_string()
}

fn default_prefetch_count() -> u16 {
    1
}

fn default_retry_delay_ms() -> u32 {
    5_000
}

fn default_max_retries() -> u32 {
    MAX_RETRIES
}

fn default_gateway_timeout_seconds() -> u64 {
    10
}

fn default_max_write_attempts() -> u32 {
    3
}

fn default_initial_write_delay_ms() -> u64 {
    100
}

fn default_max_write_delay_ms() -> u64 {
    2_000
}

fn default_write_backoff_multiplier() -> u64 {
    2
}

fn default_server_port() -> u16 {
    8080
}
