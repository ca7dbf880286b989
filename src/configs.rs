// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Settings for the broker connection and the consumer defaults. Values are
//! read from `RABBITMQ_*` environment variables, optionally seeded from a
//! `.env` file.

use crate::errors::AmqpError;
use config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

pub const DEFAULT_URI: &str = "amqp://localhost:5672";
pub const DEFAULT_CONNECTION_NAME: &str = "paystream";
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;
pub const DEFAULT_PREFETCH: u16 = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Connection and consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RabbitMQConfigs {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_uri() -> String {
    DEFAULT_URI.to_owned()
}

fn default_connection_name() -> String {
    DEFAULT_CONNECTION_NAME.to_owned()
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

fn default_prefetch() -> u16 {
    DEFAULT_PREFETCH
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            uri: default_uri(),
            connection_name: default_connection_name(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            prefetch: default_prefetch(),
            max_retries: default_max_retries(),
        }
    }
}

impl RabbitMQConfigs {
    /// Loads `.env` (when present) and then the `RABBITMQ_*` environment variables.
    pub fn load() -> Result<RabbitMQConfigs, AmqpError> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    /// Reads the `RABBITMQ_*` environment variables, falling back to the defaults.
    pub fn from_env() -> Result<RabbitMQConfigs, AmqpError> {
        let cfg: RabbitMQConfigs = Config::builder()
            .add_source(Environment::with_prefix("RABBITMQ").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to load rabbitmq configs");
                AmqpError::ConfigError(err.to_string())
            })?;

        if cfg.prefetch == 0 {
            return Err(AmqpError::ConfigError("prefetch must be at least 1".to_owned()));
        }

        Ok(cfg)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}
