// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! `BrokerConfig` gathers everything the queue setup needs from the
//! environment in one place. It is resolved once at startup and passed down
//! explicitly; nothing deeper in the crate reads the process environment.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use ::config::{Config, Environment};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

pub const ENV_RABBIT_HOST: &str = "RABBIT_HOST";
pub const ENV_RABBIT_PORT: &str = "RABBIT_PORT";
pub const ENV_RABBIT_USER: &str = "RABBIT_USER";
pub const ENV_RABBIT_PASSWORD: &str = "RABBIT_PASSWORD";
pub const ENV_RABBIT_VHOST: &str = "RABBIT_VHOST";
pub const ENV_APP_NAME: &str = "APP_NAME";
pub const ENV_DEFAULT_QUEUE_NAME: &str = "DEFAULT_QUEUE_NAME";
pub const ENV_DEFAULT_EXCHANGE: &str = "DEFAULT_EXCHANGE";
pub const ENV_DEFAULT_EXCHANGE_TYPE: &str = "DEFAULT_EXCHANGE_TYPE";

/// Connection and default-topology settings for a broker.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Used as the connection name and as the `app_id` of published messages.
    pub app_name: String,
    pub default_queue: String,
    pub default_exchange: String,
    pub default_exchange_kind: ExchangeKind,
    /// Heartbeat negotiated with the broker, in seconds.
    pub heartbeat: u16,
    /// Pause between two connection attempts.
    pub reconnect_interval: Duration,
    /// How many connection drops a publisher tolerates before it stops reconnecting.
    pub max_reconnect_attempts: u32,
}

/// Broker settings as found in the environment; missing keys keep defaults.
///
/// The environment source lowercases variable names, so `RABBIT_HOST` lands
/// in `rabbit_host`.
#[derive(Debug, Default, Deserialize)]
struct PartialBrokerConfig {
    #[serde(rename = "rabbit_host")]
    host: Option<String>,
    #[serde(rename = "rabbit_port")]
    port: Option<u16>,
    #[serde(rename = "rabbit_user")]
    user: Option<String>,
    #[serde(rename = "rabbit_password")]
    password: Option<String>,
    #[serde(rename = "rabbit_vhost")]
    vhost: Option<String>,
    app_name: Option<String>,
    #[serde(rename = "default_queue_name")]
    default_queue: Option<String>,
    default_exchange: Option<String>,
    #[serde(rename = "default_exchange_type")]
    default_exchange_kind: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            app_name: String::new(),
            default_queue: String::new(),
            default_exchange: String::new(),
            default_exchange_kind: ExchangeKind::Direct,
            heartbeat: 10,
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 3,
        }
    }
}

impl BrokerConfig {
    /// Loads a `.env` file when one exists, then reads the environment.
    pub fn from_dotenv() -> Result<BrokerConfig, AmqpError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!(path = path.display().to_string(), "loaded .env file"),
            Err(err) => debug!(error = err.to_string(), "no .env file loaded"),
        }

        BrokerConfig::from_env()
    }

    /// Builds the configuration from the process environment.
    ///
    /// Unset or empty variables keep their default value. An unparsable port
    /// or exchange kind is reported as `AmqpError::ConfigError`.
    pub fn from_env() -> Result<BrokerConfig, AmqpError> {
        let partial: PartialBrokerConfig = Config::builder()
            .add_source(Environment::default().ignore_empty(true))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(|err| AmqpError::ConfigError(err.to_string()))?;

        let default = BrokerConfig::default();

        Ok(BrokerConfig {
            host: partial.host.unwrap_or(default.host),
            port: partial.port.unwrap_or(default.port),
            user: partial.user.unwrap_or(default.user),
            password: partial.password.unwrap_or(default.password),
            vhost: partial.vhost.unwrap_or(default.vhost),
            app_name: partial.app_name.unwrap_or(default.app_name),
            default_queue: partial.default_queue.unwrap_or(default.default_queue),
            default_exchange: partial.default_exchange.unwrap_or(default.default_exchange),
            default_exchange_kind: match partial.default_exchange_kind {
                Some(kind) => kind.parse()?,
                None => default.default_exchange_kind,
            },
            ..default
        })
    }

    /// The broker address used to dial RabbitMQ.
    ///
    /// Credentials and vhost are carried as plain fields, so reserved URI
    /// characters in them need no escaping. An empty vhost selects `/`.
    pub fn amqp_uri(&self) -> AMQPUri {
        let vhost = if self.vhost.is_empty() {
            "/".to_owned()
        } else {
            self.vhost.clone()
        };

        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost,
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat),
                ..AMQPQueryString::default()
            },
        }
    }
}
