// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Setup Construction
//!
//! `SetupBuilder` collects the configuration of one setup and resolves it,
//! once, into an immutable `SetupDefinition`. Queue and exchange names fall
//! back to the defaults of `BrokerConfig`; a setup without any queue name is
//! rejected here, before anything touches the broker.
//!
//! ```ignore
//! let cfg = BrokerConfig::from_env()?;
//! let definition = SetupBuilder::new(&cfg, "orders-events", "orders")
//!     .exchange(ExchangeDefinition::new("").fanout())
//!     .queue(QueueDefinition::new().durable().with_dlq())
//!     .build()?;
//!
//! let consumer = QueueConsumer::start(definition, Arc::new(LapinConnector::new(&cfg))).await?;
//! consumer.consume(handler_fn(|msg| async move { Ok(()) })).await?;
//! consumer.wait_for_signal_and_shutdown().await;
//! ```

use crate::{
    config::BrokerConfig,
    consumer::ConsumerDefinition,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    publisher::PublisherDefinition,
    queue::{QueueBinding, QueueDefinition},
    retry::{RequeueWithCount, RetryPolicy},
    topology::Topology,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything a running setup needs, resolved and immutable.
#[derive(Clone)]
pub struct SetupDefinition {
    pub(crate) topology: Topology,
    pub(crate) consumer: ConsumerDefinition,
    pub(crate) publisher: PublisherDefinition,
    pub(crate) retry: Arc<dyn RetryPolicy>,
    pub(crate) parent: Option<CancellationToken>,
    pub(crate) reconnect_interval: Duration,
    pub(crate) max_reconnect_attempts: u32,
}

impl SetupDefinition {
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn consumer(&self) -> &ConsumerDefinition {
        &self.consumer
    }

    pub fn publisher(&self) -> &PublisherDefinition {
        &self.publisher
    }
}

pub struct SetupBuilder {
    exchange_name: String,
    queue_name: String,
    default_exchange: String,
    default_queue: String,
    default_kind: ExchangeKind,
    exchange: Option<ExchangeDefinition>,
    queue: QueueDefinition,
    binding: QueueBinding,
    consumer: ConsumerDefinition,
    publisher: PublisherDefinition,
    retry: Option<Arc<dyn RetryPolicy>>,
    parent: Option<CancellationToken>,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
}

impl SetupBuilder {
    /// Starts a setup for `queue_name`, optionally routed through `exchange_name`.
    ///
    /// Empty names are resolved against the configured defaults by `build`.
    pub fn new(cfg: &BrokerConfig, exchange_name: &str, queue_name: &str) -> SetupBuilder {
        SetupBuilder {
            exchange_name: exchange_name.to_owned(),
            queue_name: queue_name.to_owned(),
            default_exchange: cfg.default_exchange.clone(),
            default_queue: cfg.default_queue.clone(),
            default_kind: cfg.default_exchange_kind.clone(),
            exchange: None,
            queue: QueueDefinition::default(),
            binding: QueueBinding::default(),
            consumer: ConsumerDefinition::default(),
            publisher: PublisherDefinition::new(&cfg.app_name),
            retry: None,
            parent: None,
            reconnect_interval: cfg.reconnect_interval,
            max_reconnect_attempts: cfg.max_reconnect_attempts,
        }
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queue = def;
        self
    }

    /// Declares an exchange; an empty name selects the configured default exchange.
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchange = Some(def);
        self
    }

    pub fn binding(mut self, binding: QueueBinding) -> Self {
        self.binding = binding;
        self
    }

    pub fn consumer(mut self, def: ConsumerDefinition) -> Self {
        self.consumer = def;
        self
    }

    pub fn publisher(mut self, def: PublisherDefinition) -> Self {
        self.publisher = def;
        self
    }

    /// Replaces the default requeue-with-count policy for failed deliveries.
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Ties the setup to a parent token; cancelling it stops reconnects and dispatch.
    pub fn cancellation(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn build(self) -> Result<SetupDefinition, AmqpError> {
        let queue_name = if self.queue_name.is_empty() {
            self.default_queue
        } else {
            self.queue_name
        };
        if queue_name.is_empty() {
            return Err(AmqpError::InvalidQueueName);
        }

        let exchange = match self.exchange {
            Some(mut def) => {
                if def.name.is_empty() {
                    def.name = if self.exchange_name.is_empty() {
                        self.default_exchange
                    } else {
                        self.exchange_name
                    };
                }
                Some(def)
            }
            None if !self.exchange_name.is_empty() => {
                Some(ExchangeDefinition::new(&self.exchange_name).kind(self.default_kind))
            }
            None => None,
        }
        .filter(|def| !def.name.is_empty());

        info!(
            queue = queue_name.as_str(),
            exchange = exchange.as_ref().map(|def| def.name.as_str()).unwrap_or_default(),
            "queue setup resolved"
        );

        Ok(SetupDefinition {
            topology: Topology {
                exchange,
                queue_name,
                queue: self.queue,
                binding: self.binding,
            },
            consumer: self.consumer,
            publisher: self.publisher,
            retry: self
                .retry
                .unwrap_or_else(|| Arc::new(RequeueWithCount::default())),
            parent: self.parent,
            reconnect_interval: self.reconnect_interval,
            max_reconnect_attempts: self.max_reconnect_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BrokerConfig {
        BrokerConfig {
            app_name: "billing".to_owned(),
            default_queue: "billing-default".to_owned(),
            default_exchange: "billing-events".to_owned(),
            default_exchange_kind: ExchangeKind::Topic,
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn empty_queue_name_uses_configured_default() {
        let def = SetupBuilder::new(&config(), "", "").build().unwrap();

        assert_eq!(def.topology.queue_name(), "billing-default");
        assert_eq!(def.topology.exchange_name(), "");
        assert_eq!(def.publisher.app_id, "billing");
    }

    #[test]
    fn missing_queue_name_is_rejected() {
        let result = SetupBuilder::new(&BrokerConfig::default(), "", "").build();

        assert!(matches!(result, Err(AmqpError::InvalidQueueName)));
    }

    #[test]
    fn exchange_name_alone_declares_default_kind() {
        let def = SetupBuilder::new(&config(), "invoices", "invoices-q")
            .build()
            .unwrap();
        let exchange = def.topology.exchange.unwrap();

        assert_eq!(exchange.name, "invoices");
        assert_eq!(exchange.kind, ExchangeKind::Topic);
        assert!(exchange.durable);
    }

    #[test]
    fn unnamed_exchange_definition_takes_the_default_exchange() {
        let def = SetupBuilder::new(&config(), "", "invoices-q")
            .exchange(ExchangeDefinition::new("").fanout())
            .build()
            .unwrap();

        assert_eq!(def.topology.exchange_name(), "billing-events");
        assert_eq!(
            def.topology.exchange.unwrap().kind,
            ExchangeKind::Fanout
        );
    }

    #[test]
    fn unnamed_exchange_without_any_default_is_skipped() {
        let cfg = BrokerConfig {
            default_queue: "q".to_owned(),
            ..BrokerConfig::default()
        };
        let def = SetupBuilder::new(&cfg, "", "")
            .exchange(ExchangeDefinition::new(""))
            .build()
            .unwrap();

        assert!(def.topology.exchange.is_none());
    }

    #[test]
    fn overrides_reconnect_settings() {
        let def = SetupBuilder::new(&config(), "", "")
            .reconnect_interval(Duration::from_millis(20))
            .max_reconnect_attempts(7)
            .build()
            .unwrap();

        assert_eq!(def.reconnect_interval, Duration::from_millis(20));
        assert_eq!(def.max_reconnect_attempts, 7);
    }
}
