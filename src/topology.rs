// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! The topology of a setup is one queue, optionally bound to one exchange,
//! optionally paired with a dead-letter queue. `Topology::install` declares
//! all of it on a channel; it runs once at setup and again after every
//! reconnect, which is safe because broker declarations are idempotent.

use crate::{
    channel::BrokerChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::types::FieldTable;
use tracing::debug;

/// Exchange, queue and binding of one setup.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) queue_name: String,
    pub(crate) queue: QueueDefinition,
    pub(crate) binding: QueueBinding,
}

impl Topology {
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Name of the exchange messages are published to; empty for the default exchange.
    pub fn exchange_name(&self) -> &str {
        self.exchange
            .as_ref()
            .map(|exchange| exchange.name.as_str())
            .unwrap_or_default()
    }

    /// Declares the exchange, queue and binding.
    ///
    /// This method performs the following operations in order:
    /// 1. Creates the exchange, when one is configured
    /// 2. Creates the dead-letter queue, when requested
    /// 3. Creates the queue with its computed arguments
    /// 4. Binds the queue to the exchange
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if let Some(exchange) = &self.exchange {
            self.install_exchange(channel, exchange).await?;
        }

        self.install_queue(channel).await?;

        if let Some(exchange) = &self.exchange {
            self.binding_queue(channel, exchange).await?;
        }

        Ok(())
    }

    async fn install_exchange(
        &self,
        channel: &dyn BrokerChannel,
        exchange: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exchange.name);

        channel
            .exchange_declare(
                &exchange.name,
                (&exchange.kind).into(),
                exchange.options(),
                exchange.arguments(),
            )
            .await?;

        debug!("exchange: {} was created", exchange.name);
        Ok(())
    }

    async fn install_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        if let Some(dlq_name) = self.queue.dlq_name(&self.queue_name) {
            debug!("creating dead-letter queue: {}", dlq_name);

            channel
                .queue_declare(&dlq_name, self.queue.options(), FieldTable::default())
                .await?;
        }

        debug!("creating queue: {}", self.queue_name);

        channel
            .queue_declare(
                &self.queue_name,
                self.queue.options(),
                self.queue.arguments(&self.queue_name),
            )
            .await?;

        debug!("queue: {} was created", self.queue_name);
        Ok(())
    }

    async fn binding_queue(
        &self,
        channel: &dyn BrokerChannel,
        exchange: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.queue_name, exchange.name, self.binding.routing_key
        );

        channel
            .queue_bind(
                &self.queue_name,
                &exchange.name,
                &self.binding.routing_key,
                self.binding.options(),
                self.binding.arguments(),
            )
            .await?;

        debug!("queue was bounded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBroker;
    use lapin::types::{AMQPValue, LongString};

    fn topology(exchange: Option<ExchangeDefinition>, queue: QueueDefinition) -> Topology {
        Topology {
            exchange,
            queue_name: "orders".to_owned(),
            queue,
            binding: QueueBinding::new().routing_key("order.*"),
        }
    }

    #[tokio::test]
    async fn declares_plain_queue_without_exchange() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await;

        topology(None, QueueDefinition::new().durable())
            .install(channel.as_ref())
            .await
            .unwrap();

        assert!(broker.has_queue("orders"));
        assert!(broker.exchanges().is_empty());
        assert!(broker.bindings().is_empty());
    }

    #[tokio::test]
    async fn declares_exchange_queue_dlq_and_binding() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await;

        topology(
            Some(ExchangeDefinition::new("orders-events").topic()),
            QueueDefinition::new().with_dlq(),
        )
        .install(channel.as_ref())
        .await
        .unwrap();

        assert_eq!(broker.exchanges(), vec![("orders-events".to_owned(), "topic".to_owned())]);
        assert!(broker.has_queue("orders-dlq"));
        assert_eq!(
            broker.queue_arguments("orders").unwrap().inner().get("x-dead-letter-routing-key"),
            Some(&AMQPValue::LongString(LongString::from("orders-dlq")))
        );
        assert_eq!(
            broker.bindings(),
            vec![(
                "orders".to_owned(),
                "orders-events".to_owned(),
                "order.*".to_owned()
            )]
        );
    }

    #[tokio::test]
    async fn installing_twice_is_a_no_op() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await;
        let topology = topology(
            Some(ExchangeDefinition::new("orders-events").fanout()),
            QueueDefinition::new().durable().with_dlq(),
        );

        topology.install(channel.as_ref()).await.unwrap();
        topology.install(channel.as_ref()).await.unwrap();

        assert_eq!(broker.exchanges().len(), 1);
        assert_eq!(broker.bindings().len(), 1);
    }

    #[tokio::test]
    async fn conflicting_redeclare_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.connect().await;

        topology(None, QueueDefinition::new().durable())
            .install(channel.as_ref())
            .await
            .unwrap();
        let result = topology(None, QueueDefinition::new())
            .install(channel.as_ref())
            .await;

        assert_eq!(result, Err(AmqpError::DeclareQueueError("orders".to_owned())));
    }
}
