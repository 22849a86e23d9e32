// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel
//!
//! A `Connector` dials the broker and hands back a `BrokerChannel`: one
//! connection with the single channel used for every declare, publish and
//! consume of a setup. Both are discarded together when the connection drops.
//! `LapinConnector` is the production implementation on top of `lapin`.

use crate::{
    config::BrokerConfig,
    errors::AmqpError,
    message::{Acknowledger, Delivery},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, error};

/// AMQP reply code for a normal shutdown
const REPLY_SUCCESS: u16 = 200;

/// Live stream of deliveries of one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Invoked at most once when the owning connection closes unexpectedly.
pub type CloseNotifier = Box<dyn Fn(AmqpError) + Send + Sync>;

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Makes a single attempt to open a connection and its channel.
    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// A connection together with its channel.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Registers the handle signalled when the connection drops.
    fn notify_on_close(&self, notifier: CloseNotifier);

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, AmqpError>;

    /// Closes the channel, then the connection.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    uri: AMQPUri,
    connection_name: String,
}

impl LapinConnector {
    pub fn new(cfg: &BrokerConfig) -> LapinConnector {
        LapinConnector {
            uri: cfg.amqp_uri(),
            connection_name: cfg.app_name.clone(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn open(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let connection = match Connection::connect_uri(self.uri.clone(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match connection.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel {
                    connection,
                    channel,
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

/// `lapin` connection and the channel opened on it.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn notify_on_close(&self, notifier: CloseNotifier) {
        self.connection
            .on_error(move |err| notifier(AmqpError::ConnectionLost(err.to_string())));
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(exchange, kind, options, arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = exchange, "error to declare the exchange");
                AmqpError::DeclareExchangeError(exchange.to_owned())
            })
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self.channel.queue_declare(queue, options, arguments).await {
            Err(err) => {
                error!(error = err.to_string(), name = queue, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<DeliveryStream, AmqpError> {
        let auto_ack = options.no_ack;
        let consumer = match self
            .channel
            .basic_consume(queue, consumer_tag, options, arguments)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let stream = consumer.map(move |result| match result {
            Ok(delivery) => Ok(Delivery::new(
                delivery.exchange.as_str(),
                delivery.routing_key.as_str(),
                delivery.redelivered,
                delivery.properties,
                delivery.data,
                auto_ack,
                Arc::new(LapinAcker(delivery.acker)),
            )),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "closing").await {
            debug!(error = err.to_string(), "error closing channel");
        }

        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }
}
