// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient RabbitMQ Queue Setups
//!
//! A queue setup owns one broker connection, declares its exchange, queue
//! and binding, and then either publishes or consumes. Dropped connections
//! are healed in the background, failed deliveries are retried with an
//! `x-retry` counter before being dead-lettered, and `close` drains the
//! handler in flight before disconnecting.

mod consumer;
mod otel;
mod runtime;

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod setup;
pub mod shutdown;
pub mod topology;

#[cfg(test)]
mod testing;

pub use channel::{BrokerChannel, Connector, LapinConnector};
pub use config::BrokerConfig;
pub use consumer::ConsumerDefinition;
pub use dispatcher::QueueConsumer;
pub use errors::AmqpError;
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use message::{handler_fn, ConsumerHandler, Delivery, MessageEnvelope};
pub use publisher::{PublisherDefinition, QueuePublisher};
pub use queue::{QueueBinding, QueueDefinition};
pub use retry::{RequeueWithCount, RetryPolicy};
pub use setup::{SetupBuilder, SetupDefinition};
