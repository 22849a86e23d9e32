// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient Queue Setup
//!
//! `AmqpError` covers everything a caller can observe: configuration and
//! construction failures, topology declaration failures, publishing failures
//! and handler failures. Connection drops are healed by the reconnect
//! supervisor and only show up here as the payload of a close notification.

use thiserror::Error;

/// Represents errors that can occur while setting up or running a queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid or incomplete configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// The queue name is empty even after applying the configured default
    #[error("queue name is empty and no default queue is configured")]
    InvalidQueueName,

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The broker connection was closed unexpectedly
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Error creating a channel, or no channel is currently open
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// A subscription is already registered on this setup
    #[error("a consumer is already registered")]
    AlreadyConsuming,

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message, also returned by failing handlers
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The operation was abandoned because the setup is shutting down
    #[error("operation cancelled")]
    Cancelled,
}
