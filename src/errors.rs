// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Task-Distribution Layer
//!
//! This module provides the error types for broker operations. The `AmqpError`
//! enum represents every failure scenario that can occur during connection,
//! channel, topology declaration, publishing and consuming. `HandlerError` is
//! the failure type returned by message handlers.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connectivity variants (`ConnectionError`, `ChannelError`, `ChannelClosed`)
/// concern the transport and feed the reconnect loop. Every other variant is
/// a setup or operation error and is reported to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel was closed while an operation was in flight
    #[error("channel closed `{0}`")]
    ChannelClosed(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a payload to JSON
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error inspecting a queue
    #[error("failure to inspect queue `{0}`")]
    QueueInspectError(String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeQueueError(String),

    /// Error closing the channel or the connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// The connection manager has been shut down
    #[error("connection manager is shut down")]
    ShutdownError,

    /// Invalid configuration values
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}

impl AmqpError {
    /// Returns true for transport failures that are retried by the reconnect loop.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError | AmqpError::ChannelError | AmqpError::ChannelClosed(_)
        )
    }
}

/// Failure returned by a message handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Business processing failed, the message is eligible for retry
    #[error("handler failure `{0}`")]
    Failed(String),

    /// The message body could not be interpreted
    #[error("malformed message `{0}`")]
    Malformed(String),
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed(reason.into())
    }
}
