// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the AMQP Facades
//!
//! This module provides the error taxonomy shared by the configuration resolver,
//! the connection client, the producer/consumer facades and the broker factory.
//! Errors coming from the underlying AMQP library are logged where they happen
//! and mapped into one of the `AmqpError` variants.

use thiserror::Error;

/// Represents errors that can occur while configuring, connecting to or
/// operating against an AMQP broker.
///
/// The variants fall into four groups:
/// - configuration: [`AmqpError::ConfigError`]
/// - connection lifecycle: [`AmqpError::ConnectionError`], [`AmqpError::ChannelError`],
///   [`AmqpError::QoSDeclarationError`]
/// - invariant violation: [`AmqpError::NotConnected`]
/// - broker operations: every other variant
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid configuration value or unreadable TLS material
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// No channel is available even after a connect attempt
    #[error("channel not available")]
    NotConnected,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a delivery from the broker
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error closing the connection
    #[error("failure to close the connection: {0}")]
    CloseError(String),
}

impl AmqpError {
    /// True for errors raised while opening the connection or its channel.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_)
                | AmqpError::ChannelError(_)
                | AmqpError::QoSDeclarationError(_)
        )
    }

    /// True for errors reported by the broker while executing an operation
    /// on an open channel.
    pub fn is_broker_operation_error(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
                | AmqpError::PublishingError(_)
                | AmqpError::ConsumerDeclarationError(_)
                | AmqpError::ConsumerError(_)
                | AmqpError::AckMessageError
                | AmqpError::NackMessageError
        )
    }
}
