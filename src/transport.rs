// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The traits separating the facades from the AMQP client library. A
//! [`Connector`] opens a [`BrokerSession`], which is one connection with one
//! channel on it. [`crate::channel::LapinConnector`] is the production
//! implementation; tests substitute mocks.

use crate::{
    config::TlsOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::InboundMessage,
    queue::{QueueBinding, QueueDefinition, QueueInfo},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Called once per asynchronous connection failure with a description of the
/// error. Invoked from the client library's own thread.
pub type FailureHook = Box<dyn Fn(String) + Send + Sync>;

/// Deliveries of one consumer. The stream ends when the broker cancels the
/// consumer or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, AmqpError>>;

/// Everything needed to open a connection to one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub uri: String,
    pub client_id: String,
    pub tls: Option<TlsOptions>,
}

/// Opens sessions against a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a connection and a channel on it.
    ///
    /// `on_failure` must be registered on the connection and fire for errors
    /// happening after this call returns.
    async fn open(
        &self,
        request: &ConnectRequest,
        on_failure: FailureHook,
    ) -> Result<Arc<dyn BrokerSession>, AmqpError>;
}

/// One connection with a single channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Limits the number of unacknowledged deliveries on the channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a message, returning whether the broker accepted it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<bool, AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
