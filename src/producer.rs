// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! [`Producer`] publishes to exchanges and queues over one [`AmqpClient`].
//! Destinations are asserted the first time they are used on a channel, and the
//! current OpenTelemetry context is propagated in the message headers.

use crate::{
    client::AmqpClient,
    config::BrokerConfig,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeInfo},
    message::{Destination, PublishOptions},
    otel,
    queue::{QueueBinding, QueueDefinition, QueueInfo},
    transport::Connector,
};
use std::sync::Arc;
use tracing::debug;

/// Publishes messages, asserting exchanges and queues on first use.
pub struct Producer {
    client: AmqpClient,
}

impl Producer {
    /// Creates a disconnected producer.
    pub fn new(config: Arc<BrokerConfig>, connector: Arc<dyn Connector>) -> Self {
        Producer {
            client: AmqpClient::new(config, connector, "amqp-producer"),
        }
    }

    pub fn client(&self) -> &AmqpClient {
        &self.client
    }

    pub async fn connect(&self, prefetch: Option<u16>) -> Result<(), AmqpError> {
        self.client.connect(prefetch).await
    }

    pub async fn disconnect(&self) -> bool {
        self.client.disconnect().await
    }

    pub async fn assert_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        self.client.assert_queue(def).await
    }

    pub async fn assert_exchange(
        &self,
        def: &ExchangeDefinition,
        bind_to: Option<&QueueBinding>,
    ) -> Result<ExchangeInfo, AmqpError> {
        self.client.assert_exchange(def, bind_to).await
    }

    /// Publishes a message to an exchange.
    ///
    /// The exchange is asserted with the destination's definition unless it
    /// is already known on the current channel.
    ///
    /// # Parameters
    /// * `to` - Exchange and routing key
    /// * `payload` - Message body
    /// * `options` - Message properties
    ///
    /// # Returns
    /// The broker's acceptance flag, passed through unchanged
    pub async fn publish(
        &self,
        to: &Destination,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<bool, AmqpError> {
        let mut state = self.client.connected(None).await?;
        let link = state.link_mut()?;

        if !link.knows_exchange(to.exchange.name()) {
            link.assert_exchange(&to.exchange, None).await?;
        }

        debug!(
            exchange = to.exchange.name(),
            routing_key = to.routing_key,
            "publishing message"
        );
        link.session
            .publish(
                to.exchange.name(),
                &to.routing_key,
                payload,
                options.properties(otel::current_context_headers()),
                options.mandatory,
            )
            .await
    }

    /// Sends a message straight to a queue through the default exchange.
    ///
    /// The queue is asserted as durable unless it is already known on the
    /// current channel.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<bool, AmqpError> {
        let mut state = self.client.connected(None).await?;
        let link = state.link_mut()?;

        if !link.knows_queue(queue) {
            link.assert_queue(&QueueDefinition::new(queue).durable())
                .await?;
        }

        debug!(queue, "sending message to queue");
        link.session
            .publish(
                "",
                queue,
                payload,
                options.properties(otel::current_context_headers()),
                options.mandatory,
            )
            .await
    }
}
