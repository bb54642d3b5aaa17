// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Outbound publish options, inbound deliveries and the handler contract used by
//! consumers. A handler settles each delivery by returning a [`Disposition`]
//! instead of calling back into the channel, so a message can only be
//! acknowledged or rejected once.

use crate::exchange::{ExchangeDefinition, ExchangeKind};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Delivery mode flagging a message as persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Where a published message goes: an exchange, asserted on first use, and the
/// routing key to publish with.
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) routing_key: String,
}

impl Destination {
    /// Publishes to a `direct` exchange with default options and an empty
    /// routing key.
    pub fn exchange(name: &str) -> Destination {
        Destination::with_definition(ExchangeDefinition::new(name))
    }

    /// Publishes to an exchange declared with the given definition.
    pub fn with_definition(exchange: ExchangeDefinition) -> Destination {
        Destination {
            exchange,
            routing_key: String::new(),
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.exchange = self.exchange.kind(kind);
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn exchange_name(&self) -> &str {
        self.exchange.name()
    }
}

/// Per-message publish options.
///
/// A random message id is generated when none is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub content_type: Option<String>,
    pub persistent: bool,
    pub mandatory: bool,
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

impl PublishOptions {
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn message_type(mut self, message_type: &str) -> Self {
        self.message_type = Some(message_type.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    /// Builds the AMQP properties, merging the given extra headers over the
    /// configured ones.
    pub(crate) fn properties(&self, extra: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
        let mut headers = self.headers.clone();
        headers.extend(extra);

        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut props = BasicProperties::default()
            .with_message_id(ShortString::from(message_id))
            .with_headers(FieldTable::from(headers));

        if let Some(content_type) = &self.content_type {
            props = props.with_content_type(ShortString::from(content_type.clone()));
        }
        if self.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }
        if let Some(kind) = &self.message_type {
            props = props.with_type(ShortString::from(kind.clone()));
        }
        if let Some(id) = &self.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.clone()));
        }
        if let Some(reply_to) = &self.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.clone()));
        }
        if let Some(expiration) = &self.expiration {
            props = props.with_expiration(ShortString::from(expiration.clone()));
        }
        if let Some(priority) = self.priority {
            props = props.with_priority(priority);
        }

        props
    }
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
}

impl InboundMessage {
    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// How a consumed message is settled when acknowledgements are manual.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Disposition {
    #[default]
    Ack,
    Nack { requeue: bool },
}

/// Processes deliveries of a subscription.
///
/// `None` signals that the broker cancelled the consumer; the returned
/// disposition is ignored in that case, and whenever the subscription uses
/// automatic acknowledgements.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Option<&InboundMessage>) -> Disposition;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Option<&InboundMessage>) -> Disposition + Send + Sync,
{
    async fn handle(&self, message: Option<&InboundMessage>) -> Disposition {
        (self)(message)
    }
}
