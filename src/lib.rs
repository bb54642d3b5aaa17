// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Producer and consumer facades over an AMQP 0-9-1 broker.
//!
//! Connections are opened lazily, fail over across the configured brokers and
//! remember which queues and exchanges were already asserted. Configurations
//! come from `FW_AMPQ_*` environment variables or are built explicitly, and
//! [`BrokerFactory`] hands out one connected facade per configuration.

mod otel;
mod tls;

pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod factory;
pub mod message;
pub mod producer;
pub mod queue;
pub mod transport;

pub use channel::LapinConnector;
pub use client::{AmqpClient, KnownDestinations};
pub use config::{BrokerConfig, ConfigResolver, TlsMaterial, TlsOptions};
pub use consumer::{Consumer, Subscription};
pub use errors::AmqpError;
pub use exchange::{ExchangeDefinition, ExchangeInfo, ExchangeKind};
pub use factory::{BrokerFactory, Identity};
pub use message::{Destination, Disposition, InboundMessage, MessageHandler, PublishOptions};
pub use producer::Producer;
pub use queue::{QueueBinding, QueueDefinition, QueueInfo};
