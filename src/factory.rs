// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Factory
//!
//! [`BrokerFactory`] is a registry of connected producers and consumers keyed
//! by configuration identity. The first request for an identity builds and
//! connects a facade; later requests share it. The factory is an ordinary
//! value: build one at startup, hand it to whoever needs brokers, and call
//! [`BrokerFactory::shutdown`] on the way out.

use crate::{
    channel::LapinConnector,
    config::{BrokerConfig, ConfigResolver, DEFAULT_INSTANCE_KEY},
    consumer::Consumer,
    errors::AmqpError,
    producer::Producer,
    transport::Connector,
};
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Which configuration a facade is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Identity {
    /// The un-prefixed environment configuration
    #[default]
    Default,
    /// The environment configuration of an instance prefix
    Named(String),
    /// An explicit configuration, keyed by its content
    Inline(BrokerConfig),
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Identity::Named(name.to_owned())
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Identity::Named(name)
    }
}

impl From<BrokerConfig> for Identity {
    fn from(cfg: BrokerConfig) -> Self {
        Identity::Inline(cfg)
    }
}

/// Registry of connected producers and consumers.
pub struct BrokerFactory {
    resolver: Arc<ConfigResolver>,
    connector: Arc<dyn Connector>,
    shutdown_on_signal: bool,
    producers: Mutex<HashMap<String, Arc<Producer>>>,
    consumers: Mutex<HashMap<String, Arc<Consumer>>>,
}

impl BrokerFactory {
    /// Creates an empty registry. Signal hooks are off.
    pub fn new(resolver: Arc<ConfigResolver>, connector: Arc<dyn Connector>) -> Self {
        BrokerFactory {
            resolver,
            connector,
            shutdown_on_signal: false,
            producers: Mutex::new(HashMap::default()),
            consumers: Mutex::new(HashMap::default()),
        }
    }

    /// Creates a registry over the process environment and `lapin`, with
    /// signal hooks on.
    pub fn from_env() -> Self {
        BrokerFactory::new(ConfigResolver::shared(), Arc::new(LapinConnector::new()))
            .with_signal_hooks(true)
    }

    /// Disconnects every facade created afterwards on the first SIGINT or
    /// SIGTERM. Installing the hooks replaces the default signal behavior, so
    /// the application decides when to exit.
    pub fn with_signal_hooks(mut self, enabled: bool) -> Self {
        self.shutdown_on_signal = enabled;
        self
    }

    /// Returns the producer for an identity, creating and connecting it on
    /// first request.
    ///
    /// # Returns
    /// The shared producer, or the error of its eager connect; nothing is
    /// registered when that connect fails.
    pub async fn get_producer(
        &self,
        identity: impl Into<Identity>,
    ) -> Result<Arc<Producer>, AmqpError> {
        let (key, config) = self.resolve(identity.into(), None)?;

        let mut producers = self.producers.lock().await;
        if let Some(producer) = producers.get(&key) {
            return Ok(producer.clone());
        }

        let producer = Arc::new(Producer::new(config, self.connector.clone()));
        producer.connect(None).await?;
        debug!(key, "producer registered");

        if self.shutdown_on_signal {
            let p = producer.clone();
            on_shutdown_signal(key.clone(), move || async move { p.disconnect().await });
        }

        producers.insert(key, producer.clone());
        Ok(producer)
    }

    /// Returns the consumer for an identity, creating and connecting it on
    /// first request.
    ///
    /// # Parameters
    /// * `identity` - Which configuration to use
    /// * `explicit` - With a `Named` identity, used instead of the environment
    ///   configuration while the name stays the key; ignored otherwise
    pub async fn get_consumer(
        &self,
        identity: impl Into<Identity>,
        explicit: Option<BrokerConfig>,
    ) -> Result<Arc<Consumer>, AmqpError> {
        let (key, config) = self.resolve(identity.into(), explicit)?;

        let mut consumers = self.consumers.lock().await;
        if let Some(consumer) = consumers.get(&key) {
            return Ok(consumer.clone());
        }

        let consumer = Arc::new(Consumer::new(config, self.connector.clone()));
        consumer.connect(None).await?;
        debug!(key, "consumer registered");

        if self.shutdown_on_signal {
            let c = consumer.clone();
            on_shutdown_signal(key.clone(), move || async move { c.disconnect().await });
        }

        consumers.insert(key, consumer.clone());
        Ok(consumer)
    }

    /// Disconnects and forgets every registered facade.
    pub async fn shutdown(&self) {
        let producers: Vec<_> = self.producers.lock().await.drain().collect();
        let consumers: Vec<_> = self.consumers.lock().await.drain().collect();

        for (key, producer) in producers {
            debug!(key, "disconnecting producer");
            producer.disconnect().await;
        }

        for (key, consumer) in consumers {
            debug!(key, "disconnecting consumer");
            consumer.disconnect().await;
        }
    }

    fn resolve(
        &self,
        identity: Identity,
        explicit: Option<BrokerConfig>,
    ) -> Result<(String, Arc<BrokerConfig>), AmqpError> {
        match (identity, explicit) {
            (Identity::Named(name), Some(cfg)) => Ok((name, Arc::new(cfg))),
            (Identity::Named(name), None) => {
                let cfg = self.resolver.resolve(Some(&name))?;
                Ok((name, cfg))
            }
            (Identity::Default, _) => Ok((
                DEFAULT_INSTANCE_KEY.to_owned(),
                self.resolver.resolve(None)?,
            )),
            (Identity::Inline(cfg), _) => Ok((cfg.identity_key()?, Arc::new(cfg))),
        }
    }
}

/// Runs `disconnect` once, on the first SIGINT or SIGTERM.
fn on_shutdown_signal<F, Fut>(key: String, disconnect: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = shutdown_signal().await {
            error!(key, error = err.to_string(), "failure to listen for shutdown signals");
            return;
        }

        debug!(key, "shutdown signal received, disconnecting");
        disconnect().await;
    });
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
