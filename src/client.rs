// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Client
//!
//! [`AmqpClient`] owns one logical connection and one channel to one broker of
//! the configured list. It connects lazily, remembers which queues and
//! exchanges were already asserted on the current channel, and rotates to the
//! next broker after an asynchronous connection failure.
//!
//! State machine:
//!
//! ```text
//! Disconnected --connect()--> Connected
//! Connected --disconnect() / connection error--> Disconnected
//! ```
//!
//! There is no automatic reconnect: after a failure the next operation (or an
//! explicit `connect()`) opens a connection to the following broker.

use crate::{
    config::BrokerConfig,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeInfo},
    queue::{QueueBinding, QueueDefinition, QueueInfo},
    transport::{BrokerSession, ConnectRequest, Connector, FailureHook},
};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    runtime::Handle,
    sync::{Mutex, MutexGuard},
};
use tracing::{debug, error, warn};

/// Queues and exchanges already asserted on one channel.
///
/// The first successful assert of a name wins; later asserts of the same
/// name are answered from here without a broker round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownDestinations {
    queues: HashMap<String, QueueInfo>,
    exchanges: HashSet<String>,
}

impl KnownDestinations {
    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains(name)
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &str> {
        self.exchanges.iter().map(String::as_str)
    }
}

/// An open session and what was asserted on it.
pub(crate) struct Link {
    pub(crate) session: Arc<dyn BrokerSession>,
    pub(crate) broker_index: usize,
    generation: u64,
    known: KnownDestinations,
}

impl Link {
    pub(crate) fn knows_queue(&self, name: &str) -> bool {
        self.known.has_queue(name)
    }

    pub(crate) fn knows_exchange(&self, name: &str) -> bool {
        self.known.has_exchange(name)
    }

    pub(crate) async fn assert_queue(
        &mut self,
        def: &QueueDefinition,
    ) -> Result<QueueInfo, AmqpError> {
        if let Some(info) = self.known.queues.get(def.name()) {
            return Ok(info.clone());
        }

        let info = self.session.declare_queue(def).await?;

        // broker-named queues are private to one declaration
        if !def.name().is_empty() {
            self.known
                .queues
                .insert(def.name().to_owned(), info.clone());
        }

        Ok(info)
    }

    pub(crate) async fn assert_exchange(
        &mut self,
        def: &ExchangeDefinition,
        bind_to: Option<&QueueBinding>,
    ) -> Result<ExchangeInfo, AmqpError> {
        if !self.known.has_exchange(def.name()) {
            self.session.declare_exchange(def).await?;
            self.known.exchanges.insert(def.name().to_owned());
        }

        if let Some(binding) = bind_to {
            let binding = binding.clone().exchange(def.name());
            self.session.bind_queue(&binding).await?;
        }

        Ok(ExchangeInfo {
            exchange: def.name().to_owned(),
        })
    }
}

pub(crate) enum ConnectionState {
    Disconnected,
    Connected(Link),
}

impl ConnectionState {
    pub(crate) fn link_mut(&mut self) -> Result<&mut Link, AmqpError> {
        match self {
            ConnectionState::Connected(link) => Ok(link),
            ConnectionState::Disconnected => Err(AmqpError::NotConnected),
        }
    }
}

/// State shared with the connection failure observer.
struct Shared {
    component: &'static str,
    brokers: usize,
    state: Mutex<ConnectionState>,
    broker_index: AtomicUsize,
    generation: AtomicU64,
}

impl Shared {
    /// Handles an asynchronous failure of the connection opened as
    /// `generation`. Failures of superseded connections are ignored.
    async fn on_failure(&self, generation: u64) {
        let mut state = self.state.lock().await;

        match &*state {
            ConnectionState::Connected(link) if link.generation == generation => {}
            _ => {
                debug!(
                    component = self.component,
                    generation, "ignoring failure of a stale connection"
                );
                return;
            }
        }

        if let ConnectionState::Connected(link) =
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        {
            if let Err(err) = link.session.close().await {
                error!(
                    component = self.component,
                    error = err.to_string(),
                    "error on disconnect after connection failure"
                );
            }
        }

        let next = (self.broker_index.load(Ordering::SeqCst) + 1) % self.brokers;
        self.broker_index.store(next, Ordering::SeqCst);
        warn!(
            component = self.component,
            next_broker = next,
            "connection lost, next connect targets another broker"
        );
    }
}

/// One connection and one channel to a broker of a [`BrokerConfig`].
///
/// All operations take `&self`; the connection state sits behind an async
/// mutex, so operations on one client are serialized and concurrent
/// `connect()` calls open a single connection.
pub struct AmqpClient {
    config: Arc<BrokerConfig>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl AmqpClient {
    /// Creates a disconnected client.
    ///
    /// # Parameters
    /// * `config` - Brokers, client id and TLS settings
    /// * `connector` - Opens sessions against the brokers
    /// * `component` - Name attached to log lines of this client
    pub fn new(
        config: Arc<BrokerConfig>,
        connector: Arc<dyn Connector>,
        component: &'static str,
    ) -> Self {
        let brokers = config.brokers().len();
        AmqpClient {
            config,
            connector,
            shared: Arc::new(Shared {
                component,
                brokers,
                state: Mutex::new(ConnectionState::Disconnected),
                broker_index: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &Arc<BrokerConfig> {
        &self.config
    }

    /// Index and address of the broker the next (or current) connection
    /// targets.
    pub fn current_broker(&self) -> (usize, &str) {
        let brokers = self.config.brokers();
        let index = self.shared.broker_index.load(Ordering::SeqCst) % brokers.len();
        (index, brokers[index].as_str())
    }

    pub async fn is_connected(&self) -> bool {
        matches!(
            &*self.shared.state.lock().await,
            ConnectionState::Connected(_)
        )
    }

    /// Destinations asserted on the current channel, `None` when disconnected.
    pub async fn known_destinations(&self) -> Option<KnownDestinations> {
        match &*self.shared.state.lock().await {
            ConnectionState::Connected(link) => Some(link.known.clone()),
            ConnectionState::Disconnected => None,
        }
    }

    /// Connects to the current broker. Does nothing when already connected.
    ///
    /// # Parameters
    /// * `prefetch` - Channel prefetch limit, applied when greater than zero
    ///
    /// # Returns
    /// `ConnectionError`, `ChannelError` or `QoSDeclarationError` when the
    /// connection cannot be established. A failed attempt does not rotate
    /// the broker index.
    pub async fn connect(&self, prefetch: Option<u16>) -> Result<(), AmqpError> {
        self.connected(prefetch).await.map(|_| ())
    }

    /// Closes the connection.
    ///
    /// # Returns
    /// `false` when not connected or when closing failed, `true` otherwise.
    /// The client is disconnected afterwards in every case.
    pub async fn disconnect(&self) -> bool {
        let mut state = self.shared.state.lock().await;

        let ConnectionState::Connected(link) =
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        else {
            return false;
        };

        match link.session.close().await {
            Ok(()) => {
                debug!(
                    component = self.shared.component,
                    broker = link.broker_index,
                    "disconnected"
                );
                true
            }
            Err(err) => {
                error!(
                    component = self.shared.component,
                    error = err.to_string(),
                    "error on disconnect"
                );
                false
            }
        }
    }

    /// Changes the prefetch limit of the live channel, connecting first if
    /// needed.
    pub async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        let mut state = self.connected(None).await?;
        state.link_mut()?.session.set_prefetch(count).await
    }

    /// Asserts a queue, connecting first if needed.
    ///
    /// A queue already asserted on the current channel is not declared
    /// again; the info reported by its first assertion is returned.
    pub async fn assert_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        let mut state = self.connected(None).await?;
        state.link_mut()?.assert_queue(def).await
    }

    /// Asserts an exchange, connecting first if needed, and optionally binds
    /// a queue to it.
    ///
    /// # Parameters
    /// * `def` - The exchange to assert
    /// * `bind_to` - Queue and pattern to bind; its exchange name is replaced
    ///   by `def`'s name
    pub async fn assert_exchange(
        &self,
        def: &ExchangeDefinition,
        bind_to: Option<&QueueBinding>,
    ) -> Result<ExchangeInfo, AmqpError> {
        let mut state = self.connected(None).await?;
        state.link_mut()?.assert_exchange(def, bind_to).await
    }

    /// Locks the state, connecting first when disconnected.
    pub(crate) async fn connected(
        &self,
        prefetch: Option<u16>,
    ) -> Result<MutexGuard<'_, ConnectionState>, AmqpError> {
        let mut state = self.shared.state.lock().await;
        if let ConnectionState::Disconnected = &*state {
            *state = ConnectionState::Connected(self.open(prefetch).await?);
        }
        Ok(state)
    }

    async fn open(&self, prefetch: Option<u16>) -> Result<Link, AmqpError> {
        let component = self.shared.component;
        let broker_index = self.shared.broker_index.load(Ordering::SeqCst);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let request = ConnectRequest {
            uri: self.config.broker_uri(broker_index),
            client_id: self.config.client_id().to_owned(),
            tls: self.config.tls().cloned(),
        };

        debug!(component, broker = broker_index, "connecting...");
        let session = self
            .connector
            .open(&request, self.failure_hook(generation)?)
            .await?;

        if let Some(count) = prefetch.filter(|count| *count > 0) {
            if let Err(err) = session.set_prefetch(count).await {
                if let Err(close_err) = session.close().await {
                    debug!(component, error = close_err.to_string(), "failure to close");
                }
                return Err(err);
            }
        }

        debug!(component, broker = broker_index, "connected");
        Ok(Link {
            session,
            broker_index,
            generation,
            known: KnownDestinations::default(),
        })
    }

    fn failure_hook(&self, generation: u64) -> Result<FailureHook, AmqpError> {
        let runtime = Handle::try_current()
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))?;
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let component = self.shared.component;

        Ok(Box::new(move |reason: String| {
            error!(component, error = %reason, "connection error");
            let Some(shared) = shared.upgrade() else {
                return;
            };
            runtime.spawn(async move { shared.on_failure(generation).await });
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::{MockBrokerSession, MockConnector};
    use std::sync::Mutex as StdMutex;

    pub(crate) fn config(brokers: &[&str]) -> Arc<BrokerConfig> {
        Arc::new(BrokerConfig::new(brokers).unwrap().with_client_id("test"))
    }

    pub(crate) fn closable_session() -> MockBrokerSession {
        let mut session = MockBrokerSession::new();
        session.expect_close().returning(|| Ok(()));
        session
    }

    type HookSlot = Arc<StdMutex<Vec<FailureHook>>>;

    /// A connector handing out sessions built by `make`, recording the
    /// requested URIs and the failure hooks.
    fn connector<F>(make: F) -> (MockConnector, Arc<StdMutex<Vec<String>>>, HookSlot)
    where
        F: Fn() -> MockBrokerSession + Send + 'static,
    {
        let uris = Arc::new(StdMutex::new(vec![]));
        let hooks: HookSlot = Arc::new(StdMutex::new(vec![]));

        let mut connector = MockConnector::new();
        let (u, h) = (uris.clone(), hooks.clone());
        connector.expect_open().returning(move |request, hook| {
            u.lock().unwrap().push(request.uri.clone());
            h.lock().unwrap().push(hook);
            Ok(Arc::new(make()) as Arc<dyn BrokerSession>)
        });

        (connector, uris, hooks)
    }

    async fn wait_disconnected(client: &AmqpClient) {
        for _ in 0..100 {
            if !client.is_connected().await {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("client still connected");
    }

    #[tokio::test]
    async fn connect_twice_opens_one_connection() {
        let mut connector = MockConnector::new();
        connector
            .expect_open()
            .times(1)
            .returning(|_, _| Ok(Arc::new(closable_session()) as Arc<dyn BrokerSession>));

        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        client.connect(None).await.unwrap();
        client.connect(None).await.unwrap();

        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn connect_sends_client_id_and_uri() {
        let mut connector = MockConnector::new();
        connector
            .expect_open()
            .withf(|request, _| request.uri == "amqp://a:5672" && request.client_id == "test")
            .times(1)
            .returning(|_, _| Ok(Arc::new(closable_session()) as Arc<dyn BrokerSession>));

        let client = AmqpClient::new(config(&["a:5672", "b:5672"]), Arc::new(connector), "test");
        client.connect(None).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_connects_open_one_connection() {
        let mut connector = MockConnector::new();
        connector
            .expect_open()
            .times(1)
            .returning(|_, _| Ok(Arc::new(closable_session()) as Arc<dyn BrokerSession>));

        let client = Arc::new(AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test"));
        let (a, b) = tokio::join!(client.connect(None), client.connect(None));

        assert!(a.is_ok() && b.is_ok());
    }

    #[tokio::test]
    async fn prefetch_applied_only_when_positive() {
        let (connector, _, _) = connector(|| {
            let mut session = closable_session();
            session.expect_set_prefetch().withf(|c| *c == 5).times(1).returning(|_| Ok(()));
            session
        });
        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        client.connect(Some(5)).await.unwrap();
        client.disconnect().await;

        let (connector, _, _) = connector_without_prefetch();
        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        client.connect(Some(0)).await.unwrap();
    }

    fn connector_without_prefetch() -> (MockConnector, Arc<StdMutex<Vec<String>>>, HookSlot) {
        connector(|| {
            let mut session = closable_session();
            session.expect_set_prefetch().never();
            session
        })
    }

    #[tokio::test]
    async fn set_prefetch_connects_lazily_and_applies_once() {
        let mut connector = MockConnector::new();
        connector.expect_open().times(1).returning(|_, _| {
            let mut session = closable_session();
            session
                .expect_set_prefetch()
                .withf(|count| *count == 10)
                .times(1)
                .returning(|_| Ok(()));
            Ok(Arc::new(session) as Arc<dyn BrokerSession>)
        });

        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        assert!(!client.is_connected().await);

        client.set_prefetch(10).await.unwrap();

        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn set_prefetch_surfaces_qos_failure() {
        let (connector, _, _) = connector(|| {
            let mut session = closable_session();
            session
                .expect_set_prefetch()
                .returning(|_| Err(AmqpError::QoSDeclarationError("refused".into())));
            session
        });

        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        let result = client.set_prefetch(3).await;

        assert!(matches!(result, Err(AmqpError::QoSDeclarationError(_))));
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn failed_prefetch_fails_connect() {
        let (connector, _, _) = connector(|| {
            let mut session = MockBrokerSession::new();
            session
                .expect_set_prefetch()
                .returning(|_| Err(AmqpError::QoSDeclarationError("refused".into())));
            session.expect_close().times(1).returning(|| Ok(()));
            session
        });

        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        let result = client.connect(Some(1)).await;

        assert!(matches!(result, Err(AmqpError::QoSDeclarationError(_))));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn failed_connect_does_not_rotate_broker() {
        let mut connector = MockConnector::new();
        connector
            .expect_open()
            .times(2)
            .withf(|request, _| request.uri == "amqp://a:5672")
            .returning(|_, _| Err(AmqpError::ConnectionError("refused".into())));

        let client = AmqpClient::new(config(&["a:5672", "b:5672"]), Arc::new(connector), "test");

        assert!(client.connect(None).await.unwrap_err().is_connection_error());
        assert!(client.connect(None).await.is_err());
        assert_eq!(client.current_broker(), (0, "a:5672"));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn disconnect_without_connection_returns_false() {
        let connector = MockConnector::new();
        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");

        assert!(!client.disconnect().await);
    }

    #[tokio::test]
    async fn disconnect_resets_state_even_when_close_fails() {
        let (connector, _, _) = connector(|| {
            let mut session = MockBrokerSession::new();
            session
                .expect_close()
                .returning(|| Err(AmqpError::CloseError("gone".into())));
            session
        });

        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        client.connect(None).await.unwrap();

        assert!(!client.disconnect().await);
        assert!(!client.is_connected().await);
        assert!(!client.disconnect().await);
    }

    #[tokio::test]
    async fn disconnect_closes_session() {
        let (connector, _, _) = connector(|| {
            let mut session = MockBrokerSession::new();
            session.expect_close().times(1).returning(|| Ok(()));
            session
        });

        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        client.connect(None).await.unwrap();

        assert!(client.disconnect().await);
    }

    #[tokio::test]
    async fn assert_queue_declares_once() {
        let (connector, _, _) = connector(|| {
            let mut session = closable_session();
            session.expect_declare_queue().times(1).returning(|def| {
                Ok(QueueInfo {
                    queue: def.name().to_owned(),
                    message_count: 3,
                    consumer_count: 1,
                })
            });
            session
        });

        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        let def = QueueDefinition::new("jobs").durable();

        let first = client.assert_queue(&def).await.unwrap();
        let second = client.assert_queue(&def).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.message_count, 3);
        let known = client.known_destinations().await.unwrap();
        assert_eq!(known.queues().collect::<Vec<_>>(), vec!["jobs"]);
    }

    #[tokio::test]
    async fn failed_assert_is_not_recorded() {
        let (connector, _, _) = connector(|| {
            let mut session = closable_session();
            session
                .expect_declare_queue()
                .times(2)
                .returning(|def| Err(AmqpError::DeclareQueueError(def.name().to_owned())));
            session
        });

        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        let def = QueueDefinition::new("jobs");

        assert!(client.assert_queue(&def).await.is_err());
        assert!(client.assert_queue(&def).await.is_err());
        assert!(!client.known_destinations().await.unwrap().has_queue("jobs"));
    }

    #[tokio::test]
    async fn assert_exchange_binds_every_time() {
        let (connector, _, _) = connector(|| {
            let mut session = closable_session();
            session.expect_declare_exchange().times(1).returning(|_| Ok(()));
            session
                .expect_bind_queue()
                .withf(|b| b.exchange_name() == "events" && b.queue_name() == "audit")
                .times(2)
                .returning(|_| Ok(()));
            session
        });

        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        let def = ExchangeDefinition::new("events").topic();
        let binding = QueueBinding::new("audit").routing_key("order.*");

        let info = client.assert_exchange(&def, Some(&binding)).await.unwrap();
        client.assert_exchange(&def, Some(&binding)).await.unwrap();

        assert_eq!(info.exchange, "events");
        assert!(client.known_destinations().await.unwrap().has_exchange("events"));
    }

    #[tokio::test]
    async fn known_destinations_cleared_on_reconnect() {
        let (connector, _, _) = connector(|| {
            let mut session = closable_session();
            session
                .expect_declare_queue()
                .times(1)
                .returning(|def| Ok(QueueInfo { queue: def.name().to_owned(), ..Default::default() }));
            session
        });

        let client = AmqpClient::new(config(&["a:5672"]), Arc::new(connector), "test");
        let def = QueueDefinition::new("jobs");

        client.assert_queue(&def).await.unwrap();
        client.disconnect().await;
        assert!(client.known_destinations().await.is_none());

        // each session expects exactly one declare
        client.assert_queue(&def).await.unwrap();
    }

    #[tokio::test]
    async fn connection_failure_rotates_broker() {
        let (connector, uris, hooks) = connector(|| {
            let mut session = MockBrokerSession::new();
            session.expect_close().times(1).returning(|| Ok(()));
            session
        });

        let client = AmqpClient::new(
            config(&["a:5672", "b:5672", "c:5672"]),
            Arc::new(connector),
            "test",
        );
        client.connect(None).await.unwrap();

        (hooks.lock().unwrap()[0])("connection reset".to_owned());
        wait_disconnected(&client).await;
        assert_eq!(client.current_broker(), (1, "b:5672"));

        client.connect(None).await.unwrap();
        assert_eq!(
            *uris.lock().unwrap(),
            vec!["amqp://a:5672".to_owned(), "amqp://b:5672".to_owned()]
        );
        assert!(client.disconnect().await);
    }

    #[tokio::test]
    async fn rotation_wraps_around() {
        let (connector, _, hooks) = connector(closable_session);
        let client = AmqpClient::new(config(&["a:5672", "b:5672"]), Arc::new(connector), "test");

        for expected in [(1, "b:5672"), (0, "a:5672")] {
            client.connect(None).await.unwrap();
            let hook = hooks.lock().unwrap().pop().unwrap();
            hook("boom".to_owned());
            wait_disconnected(&client).await;
            assert_eq!(client.current_broker(), expected);
        }
    }

    #[tokio::test]
    async fn stale_failure_is_ignored() {
        let (connector, _, hooks) = connector(closable_session);
        let client = AmqpClient::new(config(&["a:5672", "b:5672"]), Arc::new(connector), "test");

        client.connect(None).await.unwrap();
        client.disconnect().await;
        client.connect(None).await.unwrap();

        (hooks.lock().unwrap()[0])("late error".to_owned());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(client.is_connected().await);
        assert_eq!(client.current_broker(), (0, "a:5672"));
    }
}
