// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! [`Consumer`] subscribes handlers to queues and fanout exchanges over one
//! [`AmqpClient`]. Each subscription runs a delivery task that hands messages
//! to the [`MessageHandler`] and, with manual acknowledgements, settles each
//! message according to the returned [`Disposition`]. Every delivery is
//! processed inside an OpenTelemetry consumer span.

use crate::{
    client::{AmqpClient, Link},
    config::BrokerConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Disposition, InboundMessage, MessageHandler},
    otel,
    queue::{QueueBinding, QueueDefinition},
    transport::{BrokerSession, Connector, DeliveryStream},
};
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Subscribes message handlers to queues and fanout exchanges.
pub struct Consumer {
    client: AmqpClient,
}

/// A running subscription.
///
/// Dropping the handle leaves the delivery task running.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    consumer_tag: String,
    task: JoinHandle<()>,
}

impl Subscription {
    /// The consumed queue; broker-generated for fanout subscriptions.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// True once the broker cancelled the consumer or the task was cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops handing deliveries to the handler. The broker-side consumer
    /// stays registered until the channel closes.
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Waits for the delivery task to end.
    pub async fn join(self) -> Result<(), AmqpError> {
        match self.task.await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
        }
    }
}

impl Consumer {
    /// Creates a disconnected consumer.
    pub fn new(config: Arc<BrokerConfig>, connector: Arc<dyn Connector>) -> Self {
        Consumer {
            client: AmqpClient::new(config, connector, "amqp-consumer"),
        }
    }

    pub fn client(&self) -> &AmqpClient {
        &self.client
    }

    /// Connects, limiting unacknowledged deliveries to `prefetch` when set.
    pub async fn connect(&self, prefetch: Option<u16>) -> Result<(), AmqpError> {
        self.client.connect(prefetch).await
    }

    pub async fn disconnect(&self) -> bool {
        self.client.disconnect().await
    }

    /// Changes the prefetch limit of the live channel.
    pub async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.client.set_prefetch(count).await
    }

    /// Subscribes a handler to a queue.
    ///
    /// The queue is asserted as durable unless it is already known on the
    /// current channel.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume
    /// * `handler` - Receives each delivery, and `None` once when the consumer is cancelled
    /// * `auto_ack` - Let the broker consider messages acknowledged on delivery
    pub async fn subscribe<H>(
        &self,
        queue: &str,
        handler: H,
        auto_ack: bool,
    ) -> Result<Subscription, AmqpError>
    where
        H: MessageHandler + 'static,
    {
        let mut state = self.client.connected(None).await?;
        let link = state.link_mut()?;

        if !link.knows_queue(queue) {
            link.assert_queue(&QueueDefinition::new(queue).durable())
                .await?;
        }

        self.consume(link, queue, Arc::new(handler), auto_ack).await
    }

    /// Subscribes a handler to every message published on a fanout exchange.
    ///
    /// The exchange is asserted as a durable fanout unless already known. A
    /// private, exclusive, broker-named queue is bound to it and consumed.
    pub async fn subscribe_to_fanout_exchange<H>(
        &self,
        exchange: &str,
        handler: H,
        auto_ack: bool,
    ) -> Result<Subscription, AmqpError>
    where
        H: MessageHandler + 'static,
    {
        let mut state = self.client.connected(None).await?;
        let link = state.link_mut()?;

        if !link.knows_exchange(exchange) {
            let def = ExchangeDefinition::new(exchange).fanout().durable();
            link.assert_exchange(&def, None).await?;
        }

        let private = link.assert_queue(&QueueDefinition::private()).await?;
        link.session
            .bind_queue(&QueueBinding::new(&private.queue).exchange(exchange))
            .await?;

        self.consume(link, &private.queue, Arc::new(handler), auto_ack)
            .await
    }

    async fn consume(
        &self,
        link: &Link,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
        auto_ack: bool,
    ) -> Result<Subscription, AmqpError> {
        let consumer_tag = format!("{}-{}", self.client.config().client_id(), Uuid::new_v4());
        let stream = link.session.consume(queue, &consumer_tag, auto_ack).await?;
        debug!(queue, consumer_tag, auto_ack, "consumer registered");

        let task = tokio::spawn(deliver(
            stream,
            link.session.clone(),
            handler,
            auto_ack,
            queue.to_owned(),
        ));

        Ok(Subscription {
            queue: queue.to_owned(),
            consumer_tag,
            task,
        })
    }
}

/// Drives one consumer until the broker cancels it.
async fn deliver(
    mut stream: DeliveryStream,
    session: Arc<dyn BrokerSession>,
    handler: Arc<dyn MessageHandler>,
    auto_ack: bool,
    queue: String,
) {
    let tracer = global::tracer("amqp consumer");

    while let Some(result) = stream.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                continue;
            }
        };

        let mut span = otel::new_span(&msg.properties, &tracer, &queue);
        let disposition = handler.handle(Some(&msg)).await;

        if auto_ack {
            span.set_status(Status::Ok);
            continue;
        }

        match settle(session.as_ref(), &msg, disposition).await {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                error!(error = err.to_string(), queue, "error settling msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
    }

    warn!(queue, "consumer cancelled");
    handler.handle(None).await;
}

async fn settle(
    session: &dyn BrokerSession,
    msg: &InboundMessage,
    disposition: Disposition,
) -> Result<(), AmqpError> {
    match disposition {
        Disposition::Ack => session.ack(msg.delivery_tag).await,
        Disposition::Nack { requeue } => session.nack(msg.delivery_tag, requeue).await,
    }
}
