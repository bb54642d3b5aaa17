// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! End-to-end scenarios against a live RabbitMQ.
//!
//! Run with `cargo test -- --ignored`. The broker list is read from
//! `FW_AMPQ_TEST_BROKERS` (default `localhost:5672`).

use amqp_facade::{
    BrokerFactory, ConfigResolver, Consumer, Destination, Disposition, ExchangeDefinition,
    Identity, InboundMessage, LapinConnector, Producer, PublishOptions,
};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn unique(name: &str) -> String {
    format!("{}-{}", name, Uuid::new_v4())
}

fn factory() -> BrokerFactory {
    BrokerFactory::new(ConfigResolver::shared(), Arc::new(LapinConnector::new()))
}

fn consumer() -> Consumer {
    let cfg = ConfigResolver::shared().resolve(Some("test")).unwrap();
    Consumer::new(cfg, Arc::new(LapinConnector::new()))
}

fn producer() -> Producer {
    let cfg = ConfigResolver::shared().resolve(Some("test")).unwrap();
    Producer::new(cfg, Arc::new(LapinConnector::new()))
}

/// Forwards every payload to `tx`, tagged with `id`.
fn forward(
    id: usize,
    tx: mpsc::UnboundedSender<(usize, String)>,
) -> impl Fn(Option<&InboundMessage>) -> Disposition + Send + Sync + 'static {
    move |msg: Option<&InboundMessage>| {
        if let Some(text) = msg.and_then(|m| m.text()) {
            let _ = tx.send((id, text.to_owned()));
        }
        Disposition::Ack
    }
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running broker"]
async fn send_and_subscribe_delivers_once() {
    init_tracing();
    let queue = unique("q1");
    let factory = factory();
    let producer = factory.get_producer(Identity::from("test")).await.unwrap();
    let consumer = factory.get_consumer("test", None).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = consumer.subscribe(&queue, forward(0, tx), true).await.unwrap();

    assert!(producer
        .send_to_queue(&queue, b"hello", &PublishOptions::default())
        .await
        .unwrap());

    let (_, text) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(text, "hello");
    assert!(timeout(Duration::from_millis(500), rx.recv()).await.is_err());

    sub.cancel();
    factory.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running broker"]
async fn prefetch_one_consumers_share_the_work() {
    init_tracing();
    let queue = unique("q2");
    let producer = producer();
    let (first, second) = (consumer(), consumer());
    first.connect(Some(1)).await.unwrap();
    second.connect(Some(1)).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    first.subscribe(&queue, forward(1, tx.clone()), false).await.unwrap();
    second.subscribe(&queue, forward(2, tx), false).await.unwrap();

    for i in 0..20 {
        let payload = format!("msg-{}", i);
        producer
            .send_to_queue(&queue, payload.as_bytes(), &PublishOptions::default())
            .await
            .unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..20 {
        let (_, text) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(seen.insert(text), "message delivered twice");
    }
    assert_eq!(seen.len(), 20);
    assert!(timeout(Duration::from_millis(500), rx.recv()).await.is_err());

    producer.disconnect().await;
    first.disconnect().await;
    second.disconnect().await;
}

#[tokio::test(flavor = "multi_thread")]
#[ignore = "requires a running broker"]
async fn fanout_subscribers_each_see_every_message_in_order() {
    init_tracing();
    let exchange = unique("fx1");
    let producer = producer();
    let (first, second) = (consumer(), consumer());

    let (tx, mut rx) = mpsc::unbounded_channel();
    first
        .subscribe_to_fanout_exchange(&exchange, forward(1, tx.clone()), true)
        .await
        .unwrap();
    second
        .subscribe_to_fanout_exchange(&exchange, forward(2, tx), true)
        .await
        .unwrap();

    let dest = Destination::with_definition(ExchangeDefinition::new(&exchange).fanout().durable());
    for i in 0..20 {
        let payload = format!("msg-{}", i);
        producer
            .publish(&dest, payload.as_bytes(), &PublishOptions::default())
            .await
            .unwrap();
    }

    let (mut one, mut two) = (Vec::new(), Vec::new());
    for _ in 0..40 {
        match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
            (1, text) => one.push(text),
            (_, text) => two.push(text),
        }
    }

    let expected: Vec<String> = (0..20).map(|i| format!("msg-{}", i)).collect();
    assert_eq!(one, expected);
    assert_eq!(two, expected);

    producer.disconnect().await;
    first.disconnect().await;
    second.disconnect().await;
}
