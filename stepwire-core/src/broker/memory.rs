//! Process-local broker with durable subscriptions, redelivery on nack and
//! delayed delivery. Deliveries are handed out in publish order per
//! subscription, one at a time per ordering key.
//!
//! Published messages and settlements are only kept for inspection when the
//! broker was built with [`InMemoryBroker::recording`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::broker::lanes::OrderingLanes;
use crate::broker::{
    Broker, Consumer, MessageId, MessageListener, OutboundMessage, RawMessage,
    SubscriptionConfig,
};
use crate::error::{MessagingError, Result};
use crate::messaging::envelope::MessageEnvelope;
use crate::messaging::properties::{PropertyMap, RawProperties};

/// A message as it was accepted by [`InMemoryBroker::send`].
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub message_id: MessageId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: PropertyMap,
    pub ordering_key: Option<String>,
    pub deliver_at: Option<DateTime<Utc>>,
    sequence: u64,
    publish_time_ms: i64,
    event_time_ms: i64,
}

impl PublishedMessage {
    pub fn envelope(&self) -> Result<MessageEnvelope> {
        MessageEnvelope::from_bytes(&self.payload)
    }
}

#[derive(Default)]
struct Topic {
    subscriptions: HashMap<String, Arc<MemorySubscription>>,
    published: Vec<PublishedMessage>,
}

#[derive(Clone, Copy)]
enum Settlement {
    Acked,
    Nacked,
}

#[derive(Default)]
struct Settlements {
    acked: Vec<(String, MessageId)>,
    nacked: Vec<(String, MessageId)>,
}

struct Inner {
    topics: Mutex<HashMap<String, Topic>>,
    settlements: Mutex<Settlements>,
    sequence: AtomicU64,
    redelivery_delay: Duration,
    record: AtomicBool,
}

impl Inner {
    fn recording(&self) -> bool {
        self.record.load(Ordering::Relaxed)
    }

    fn settle(&self, settlement: Settlement, subscription: &str, message_id: &MessageId) {
        if !self.recording() {
            return;
        }
        let mut settlements = self.settlements.lock();
        let log = match settlement {
            Settlement::Acked => &mut settlements.acked,
            Settlement::Nacked => &mut settlements.nacked,
        };
        log.push((subscription.to_owned(), message_id.clone()));
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("topics", &self.inner.topics.lock().len())
            .field("redelivery_delay", &self.inner.redelivery_delay)
            .field("recording", &self.inner.recording())
            .finish()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_redelivery_delay(Duration::from_millis(100))
    }

    pub fn with_redelivery_delay(redelivery_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                settlements: Mutex::new(Settlements::default()),
                sequence: AtomicU64::new(1),
                redelivery_delay,
                record: AtomicBool::new(false),
            }),
        }
    }

    /// Keeps every published message and settlement so tests can inspect
    /// them. Nothing is ever released, so leave this off for long-running
    /// processes.
    pub fn recording(self) -> Self {
        self.inner.record.store(true, Ordering::Relaxed);
        self
    }

    /// Everything sent to `topic` while recording, in publish order.
    pub fn published(&self, topic: &str) -> Vec<PublishedMessage> {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|topic| topic.published.clone())
            .unwrap_or_default()
    }

    pub fn acknowledged(&self, subscription: &str) -> Vec<MessageId> {
        Self::settled(&self.inner.settlements.lock().acked, subscription)
    }

    pub fn negatively_acknowledged(&self, subscription: &str) -> Vec<MessageId> {
        Self::settled(&self.inner.settlements.lock().nacked, subscription)
    }

    fn settled(log: &[(String, MessageId)], subscription: &str) -> Vec<MessageId> {
        log.iter()
            .filter(|(name, _)| name == subscription)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Messages waiting in a subscription's backlog, not yet handed out.
    pub fn backlog(&self, topic: &str, subscription: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .and_then(|topic| topic.subscriptions.get(subscription))
            .map(|sub| sub.queued.load(Ordering::Acquire) as usize)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn send(&self, topic: &str, message: OutboundMessage) -> Result<MessageId> {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let message_id = format!("{topic}:{sequence}");
        let published = PublishedMessage {
            message_id: message_id.clone(),
            topic: topic.to_owned(),
            payload: message.payload,
            properties: message.properties,
            ordering_key: message.options.ordering_key,
            deliver_at: message.options.deliver_at,
            sequence,
            publish_time_ms: Utc::now().timestamp_millis(),
            event_time_ms: message
                .options
                .event_time
                .map(|ts| ts.timestamp_millis())
                .unwrap_or(0),
        };

        let subscriptions: Vec<Arc<MemorySubscription>> = {
            let mut topics = self.inner.topics.lock();
            let entry = topics.entry(topic.to_owned()).or_default();
            if self.inner.recording() {
                entry.published.push(published.clone());
            }
            entry.subscriptions.values().cloned().collect()
        };

        let delay = published
            .deliver_at
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .filter(|delay| !delay.is_zero());
        match delay {
            Some(delay) => {
                trace!(%message_id, delay_ms = delay.as_millis() as u64, "delaying delivery");
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for subscription in subscriptions {
                        subscription.enqueue(published.clone());
                    }
                });
            }
            None => {
                for subscription in subscriptions {
                    subscription.enqueue(published.clone());
                }
            }
        }
        Ok(message_id)
    }

    async fn subscribe(
        &self,
        config: SubscriptionConfig,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Arc<dyn Consumer>> {
        let subscription = {
            let mut topics = self.inner.topics.lock();
            let topic = topics.entry(config.topic.clone()).or_default();
            Arc::clone(
                topic
                    .subscriptions
                    .entry(config.subscription.clone())
                    .or_insert_with(|| {
                        Arc::new(MemorySubscription::new(
                            &config.topic,
                            &config.subscription,
                        ))
                    }),
            )
        };

        if subscription.attached.swap(true, Ordering::AcqRel) {
            return Err(MessagingError::Broker(format!(
                "subscription {} on {} already has a consumer",
                config.subscription, config.topic
            )));
        }
        let Some(receiver) = subscription.receiver.lock().take() else {
            subscription.attached.store(false, Ordering::Release);
            return Err(MessagingError::Broker(format!(
                "subscription {} on {} is still detaching",
                config.subscription, config.topic
            )));
        };

        let consumer = Arc::new(MemoryConsumer {
            subscription,
            broker: Arc::clone(&self.inner),
            cancel: CancellationToken::new(),
            connected: AtomicBool::new(true),
            dispatcher: Mutex::new(None),
        });
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&consumer),
            receiver,
            listener,
            config.max_in_flight.max(1),
        ));
        *consumer.dispatcher.lock() = Some(dispatcher);

        debug!(
            topic = %config.topic,
            subscription = %config.subscription,
            "in-memory consumer attached"
        );
        Ok(consumer)
    }
}

struct MemorySubscription {
    topic: String,
    name: String,
    sender: mpsc::UnboundedSender<PublishedMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<PublishedMessage>>>,
    queued: AtomicU64,
    handouts: Mutex<HashMap<MessageId, u32>>,
    unacked: Mutex<HashMap<MessageId, PublishedMessage>>,
    /// Taken off the queue by a dispatcher that stopped before starting them.
    held: Mutex<Vec<PublishedMessage>>,
    attached: AtomicBool,
}

impl MemorySubscription {
    fn new(topic: &str, name: &str) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            topic: topic.to_owned(),
            name: name.to_owned(),
            sender,
            receiver: Mutex::new(Some(receiver)),
            queued: AtomicU64::new(0),
            handouts: Mutex::new(HashMap::new()),
            unacked: Mutex::new(HashMap::new()),
            held: Mutex::new(Vec::new()),
            attached: AtomicBool::new(false),
        }
    }

    fn enqueue(&self, message: PublishedMessage) {
        // The receiver lives as long as the subscription, so this cannot fail.
        if self.sender.send(message).is_ok() {
            self.queued.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn set_aside(&self, messages: impl IntoIterator<Item = PublishedMessage>) {
        let mut held = self.held.lock();
        for message in messages {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            held.push(message);
        }
    }

    fn hand_out(&self, message: PublishedMessage) -> RawMessage {
        self.queued.fetch_sub(1, Ordering::AcqRel);
        let redelivery_count = {
            let mut handouts = self.handouts.lock();
            let count = handouts.entry(message.message_id.clone()).or_insert(0);
            let previous = *count;
            *count += 1;
            previous
        };
        let raw = RawMessage {
            message_id: message.message_id.clone(),
            topic: self.topic.clone(),
            payload: message.payload.clone(),
            properties: RawProperties::from(message.properties.clone()),
            publish_time_ms: message.publish_time_ms,
            event_time_ms: message.event_time_ms,
            redelivery_count,
        };
        self.unacked
            .lock()
            .insert(message.message_id.clone(), message);
        raw
    }
}

async fn dispatch(
    consumer: Arc<MemoryConsumer>,
    mut receiver: mpsc::UnboundedReceiver<PublishedMessage>,
    listener: Arc<dyn MessageListener>,
    max_in_flight: usize,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<String>();
    let mut lanes = OrderingLanes::default();
    loop {
        let message = tokio::select! {
            biased;
            _ = consumer.cancel.cancelled() => break,
            Some(key) = settled_rx.recv() => match lanes.release(&key) {
                Some(next) => next,
                None => continue,
            },
            message = receiver.recv() => match message {
                Some(message) => {
                    let key = message.ordering_key.clone();
                    match lanes.admit(key.as_deref(), message) {
                        Some(message) => message,
                        None => continue,
                    }
                }
                None => break,
            },
        };
        let permit = tokio::select! {
            biased;
            _ = consumer.cancel.cancelled() => {
                consumer.subscription.set_aside([message]);
                break;
            }
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    consumer.subscription.set_aside([message]);
                    break;
                }
            },
        };

        let key = message.ordering_key.clone();
        let raw = consumer.subscription.hand_out(message);
        let listener = Arc::clone(&listener);
        let handle: Arc<dyn Consumer> = consumer.clone();
        let settled = settled_tx.clone();
        tokio::spawn(async move {
            listener.on_message(raw, handle).await;
            drop(permit);
            if let Some(key) = key {
                let _ = settled.send(key);
            }
        });
    }
    consumer.subscription.set_aside(lanes.drain());
    *consumer.subscription.receiver.lock() = Some(receiver);
}

struct MemoryConsumer {
    subscription: Arc<MemorySubscription>,
    broker: Arc<Inner>,
    cancel: CancellationToken,
    connected: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for MemoryConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConsumer")
            .field("topic", &self.subscription.topic)
            .field("subscription", &self.subscription.name)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn acknowledge(&self, message: &RawMessage) -> Result<()> {
        self.subscription.unacked.lock().remove(&message.message_id);
        self.subscription.handouts.lock().remove(&message.message_id);
        self.broker.settle(
            Settlement::Acked,
            &self.subscription.name,
            &message.message_id,
        );
        Ok(())
    }

    async fn negative_acknowledge(&self, message: &RawMessage) -> Result<()> {
        let Some(pending) = self.subscription.unacked.lock().remove(&message.message_id)
        else {
            return Ok(());
        };
        self.broker.settle(
            Settlement::Nacked,
            &self.subscription.name,
            &message.message_id,
        );

        let subscription = Arc::clone(&self.subscription);
        let delay = self.broker.redelivery_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            subscription.enqueue(pending);
        });
        Ok(())
    }

    async fn pause(&self) {
        self.cancel.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            let _ = dispatcher.await;
        }
    }

    async fn close(&self) -> Result<()> {
        self.pause().await;
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        // Unsettled, held and queued messages go back in publish order so
        // the next consumer sees each ordering key in sequence.
        let mut returning: Vec<PublishedMessage> = self
            .subscription
            .unacked
            .lock()
            .drain()
            .map(|(_, message)| message)
            .collect();
        returning.append(&mut self.subscription.held.lock());
        if let Some(receiver) = self.subscription.receiver.lock().as_mut() {
            while let Ok(message) = receiver.try_recv() {
                self.subscription.queued.fetch_sub(1, Ordering::AcqRel);
                returning.push(message);
            }
        }
        returning.sort_by_key(|message| message.sequence);
        for message in returning {
            self.subscription.enqueue(message);
        }
        self.subscription.attached.store(false, Ordering::Release);
        debug!(
            topic = %self.subscription.topic,
            subscription = %self.subscription.name,
            "in-memory consumer closed"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PublishOptions;
    use tokio::sync::mpsc::UnboundedSender;

    struct Forward(UnboundedSender<RawMessage>, bool);

    #[async_trait]
    impl MessageListener for Forward {
        async fn on_message(&self, message: RawMessage, consumer: Arc<dyn Consumer>) {
            if self.1 {
                consumer.acknowledge(&message).await.unwrap();
            } else {
                consumer.negative_acknowledge(&message).await.unwrap();
            }
            let _ = self.0.send(message);
        }
    }

    fn outbound(body: &str, options: PublishOptions) -> OutboundMessage {
        OutboundMessage {
            payload: body.as_bytes().to_vec(),
            properties: PropertyMap::from([("k".into(), "v".into())]),
            options,
        }
    }

    #[tokio::test]
    async fn fans_out_to_every_subscription() {
        let broker = InMemoryBroker::new().recording();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        broker
            .subscribe(SubscriptionConfig::new("t", "a"), Arc::new(Forward(tx_a, true)))
            .await
            .unwrap();
        broker
            .subscribe(SubscriptionConfig::new("t", "b"), Arc::new(Forward(tx_b, true)))
            .await
            .unwrap();

        let id = broker
            .send("t", outbound("hello", PublishOptions::default()))
            .await
            .unwrap();

        assert_eq!(rx_a.recv().await.unwrap().message_id, id);
        let delivered = rx_b.recv().await.unwrap();
        assert_eq!(delivered.payload, b"hello");
        assert_eq!(delivered.event_time_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nacked_messages_come_back_with_higher_redelivery_count() {
        let broker = InMemoryBroker::with_redelivery_delay(Duration::from_secs(1)).recording();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .subscribe(SubscriptionConfig::new("t", "s"), Arc::new(Forward(tx, false)))
            .await
            .unwrap();
        broker
            .send("t", outbound("again", PublishOptions::default()))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().redelivery_count, 0);
        assert_eq!(rx.recv().await.unwrap().redelivery_count, 1);
        assert_eq!(rx.recv().await.unwrap().redelivery_count, 2);
        assert!(broker.negatively_acknowledged("s").len() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deliver_at_withholds_the_message() {
        let broker = InMemoryBroker::new().recording();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .subscribe(SubscriptionConfig::new("t", "s"), Arc::new(Forward(tx, true)))
            .await
            .unwrap();

        let at = Utc::now() + chrono::Duration::seconds(30);
        broker
            .send("t", outbound("later", PublishOptions::deliver_at(at)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.payload, b"later");
    }

    #[tokio::test]
    async fn second_consumer_on_a_subscription_is_refused() {
        let broker = InMemoryBroker::new().recording();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = broker
            .subscribe(
                SubscriptionConfig::new("t", "s"),
                Arc::new(Forward(tx.clone(), true)),
            )
            .await
            .unwrap();
        assert!(
            broker
                .subscribe(SubscriptionConfig::new("t", "s"), Arc::new(Forward(tx.clone(), true)))
                .await
                .is_err()
        );

        first.close().await.unwrap();
        assert!(!first.is_connected());
        broker
            .subscribe(SubscriptionConfig::new("t", "s"), Arc::new(Forward(tx, true)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn paused_subscription_keeps_its_backlog() {
        let broker = InMemoryBroker::new().recording();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = broker
            .subscribe(SubscriptionConfig::new("t", "s"), Arc::new(Forward(tx.clone(), true)))
            .await
            .unwrap();
        consumer.close().await.unwrap();

        broker
            .send("t", outbound("queued", PublishOptions::default()))
            .await
            .unwrap();
        assert_eq!(broker.backlog("t", "s"), 1);

        broker
            .subscribe(SubscriptionConfig::new("t", "s"), Arc::new(Forward(tx, true)))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, b"queued");
    }

    struct Slowest(UnboundedSender<String>);

    #[async_trait]
    impl MessageListener for Slowest {
        async fn on_message(&self, message: RawMessage, consumer: Arc<dyn Consumer>) {
            let body = String::from_utf8_lossy(&message.payload).into_owned();
            if body == "first" {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            consumer.acknowledge(&message).await.unwrap();
            let _ = self.0.send(body);
        }
    }

    fn keyed(key: &str) -> PublishOptions {
        PublishOptions {
            ordering_key: Some(key.to_owned()),
            ..PublishOptions::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_ordering_key_settles_in_publish_order() {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .subscribe(SubscriptionConfig::new("t", "s"), Arc::new(Slowest(tx)))
            .await
            .unwrap();

        broker.send("t", outbound("first", keyed("run_1"))).await.unwrap();
        broker.send("t", outbound("second", keyed("run_1"))).await.unwrap();
        broker.send("t", outbound("other", keyed("run_2"))).await.unwrap();

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.unwrap());
        }
        // run_2 does not wait behind run_1.
        assert_eq!(order, vec!["other", "first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_returns_held_messages_in_publish_order() {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = broker
            .subscribe(SubscriptionConfig::new("t", "s"), Arc::new(Slowest(tx.clone())))
            .await
            .unwrap();
        broker.send("t", outbound("first", keyed("run_1"))).await.unwrap();
        broker.send("t", outbound("second", keyed("run_1"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        consumer.close().await.unwrap();
        assert_eq!(broker.backlog("t", "s"), 2);

        let (tx_next, mut rx_next) = mpsc::unbounded_channel();
        broker
            .subscribe(SubscriptionConfig::new("t", "s"), Arc::new(Forward(tx_next, true)))
            .await
            .unwrap();
        assert_eq!(rx_next.recv().await.unwrap().payload, b"first");
        assert_eq!(rx_next.recv().await.unwrap().payload, b"second");
        drop(rx.recv().await);
    }

    #[tokio::test]
    async fn without_recording_nothing_is_retained() {
        let broker = InMemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .subscribe(SubscriptionConfig::new("t", "s"), Arc::new(Forward(tx, true)))
            .await
            .unwrap();

        for body in ["one", "two"] {
            broker
                .send("t", outbound(body, PublishOptions::default()))
                .await
                .unwrap();
        }
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        assert!(broker.published("t").is_empty());
        assert!(broker.acknowledged("s").is_empty());
        let topics = broker.inner.topics.lock();
        let subscription = &topics["t"].subscriptions["s"];
        assert!(subscription.unacked.lock().is_empty());
        assert!(subscription.handouts.lock().is_empty());
    }
}
