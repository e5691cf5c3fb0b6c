//! Broker transport seam.
//!
//! Publishers and subscribers only ever talk to these traits. The in-memory
//! broker backs tests and single-process deployments; the Redis Streams
//! broker backs everything else.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::messaging::properties::{PropertyMap, RawProperties};

mod lanes;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use self::redis::{RedisStreamBroker, RedisStreamConfig};

/// Broker-assigned identifier of a published message.
pub type MessageId = String;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Messages sharing a key are delivered in publish order, one at a
    /// time per subscription. A negatively acknowledged message rejoins
    /// its key behind whatever was published after it.
    pub ordering_key: Option<String>,
    /// Business time of the event, distinct from publish time.
    pub event_time: Option<DateTime<Utc>>,
    /// Withhold delivery until this instant.
    pub deliver_at: Option<DateTime<Utc>>,
}

impl PublishOptions {
    pub fn deliver_at(at: DateTime<Utc>) -> Self {
        Self {
            deliver_at: Some(at),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub properties: PropertyMap,
    pub options: PublishOptions,
}

/// A delivery as handed over by the broker, before any decoding.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub message_id: MessageId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub properties: RawProperties,
    /// Milliseconds since the epoch.
    pub publish_time_ms: i64,
    /// Milliseconds since the epoch; `0` when the publisher set none.
    pub event_time_ms: i64,
    /// How many times this message was handed out before.
    pub redelivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionConfig {
    pub topic: String,
    pub subscription: String,
    pub consumer_name: Option<String>,
    /// Upper bound on deliveries handed to the listener concurrently.
    pub max_in_flight: usize,
}

impl SubscriptionConfig {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            consumer_name: None,
            max_in_flight: 32,
        }
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }
}

#[async_trait]
pub trait Broker: Send + Sync + fmt::Debug {
    async fn send(&self, topic: &str, message: OutboundMessage) -> Result<MessageId>;

    /// Attaches a consumer to a durable subscription and starts handing
    /// deliveries to `listener`.
    async fn subscribe(
        &self,
        config: SubscriptionConfig,
        listener: Arc<dyn MessageListener>,
    ) -> Result<Arc<dyn Consumer>>;
}

#[async_trait]
pub trait Consumer: Send + Sync + fmt::Debug {
    async fn acknowledge(&self, message: &RawMessage) -> Result<()>;

    /// Schedules the message for redelivery.
    async fn negative_acknowledge(&self, message: &RawMessage) -> Result<()>;

    /// Stops handing out new deliveries. Acknowledgements still go through.
    async fn pause(&self);

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: RawMessage, consumer: Arc<dyn Consumer>);
}
