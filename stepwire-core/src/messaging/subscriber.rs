use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::broker::{
    Broker, Consumer, MessageListener, OutboundMessage, PublishOptions,
    RawMessage, SubscriptionConfig,
};
use crate::error::{HandlerError, Result};
use crate::messaging::envelope::{DeliveryAttributes, MessageEnvelope};
use crate::messaging::handler::{DispatchError, HandlerRegistry};
use crate::messaging::policy::{
    DEAD_LETTER_REASON, DeliveryOutcome, Disposition, FailurePolicy,
    ORIGINAL_MESSAGE_ID, ORIGINAL_TOPIC,
};
use crate::messaging::properties::normalize_properties;

/// Connection lifecycle of a [`Subscriber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberStatus {
    WaitingToConnect,
    Initializing,
    Ready,
    Error,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    pub failure_policy: FailurePolicy,
    /// Upper bound on a single handler invocation. `None` waits forever.
    pub handler_timeout: Option<Duration>,
    /// How long `close` waits for in-flight handlers.
    pub shutdown_timeout: Duration,
    pub dead_letter_topic: Option<String>,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            handler_timeout: Some(Duration::from_secs(30)),
            shutdown_timeout: Duration::from_secs(30),
            dead_letter_topic: None,
        }
    }
}

struct State {
    status: SubscriberStatus,
    consumer: Option<Arc<dyn Consumer>>,
}

/// Validates deliveries from one subscription and routes them to typed
/// handlers.
pub struct Subscriber {
    broker: Arc<dyn Broker>,
    config: SubscriptionConfig,
    pipeline: Arc<DeliveryPipeline>,
    shutdown_timeout: Duration,
    state: Mutex<State>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("topic", &self.config.topic)
            .field("subscription", &self.config.subscription)
            .field("in_flight", &self.pipeline.tracker.len())
            .finish()
    }
}

impl Subscriber {
    pub fn new(
        broker: Arc<dyn Broker>,
        config: SubscriptionConfig,
        handlers: HandlerRegistry,
        settings: SubscriberSettings,
    ) -> Self {
        let pipeline = Arc::new(DeliveryPipeline {
            topic: config.topic.clone(),
            subscription: config.subscription.clone(),
            broker: Arc::clone(&broker),
            handlers,
            policy: settings.failure_policy,
            handler_timeout: settings.handler_timeout,
            dead_letter_topic: settings.dead_letter_topic,
            tracker: TaskTracker::new(),
            closing: AtomicBool::new(false),
        });
        Self {
            broker,
            config,
            pipeline,
            shutdown_timeout: settings.shutdown_timeout,
            state: Mutex::new(State {
                status: SubscriberStatus::WaitingToConnect,
                consumer: None,
            }),
        }
    }

    pub async fn status(&self) -> SubscriberStatus {
        self.state.lock().await.status
    }

    /// Deliveries currently being processed.
    pub fn in_flight(&self) -> usize {
        self.pipeline.tracker.len()
    }

    /// Connects to the broker. Only the first call attempts a connection;
    /// later calls report whether that attempt left the subscriber ready.
    pub async fn initialize(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status != SubscriberStatus::WaitingToConnect {
            return state.status == SubscriberStatus::Ready;
        }
        state.status = SubscriberStatus::Initializing;
        info!(
            topic = %self.config.topic,
            subscription = %self.config.subscription,
            "initializing subscriber"
        );

        let listener: Arc<dyn MessageListener> = self.pipeline.clone();
        match self.broker.subscribe(self.config.clone(), listener).await {
            Ok(consumer) => {
                state.consumer = Some(consumer);
                state.status = SubscriberStatus::Ready;
                true
            }
            Err(err) => {
                error!(
                    topic = %self.config.topic,
                    subscription = %self.config.subscription,
                    error = %err,
                    "failed to subscribe"
                );
                state.status = SubscriberStatus::Error;
                false
            }
        }
    }

    /// Stops intake, waits up to the shutdown timeout for in-flight
    /// handlers, then closes the consumer. A no-op when not connected.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(consumer) = state.consumer.take() else {
            return Ok(());
        };

        self.pipeline.closing.store(true, Ordering::Release);
        consumer.pause().await;
        self.pipeline.tracker.close();

        let timeout = self.shutdown_timeout;
        if tokio::time::timeout(timeout, self.pipeline.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                topic = %self.config.topic,
                subscription = %self.config.subscription,
                in_flight = self.pipeline.tracker.len(),
                timeout_secs = timeout.as_secs(),
                "in-flight handlers did not finish before shutdown timeout"
            );
        }

        state.status = SubscriberStatus::Closed;
        if consumer.is_connected() {
            consumer.close().await?;
        }
        info!(
            topic = %self.config.topic,
            subscription = %self.config.subscription,
            "subscriber closed"
        );
        Ok(())
    }
}

struct DeliveryPipeline {
    topic: String,
    subscription: String,
    broker: Arc<dyn Broker>,
    handlers: HandlerRegistry,
    policy: FailurePolicy,
    handler_timeout: Option<Duration>,
    dead_letter_topic: Option<String>,
    tracker: TaskTracker,
    closing: AtomicBool,
}

#[async_trait]
impl MessageListener for DeliveryPipeline {
    async fn on_message(&self, message: RawMessage, consumer: Arc<dyn Consumer>) {
        let _in_flight = self.tracker.token();
        if self.closing.load(Ordering::Acquire) {
            debug!(
                topic = %self.topic,
                message_id = %message.message_id,
                "subscriber closing, returning message to broker"
            );
            if let Err(err) = consumer.negative_acknowledge(&message).await {
                warn!(message_id = %message.message_id, error = %err, "failed to nack message");
            }
            return;
        }

        let attributes = DeliveryAttributes::from_raw(&message);
        let redelivery_count = attributes.redelivery_count;
        debug!(
            topic = %self.topic,
            subscription = %self.subscription,
            message_id = %attributes.message_id,
            published_at = %attributes.published_timestamp,
            redelivery_count,
            "received message"
        );

        let outcome = self.process(&message, attributes).await;
        let disposition = self.policy.disposition(&outcome, redelivery_count);
        self.settle(&message, consumer.as_ref(), disposition).await;
    }
}

impl DeliveryPipeline {
    async fn process(
        &self,
        message: &RawMessage,
        attributes: DeliveryAttributes,
    ) -> DeliveryOutcome {
        let envelope = match MessageEnvelope::from_bytes(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!(
                    topic = %self.topic,
                    message_id = %message.message_id,
                    error = %err,
                    "received malformed message"
                );
                return DeliveryOutcome::Rejected(err);
            }
        };

        let handler = match self.handlers.resolve(&envelope.message_type) {
            Ok(handler) => Arc::clone(handler),
            Err(err) => {
                error!(
                    topic = %self.topic,
                    message_id = %message.message_id,
                    message_type = %envelope.message_type,
                    error = %err,
                    "received message of unknown type"
                );
                return DeliveryOutcome::Rejected(err);
            }
        };

        let message_type = envelope.message_type;
        let properties = normalize_properties(message.properties.clone());
        let dispatch =
            handler.dispatch(envelope.id, envelope.data, &properties, attributes);
        let result = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, dispatch).await {
                Ok(result) => result,
                Err(_) => Err(DispatchError::Handler(HandlerError::retryable(
                    format!("handler timed out after {}ms", limit.as_millis()),
                ))),
            },
            None => dispatch.await,
        };

        match result {
            Ok(true) => DeliveryOutcome::Handled,
            Ok(false) => {
                debug!(
                    message_id = %message.message_id,
                    %message_type,
                    "handler declined message"
                );
                DeliveryOutcome::Declined
            }
            Err(DispatchError::Validation(err)) => {
                error!(
                    topic = %self.topic,
                    message_id = %message.message_id,
                    %message_type,
                    error = %err,
                    "received invalid message data or properties"
                );
                DeliveryOutcome::Rejected(err)
            }
            Err(DispatchError::Handler(err)) => {
                error!(
                    topic = %self.topic,
                    message_id = %message.message_id,
                    %message_type,
                    retryable = err.retryable,
                    error = %err,
                    "error handling message"
                );
                DeliveryOutcome::HandlerFailed(err)
            }
        }
    }

    async fn settle(
        &self,
        message: &RawMessage,
        consumer: &dyn Consumer,
        disposition: Disposition,
    ) {
        let settled = match disposition {
            Disposition::Acknowledge => consumer.acknowledge(message).await,
            Disposition::NegativeAcknowledge => {
                consumer.negative_acknowledge(message).await
            }
            Disposition::DeadLetter { reason } => {
                match self.dead_letter(message, &reason).await {
                    Ok(()) => consumer.acknowledge(message).await,
                    Err(err) => {
                        error!(
                            message_id = %message.message_id,
                            error = %err,
                            "failed to dead-letter message, leaving it for redelivery"
                        );
                        consumer.negative_acknowledge(message).await
                    }
                }
            }
        };
        if let Err(err) = settled {
            warn!(
                topic = %self.topic,
                message_id = %message.message_id,
                error = %err,
                "failed to settle message"
            );
        }
    }

    async fn dead_letter(&self, message: &RawMessage, reason: &str) -> Result<()> {
        let Some(dead_letter_topic) = self.dead_letter_topic.as_deref() else {
            warn!(
                topic = %self.topic,
                message_id = %message.message_id,
                reason,
                "dropping message, no dead-letter topic configured"
            );
            return Ok(());
        };

        let mut properties = normalize_properties(message.properties.clone());
        properties.insert(DEAD_LETTER_REASON.to_owned(), reason.to_owned());
        properties.insert(ORIGINAL_TOPIC.to_owned(), self.topic.clone());
        properties.insert(ORIGINAL_MESSAGE_ID.to_owned(), message.message_id.clone());

        self.broker
            .send(
                dead_letter_topic,
                OutboundMessage {
                    payload: message.payload.clone(),
                    properties,
                    options: PublishOptions::default(),
                },
            )
            .await?;
        warn!(
            topic = %self.topic,
            dead_letter_topic,
            message_id = %message.message_id,
            reason,
            "message dead-lettered"
        );
        Ok(())
    }
}
