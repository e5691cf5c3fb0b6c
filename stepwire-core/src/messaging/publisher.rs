use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::broker::{Broker, MessageId, OutboundMessage, PublishOptions};
use crate::error::{MessagingError, Result, SchemaTarget};
use crate::messaging::catalog::{MessageCatalog, MessageType};
use crate::messaging::envelope::MessageEnvelope;
use crate::messaging::properties::{PropertyMap, encode_properties};

/// What a successful publish returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Envelope id, visible to handlers as `Delivery::id`.
    pub envelope_id: String,
    pub message_id: MessageId,
}

/// Validates messages against a catalog and sends them to one topic.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    catalog: Arc<MessageCatalog>,
    topic: Arc<str>,
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .field("types", &self.catalog.len())
            .finish()
    }
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        catalog: Arc<MessageCatalog>,
        topic: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            broker,
            catalog,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Same broker and catalog, different topic.
    pub fn with_topic(&self, topic: impl Into<Arc<str>>) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            catalog: Arc::clone(&self.catalog),
            topic: topic.into(),
        }
    }

    pub async fn publish<M: MessageType>(
        &self,
        data: &M::Data,
        properties: Option<&M::Properties>,
    ) -> Result<PublishReceipt> {
        self.publish_with::<M>(data, properties, PublishOptions::default())
            .await
    }

    pub async fn publish_with<M: MessageType>(
        &self,
        data: &M::Data,
        properties: Option<&M::Properties>,
        options: PublishOptions,
    ) -> Result<PublishReceipt> {
        let data = serde_json::to_value(data)?;
        let properties = match properties {
            Some(properties) => encode_properties(properties).map_err(|err| {
                MessagingError::schema(M::TYPE, SchemaTarget::Properties, err)
            })?,
            None => PropertyMap::new(),
        };
        self.publish_raw(M::TYPE, data, properties, options).await
    }

    /// Publishes an untyped payload. Nothing reaches the broker unless both
    /// data and properties pass the catalog entry's schema.
    pub async fn publish_raw(
        &self,
        message_type: &str,
        data: Value,
        properties: PropertyMap,
        options: PublishOptions,
    ) -> Result<PublishReceipt> {
        let entry = self.catalog.lookup(message_type)?;
        entry.validate(&data, &properties)?;

        let envelope = MessageEnvelope::new(entry.message_type(), data);
        let payload = envelope.to_bytes()?;
        let message_id = self
            .broker
            .send(
                &self.topic,
                OutboundMessage {
                    payload,
                    properties,
                    options,
                },
            )
            .await?;

        debug!(
            topic = %self.topic,
            message_type = entry.message_type(),
            envelope_id = %envelope.id,
            %message_id,
            "published message"
        );
        Ok(PublishReceipt {
            envelope_id: envelope.id,
            message_id,
        })
    }
}
