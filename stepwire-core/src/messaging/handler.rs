//! Typed handlers and the registry that binds them to catalog entries.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{HandlerError, MessagingError, Result, SchemaTarget};
use crate::messaging::catalog::{MessageCatalog, MessageType};
use crate::messaging::envelope::DeliveryAttributes;
use crate::messaging::properties::{PropertyMap, decode_properties};

/// A validated, typed delivery.
pub struct Delivery<M: MessageType> {
    /// Envelope id assigned by the publisher.
    pub id: String,
    pub data: M::Data,
    pub properties: M::Properties,
    pub attributes: DeliveryAttributes,
}

impl<M> fmt::Debug for Delivery<M>
where
    M: MessageType,
    M::Data: fmt::Debug,
    M::Properties: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("type", &M::TYPE)
            .field("id", &self.id)
            .field("data", &self.data)
            .field("properties", &self.properties)
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// Processes deliveries of one message type.
///
/// `Ok(true)` means the message was handled. `Ok(false)` declines it and
/// asks for redelivery.
#[async_trait]
pub trait MessageHandler<M: MessageType>: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery<M>) -> Result<bool, HandlerError>;
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct HandlerFn<F>(F);

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFn")
    }
}

pub fn handler_fn<M, F, Fut>(f: F) -> HandlerFn<F>
where
    M: MessageType,
    F: Fn(Delivery<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for HandlerFn<F>
where
    M: MessageType,
    F: Fn(Delivery<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, HandlerError>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery<M>) -> Result<bool, HandlerError> {
        (self.0)(delivery).await
    }
}

#[derive(Debug)]
pub(crate) enum DispatchError {
    Validation(MessagingError),
    Handler(HandlerError),
}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn dispatch(
        &self,
        id: String,
        data: Value,
        properties: &PropertyMap,
        attributes: DeliveryAttributes,
    ) -> Result<bool, DispatchError>;
}

struct Typed<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> ErasedHandler for Typed<M, H>
where
    M: MessageType,
    H: MessageHandler<M>,
{
    async fn dispatch(
        &self,
        id: String,
        data: Value,
        properties: &PropertyMap,
        attributes: DeliveryAttributes,
    ) -> Result<bool, DispatchError> {
        let data: M::Data = serde_json::from_value(data).map_err(|err| {
            DispatchError::Validation(MessagingError::schema(
                M::TYPE,
                SchemaTarget::Data,
                err,
            ))
        })?;
        let properties: M::Properties =
            decode_properties(properties).map_err(|err| {
                DispatchError::Validation(MessagingError::schema(
                    M::TYPE,
                    SchemaTarget::Properties,
                    err,
                ))
            })?;
        self.handler
            .handle(Delivery {
                id,
                data,
                properties,
                attributes,
            })
            .await
            .map_err(DispatchError::Handler)
    }
}

/// One handler per catalog entry, fixed at construction.
#[derive(Clone)]
pub struct HandlerRegistry {
    catalog: Arc<MessageCatalog>,
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn builder(catalog: Arc<MessageCatalog>) -> HandlerRegistryBuilder {
        HandlerRegistryBuilder {
            catalog,
            handlers: HashMap::new(),
            error: None,
        }
    }

    pub fn catalog(&self) -> &Arc<MessageCatalog> {
        &self.catalog
    }

    pub(crate) fn resolve(&self, message_type: &str) -> Result<&Arc<dyn ErasedHandler>> {
        self.catalog.lookup(message_type)?;
        self.handlers
            .get(message_type)
            .ok_or_else(|| MessagingError::MissingHandler {
                message_type: message_type.to_owned(),
            })
    }
}

pub struct HandlerRegistryBuilder {
    catalog: Arc<MessageCatalog>,
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
    error: Option<MessagingError>,
}

impl fmt::Debug for HandlerRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistryBuilder")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .field("error", &self.error)
            .finish()
    }
}

impl HandlerRegistryBuilder {
    pub fn on<M, H>(mut self, handler: H) -> Self
    where
        M: MessageType,
        H: MessageHandler<M>,
    {
        if self.error.is_some() {
            return self;
        }
        if !self.catalog.contains(M::TYPE) {
            self.error = Some(MessagingError::unknown(M::TYPE));
            return self;
        }
        let typed: Arc<dyn ErasedHandler> = Arc::new(Typed::<M, H> {
            handler,
            _message: PhantomData,
        });
        if self.handlers.insert(M::TYPE, typed).is_some() {
            self.error = Some(MessagingError::DuplicateType {
                message_type: M::TYPE.to_owned(),
            });
        }
        self
    }

    /// Every catalog type must end up with exactly one handler.
    pub fn build(self) -> Result<HandlerRegistry> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let mut missing: Vec<_> = self
            .catalog
            .message_types()
            .filter(|name| !self.handlers.contains_key(name))
            .collect();
        missing.sort_unstable();
        if let Some(first) = missing.first() {
            return Err(MessagingError::MissingHandler {
                message_type: (*first).to_owned(),
            });
        }
        Ok(HandlerRegistry {
            catalog: self.catalog,
            handlers: self.handlers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    struct PingMsg;
    impl MessageType for PingMsg {
        const TYPE: &'static str = "PING";
        type Data = Ping;
        type Properties = ();
    }

    struct PongMsg;
    impl MessageType for PongMsg {
        const TYPE: &'static str = "PONG";
        type Data = Ping;
        type Properties = ();
    }

    fn catalog() -> Arc<MessageCatalog> {
        Arc::new(
            MessageCatalog::builder()
                .register::<PingMsg>()
                .register::<PongMsg>()
                .build()
                .unwrap(),
        )
    }

    fn accept<M: MessageType>() -> HandlerFn<
        impl Fn(Delivery<M>) -> futures::future::Ready<Result<bool, HandlerError>>
        + Send
        + Sync
        + 'static,
    > {
        handler_fn(|_: Delivery<M>| futures::future::ready(Ok(true)))
    }

    #[test]
    fn every_catalog_type_needs_a_handler() {
        let err = HandlerRegistry::builder(catalog())
            .on::<PingMsg, _>(accept::<PingMsg>())
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            MessagingError::MissingHandler { message_type } if message_type == "PONG"
        ));
    }

    #[test]
    fn second_handler_for_a_type_is_rejected() {
        let err = HandlerRegistry::builder(catalog())
            .on::<PingMsg, _>(accept::<PingMsg>())
            .on::<PingMsg, _>(accept::<PingMsg>())
            .on::<PongMsg, _>(accept::<PongMsg>())
            .build()
            .unwrap_err();
        assert!(matches!(err, MessagingError::DuplicateType { .. }));
    }

    #[test]
    fn handler_for_uncatalogued_type_is_rejected() {
        struct Stray;
        impl MessageType for Stray {
            const TYPE: &'static str = "STRAY";
            type Data = Value;
            type Properties = ();
        }

        let err = HandlerRegistry::builder(catalog())
            .on::<Stray, _>(accept::<Stray>())
            .build()
            .unwrap_err();
        assert!(matches!(err, MessagingError::UnknownMessageType { .. }));
    }

    #[tokio::test]
    async fn dispatch_validates_before_calling_the_handler() {
        let registry = HandlerRegistry::builder(catalog())
            .on::<PingMsg, _>(handler_fn(|delivery: Delivery<PingMsg>| async move {
                Ok(delivery.data.n > 0)
            }))
            .on::<PongMsg, _>(accept::<PongMsg>())
            .build()
            .unwrap();
        let handler = registry.resolve("PING").unwrap();
        let attrs = DeliveryAttributes {
            message_id: "m".into(),
            event_timestamp: None,
            published_timestamp: chrono::Utc::now(),
            redelivery_count: 0,
        };

        let handled = handler
            .dispatch("e1".into(), serde_json::json!({"n": 2}), &PropertyMap::new(), attrs.clone())
            .await
            .unwrap();
        assert!(handled);

        let rejected = handler
            .dispatch("e2".into(), serde_json::json!({"n": "two"}), &PropertyMap::new(), attrs)
            .await
            .unwrap_err();
        assert!(matches!(rejected, DispatchError::Validation(_)));

        assert!(matches!(
            registry.resolve("UNKNOWN"),
            Err(MessagingError::UnknownMessageType { .. })
        ));
    }
}
