use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::broker::{Broker, SubscriptionConfig};
use crate::error::{HandlerError, Result};
use crate::messaging::{
    Delivery, HandlerRegistry, HandlerRegistryBuilder, MessageCatalog,
    MessageHandler, Publisher, Subscriber, SubscriberSettings, SubscriberStatus,
};
use crate::rpc::method::{
    RpcMethod, RpcReply, RpcReplyProperties, RpcRequestMessage,
    RpcResponseMessage,
};

/// Answers one RPC method. Handlers must tolerate the same request arriving
/// more than once.
#[async_trait]
pub trait RpcHandler<M: RpcMethod>: Send + Sync + 'static {
    async fn handle(&self, request: M::Request) -> Result<M::Response, HandlerError>;
}

pub struct RpcHandlerFn<F>(F);

impl<F> fmt::Debug for RpcHandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RpcHandlerFn")
    }
}

pub fn rpc_handler_fn<M, F, Fut>(f: F) -> RpcHandlerFn<F>
where
    M: RpcMethod,
    F: Fn(M::Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<M::Response, HandlerError>> + Send + 'static,
{
    RpcHandlerFn(f)
}

#[async_trait]
impl<M, F, Fut> RpcHandler<M> for RpcHandlerFn<F>
where
    M: RpcMethod,
    F: Fn(M::Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<M::Response, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: M::Request) -> Result<M::Response, HandlerError> {
        (self.0)(request).await
    }
}

/// Runs an [`RpcHandler`] and publishes its answer to the caller's reply
/// topic.
struct Responder<M, H> {
    handler: H,
    replies: Publisher,
    _method: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> MessageHandler<RpcRequestMessage<M>> for Responder<M, H>
where
    M: RpcMethod,
    H: RpcHandler<M>,
{
    async fn handle(
        &self,
        delivery: Delivery<RpcRequestMessage<M>>,
    ) -> Result<bool, HandlerError> {
        let properties = delivery.properties;
        let response = self.handler.handle(delivery.data).await?;

        let payload = serde_json::to_value(&response).map_err(|err| {
            HandlerError::permanent(format!("failed to encode {} response: {err}", M::NAME))
        })?;
        M::Response::deserialize(&payload).map_err(|err| {
            HandlerError::permanent(format!(
                "{} response does not match its schema: {err}",
                M::NAME
            ))
        })?;

        let reply = RpcReply {
            method: M::NAME.to_owned(),
            correlation_id: properties.correlation_id.clone(),
            payload,
        };
        self.replies
            .with_topic(properties.reply_topic.as_str())
            .publish::<RpcResponseMessage>(
                &reply,
                Some(&RpcReplyProperties {
                    correlation_id: properties.correlation_id.clone(),
                }),
            )
            .await
            .map_err(|err| HandlerError::retryable(format!("failed to send reply: {err}")))?;

        debug!(
            method = M::NAME,
            correlation_id = %properties.correlation_id,
            reply_topic = %properties.reply_topic,
            "sent RPC reply"
        );
        Ok(true)
    }
}

/// Serves the methods of one request catalog from one subscription.
pub struct RpcServer {
    subscriber: Subscriber,
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("subscriber", &self.subscriber)
            .finish()
    }
}

impl RpcServer {
    pub fn builder(
        broker: Arc<dyn Broker>,
        catalog: Arc<MessageCatalog>,
    ) -> Result<RpcServerBuilder> {
        let reply_catalog = Arc::new(
            MessageCatalog::builder()
                .register::<RpcResponseMessage>()
                .build()?,
        );
        Ok(RpcServerBuilder {
            replies: Publisher::new(Arc::clone(&broker), reply_catalog, ""),
            broker,
            handlers: HandlerRegistry::builder(catalog),
        })
    }

    pub async fn start(&self) -> bool {
        self.subscriber.initialize().await
    }

    pub async fn status(&self) -> SubscriberStatus {
        self.subscriber.status().await
    }

    pub async fn close(&self) -> Result<()> {
        self.subscriber.close().await
    }
}

pub struct RpcServerBuilder {
    broker: Arc<dyn Broker>,
    replies: Publisher,
    handlers: HandlerRegistryBuilder,
}

impl fmt::Debug for RpcServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServerBuilder")
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl RpcServerBuilder {
    pub fn on<M, H>(mut self, handler: H) -> Self
    where
        M: RpcMethod,
        H: RpcHandler<M>,
    {
        let responder = Responder::<M, H> {
            handler,
            replies: self.replies.clone(),
            _method: PhantomData,
        };
        self.handlers = self.handlers.on::<RpcRequestMessage<M>, _>(responder);
        self
    }

    /// Fails unless every method in the catalog has a handler.
    pub fn build(
        self,
        config: SubscriptionConfig,
        settings: SubscriberSettings,
    ) -> Result<RpcServer> {
        let handlers = self.handlers.build()?;
        Ok(RpcServer {
            subscriber: Subscriber::new(self.broker, config, handlers, settings),
        })
    }
}
