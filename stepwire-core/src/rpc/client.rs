use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{Broker, SubscriptionConfig};
use crate::error::{MessagingError, RpcError};
use crate::messaging::{
    Delivery, HandlerRegistry, MessageCatalog, Publisher, Subscriber,
    SubscriberSettings, handler_fn,
};
use crate::rpc::method::{
    RpcMethod, RpcOutcome, RpcReply, RpcRequestMessage, RpcRequestProperties,
    RpcResponseMessage,
};

type Pending = Arc<DashMap<String, oneshot::Sender<RpcReply>>>;

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub request_topic: String,
    /// Topic this client listens on; should be unique per client instance.
    pub reply_topic: String,
    pub reply_subscription: String,
    pub call_timeout: Duration,
}

impl RpcClientConfig {
    pub fn new(request_topic: impl Into<String>) -> Self {
        let instance = Uuid::now_v7();
        Self {
            request_topic: request_topic.into(),
            reply_topic: format!("rpc-replies-{instance}"),
            reply_subscription: format!("rpc-client-{instance}"),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Calls methods whose requests are in `catalog` and waits for the
/// correlated reply.
pub struct RpcClient {
    requests: Publisher,
    replies: Subscriber,
    pending: Pending,
    reply_topic: String,
    call_timeout: Duration,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("request_topic", &self.requests.topic())
            .field("reply_topic", &self.reply_topic)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl RpcClient {
    /// Builds the client and starts listening for replies.
    pub async fn connect(
        broker: Arc<dyn Broker>,
        catalog: Arc<MessageCatalog>,
        config: RpcClientConfig,
    ) -> Result<Self, RpcError> {
        let pending: Pending = Arc::new(DashMap::new());
        let reply_catalog = Arc::new(
            MessageCatalog::builder()
                .register::<RpcResponseMessage>()
                .build()?,
        );

        let routes = Arc::clone(&pending);
        let handlers = HandlerRegistry::builder(reply_catalog)
            .on::<RpcResponseMessage, _>(handler_fn(
                move |delivery: Delivery<RpcResponseMessage>| {
                    let routes = Arc::clone(&routes);
                    async move {
                        let reply = delivery.data;
                        match routes.remove(&reply.correlation_id) {
                            Some((_, waiter)) => {
                                // The caller may have given up already.
                                let _ = waiter.send(reply);
                            }
                            None => debug!(
                                correlation_id = %reply.correlation_id,
                                method = %reply.method,
                                "dropping reply with no waiting caller"
                            ),
                        }
                        Ok(true)
                    }
                },
            ))
            .build()?;

        let replies = Subscriber::new(
            Arc::clone(&broker),
            SubscriptionConfig::new(&config.reply_topic, &config.reply_subscription),
            handlers,
            SubscriberSettings {
                handler_timeout: None,
                ..SubscriberSettings::default()
            },
        );
        if !replies.initialize().await {
            return Err(RpcError::Messaging(MessagingError::NotReady(format!(
                "reply subscription on {} failed to connect",
                config.reply_topic
            ))));
        }

        Ok(Self {
            requests: Publisher::new(broker, catalog, config.request_topic),
            replies,
            pending,
            reply_topic: config.reply_topic,
            call_timeout: config.call_timeout,
        })
    }

    pub async fn call<M: RpcMethod>(
        &self,
        request: &M::Request,
    ) -> Result<RpcOutcome<M::Response>, RpcError> {
        self.call_with_timeout::<M>(request, self.call_timeout).await
    }

    pub async fn call_with_timeout<M: RpcMethod>(
        &self,
        request: &M::Request,
        timeout: Duration,
    ) -> Result<RpcOutcome<M::Response>, RpcError> {
        let base = M::correlation_key(request).unwrap_or_else(|| M::NAME.to_owned());
        let correlation_id = format!("{base}#{}", Uuid::now_v7());

        let (waiter, reply) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), waiter);

        let properties = RpcRequestProperties {
            correlation_id: correlation_id.clone(),
            reply_topic: self.reply_topic.clone(),
        };
        if let Err(err) = self
            .requests
            .publish::<RpcRequestMessage<M>>(request, Some(&properties))
            .await
        {
            self.pending.remove(&correlation_id);
            return Err(err.into());
        }

        let reply = match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(RpcError::Closed),
            Err(_) => {
                self.pending.remove(&correlation_id);
                warn!(
                    method = M::NAME,
                    %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "RPC call timed out"
                );
                return Ok(RpcOutcome::TimedOut);
            }
        };

        if reply.method != M::NAME {
            return Err(RpcError::InvalidResponse {
                method: M::NAME.to_owned(),
                reason: format!("reply is for method {}", reply.method),
            });
        }
        serde_json::from_value::<M::Response>(reply.payload)
            .map(RpcOutcome::Response)
            .map_err(|err| RpcError::InvalidResponse {
                method: M::NAME.to_owned(),
                reason: err.to_string(),
            })
    }

    /// Stops listening for replies. Calls still waiting fail with
    /// [`RpcError::Closed`].
    pub async fn close(&self) -> Result<(), RpcError> {
        self.replies.close().await?;
        self.pending.clear();
        Ok(())
    }
}
