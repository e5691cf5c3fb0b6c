use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use stepwire_core::broker::{Broker, InMemoryBroker, SubscriptionConfig};
use stepwire_core::messaging::{
    Delivery, HandlerRegistry, MessageCatalog, Publisher, Subscriber,
    SubscriberSettings, handler_fn,
};
use stepwire_core::rpc::{
    RpcClient, RpcClientConfig, RpcMethod, RpcOutcome, RpcReply, RpcReplyProperties,
    RpcRequestMessage, RpcResponseMessage, RpcServer, rpc_handler_fn,
};
use stepwire_core::{HandlerError, MessagingError, RpcError};

const REQUESTS: &str = "calc-rpc";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Operands {
    a: i64,
    b: i64,
}

struct Add;

impl RpcMethod for Add {
    const NAME: &'static str = "ADD";
    type Request = Operands;
    type Response = i64;
}

struct Negate;

impl RpcMethod for Negate {
    const NAME: &'static str = "NEGATE";
    type Request = i64;
    type Response = i64;

    fn correlation_key(request: &i64) -> Option<String> {
        Some(format!("NEGATE:{request}"))
    }
}

fn catalog() -> Arc<MessageCatalog> {
    Arc::new(
        MessageCatalog::builder()
            .register::<RpcRequestMessage<Add>>()
            .register::<RpcRequestMessage<Negate>>()
            .build()
            .unwrap(),
    )
}

async fn start_server(broker: &InMemoryBroker) -> RpcServer {
    let server = RpcServer::builder(Arc::new(broker.clone()), catalog())
        .unwrap()
        .on::<Add, _>(rpc_handler_fn::<Add, _, _>(|req: Operands| async move {
            Ok(req.a + req.b)
        }))
        .on::<Negate, _>(rpc_handler_fn::<Negate, _, _>(|n: i64| async move {
            if n == i64::MIN {
                return Err(HandlerError::permanent("cannot negate i64::MIN"));
            }
            Ok(-n)
        }))
        .build(
            SubscriptionConfig::new(REQUESTS, "calc-server"),
            SubscriberSettings::default(),
        )
        .unwrap();
    assert!(server.start().await);
    server
}

fn client_config() -> RpcClientConfig {
    let mut config = RpcClientConfig::new(REQUESTS);
    config.call_timeout = Duration::from_secs(2);
    config
}

#[tokio::test]
async fn call_returns_the_handler_response() {
    let broker = InMemoryBroker::new().recording();
    let server = start_server(&broker).await;
    let config = client_config();
    let reply_topic = config.reply_topic.clone();
    let client = RpcClient::connect(Arc::new(broker.clone()), catalog(), config)
        .await
        .unwrap();

    let sum = client.call::<Add>(&Operands { a: 2, b: 3 }).await.unwrap();
    assert_eq!(sum, RpcOutcome::Response(5));

    let negated = client.call::<Negate>(&7).await.unwrap();
    assert_eq!(negated.into_response(), Some(-7));

    let replies = broker.published(&reply_topic);
    assert_eq!(replies.len(), 2);
    let first: RpcReply =
        serde_json::from_value(replies[0].envelope().unwrap().data).unwrap();
    assert_eq!(first.method, "ADD");
    assert!(first.correlation_id.starts_with("ADD#"));
    let second: RpcReply =
        serde_json::from_value(replies[1].envelope().unwrap().data).unwrap();
    assert!(second.correlation_id.starts_with("NEGATE:7#"));
    assert_eq!(replies[1].properties["x-correlation-id"], second.correlation_id);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn call_without_a_server_times_out() {
    let broker = InMemoryBroker::new().recording();
    let client = RpcClient::connect(Arc::new(broker.clone()), catalog(), client_config())
        .await
        .unwrap();

    let outcome = client
        .call_with_timeout::<Add>(&Operands { a: 1, b: 1 }, Duration::from_millis(50))
        .await
        .unwrap();

    assert!(outcome.is_timed_out());
    assert_eq!(broker.published(REQUESTS).len(), 1);
    client.close().await.unwrap();
}

#[tokio::test]
async fn failing_handler_sends_no_reply() {
    let broker = InMemoryBroker::new().recording();
    let server = start_server(&broker).await;
    let client = RpcClient::connect(Arc::new(broker.clone()), catalog(), client_config())
        .await
        .unwrap();

    let outcome = client
        .call_with_timeout::<Negate>(&i64::MIN, Duration::from_millis(200))
        .await
        .unwrap();

    assert_eq!(outcome, RpcOutcome::TimedOut);
    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn reply_that_does_not_match_the_response_type_is_rejected() {
    let broker = InMemoryBroker::new().recording();
    let shared: Arc<dyn Broker> = Arc::new(broker.clone());

    // A server answering ADD with a string payload.
    let reply_catalog = Arc::new(
        MessageCatalog::builder()
            .register::<RpcResponseMessage>()
            .build()
            .unwrap(),
    );
    let replies = Publisher::new(Arc::clone(&shared), reply_catalog, "");
    let rogue = HandlerRegistry::builder(catalog())
        .on::<RpcRequestMessage<Add>, _>(handler_fn(
            move |delivery: Delivery<RpcRequestMessage<Add>>| {
                let replies = replies.clone();
                async move {
                    let correlation_id = delivery.properties.correlation_id;
                    replies
                        .with_topic(delivery.properties.reply_topic.as_str())
                        .publish::<RpcResponseMessage>(
                            &RpcReply {
                                method: "ADD".into(),
                                correlation_id: correlation_id.clone(),
                                payload: json!("five"),
                            },
                            Some(&RpcReplyProperties { correlation_id }),
                        )
                        .await
                        .map_err(|err| HandlerError::retryable(err.to_string()))?;
                    Ok(true)
                }
            },
        ))
        .on::<RpcRequestMessage<Negate>, _>(handler_fn(
            |_: Delivery<RpcRequestMessage<Negate>>| async { Ok(true) },
        ))
        .build()
        .unwrap();
    let rogue = Subscriber::new(
        Arc::clone(&shared),
        SubscriptionConfig::new(REQUESTS, "rogue"),
        rogue,
        SubscriberSettings::default(),
    );
    assert!(rogue.initialize().await);

    let client = RpcClient::connect(shared, catalog(), client_config())
        .await
        .unwrap();
    let err = client
        .call::<Add>(&Operands { a: 2, b: 3 })
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::InvalidResponse { method, .. } if method == "ADD"));
    client.close().await.unwrap();
    rogue.close().await.unwrap();
}

#[tokio::test]
async fn server_needs_a_handler_for_every_method() {
    let broker = InMemoryBroker::new().recording();
    let err = RpcServer::builder(Arc::new(broker), catalog())
        .unwrap()
        .on::<Add, _>(rpc_handler_fn::<Add, _, _>(|req: Operands| async move {
            Ok(req.a + req.b)
        }))
        .build(
            SubscriptionConfig::new(REQUESTS, "calc-server"),
            SubscriberSettings::default(),
        )
        .unwrap_err();

    assert!(matches!(
        err,
        MessagingError::MissingHandler { message_type } if message_type == "NEGATE"
    ));
}
