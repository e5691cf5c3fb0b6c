use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messaging::MessageType;

/// Message type every RPC reply is published as.
pub const RPC_RESPONSE: &str = "RPC_RESPONSE";

/// A named request/response pair.
pub trait RpcMethod: Send + Sync + 'static {
    const NAME: &'static str;

    type Request: Serialize + DeserializeOwned + Send + Sync + 'static;

    type Response: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Stable identity of the request, folded into its correlation id so
    /// replies can be traced back to the step that asked.
    fn correlation_key(_request: &Self::Request) -> Option<String> {
        None
    }
}

/// Headers on every RPC request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequestProperties {
    #[serde(rename = "x-correlation-id")]
    pub correlation_id: String,
    #[serde(rename = "x-reply-topic")]
    pub reply_topic: String,
}

/// Headers on every RPC reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcReplyProperties {
    #[serde(rename = "x-correlation-id")]
    pub correlation_id: String,
}

/// Body of an RPC reply. `payload` is checked against the method's response
/// type by the caller, not by the reply subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReply {
    pub method: String,
    pub correlation_id: String,
    pub payload: Value,
}

/// Carries `M`'s requests as an ordinary message type.
#[derive(Debug)]
pub struct RpcRequestMessage<M>(PhantomData<fn() -> M>);

impl<M: RpcMethod> MessageType for RpcRequestMessage<M> {
    const TYPE: &'static str = M::NAME;
    type Data = M::Request;
    type Properties = RpcRequestProperties;
}

#[derive(Debug)]
pub struct RpcResponseMessage;

impl MessageType for RpcResponseMessage {
    const TYPE: &'static str = RPC_RESPONSE;
    type Data = RpcReply;
    type Properties = RpcReplyProperties;
}

/// Outcome of a call that did not fail outright.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome<T> {
    Response(T),
    /// No reply arrived in time. The server may still have acted.
    TimedOut,
}

impl<T> RpcOutcome<T> {
    pub fn into_response(self) -> Option<T> {
        match self {
            RpcOutcome::Response(response) => Some(response),
            RpcOutcome::TimedOut => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, RpcOutcome::TimedOut)
    }
}
