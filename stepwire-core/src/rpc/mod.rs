//! Request/response calls layered on publish and subscribe.
//!
//! A request is published to the server's request topic with a correlation
//! id and the caller's reply topic in its headers. The server answers with
//! an `RPC_RESPONSE` message on that reply topic; the client matches it to
//! the waiting call by correlation id.

pub mod client;
pub mod method;
pub mod methods;
pub mod server;

pub use client::{RpcClient, RpcClientConfig};
pub use method::{
    RPC_RESPONSE, RpcMethod, RpcOutcome, RpcReply, RpcReplyProperties,
    RpcRequestMessage, RpcRequestProperties, RpcResponseMessage,
};
pub use methods::{
    CompleteWorkflowRun, DEFAULT_SERVER_RPC_TOPIC, InitializeDelay, InitializeHost,
    SendEvent, SendFetch, SendLog, SendRequest, SendWorkflowError, StartWorkflowRun,
    server_rpc_catalog,
};
pub use server::{RpcHandler, RpcHandlerFn, RpcServer, RpcServerBuilder, rpc_handler_fn};
