//! Methods a workflow host invokes on the coordinating server.

use stepwire_model::rpc::{
    CompleteWorkflowRunRequest, HostInitResponse, InitializeDelayRequest,
    InitializeHostRequest, SendEventRequest, SendFetchRequest, SendLogRequest,
    SendRequestRequest, SendWorkflowErrorRequest, StartWorkflowRunRequest,
};

use crate::error::Result;
use crate::messaging::MessageCatalog;
use crate::rpc::method::{RpcMethod, RpcRequestMessage};

/// Topic hosts send server RPC requests to unless configured otherwise.
pub const DEFAULT_SERVER_RPC_TOPIC: &str = "workflows-server-rpc";

macro_rules! step_method {
    ($(#[$doc:meta])* $name:ident, $wire:literal, $request:ty) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl RpcMethod for $name {
            const NAME: &'static str = $wire;
            type Request = $request;
            type Response = bool;

            fn correlation_key(request: &Self::Request) -> Option<String> {
                Some(format!("{}:{}:{}", $wire, request.run_id, request.key))
            }
        }
    };
}

macro_rules! run_method {
    ($(#[$doc:meta])* $name:ident, $wire:literal, $request:ty) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name;

        impl RpcMethod for $name {
            const NAME: &'static str = $wire;
            type Request = $request;
            type Response = bool;

            fn correlation_key(request: &Self::Request) -> Option<String> {
                Some(format!("{}:{}", $wire, request.run_id))
            }
        }
    };
}

step_method!(
    /// Registers a durable delay step and schedules its resolution.
    InitializeDelay,
    "INITIALIZE_DELAY",
    InitializeDelayRequest
);
step_method!(SendRequest, "SEND_REQUEST", SendRequestRequest);
step_method!(SendFetch, "SEND_FETCH", SendFetchRequest);
step_method!(SendLog, "SEND_LOG", SendLogRequest);
step_method!(SendEvent, "SEND_EVENT", SendEventRequest);

run_method!(StartWorkflowRun, "START_WORKFLOW_RUN", StartWorkflowRunRequest);
run_method!(
    CompleteWorkflowRun,
    "COMPLETE_WORKFLOW_RUN",
    CompleteWorkflowRunRequest
);
run_method!(
    SendWorkflowError,
    "SEND_WORKFLOW_ERROR",
    SendWorkflowErrorRequest
);

/// Authenticates a host and registers its workflow.
#[derive(Debug)]
pub struct InitializeHost;

impl RpcMethod for InitializeHost {
    const NAME: &'static str = "INITIALIZE_HOST";
    type Request = InitializeHostRequest;
    type Response = HostInitResponse;

    fn correlation_key(request: &Self::Request) -> Option<String> {
        Some(format!("INITIALIZE_HOST:{}", request.workflow_id))
    }
}

/// Request catalog for every server RPC method.
pub fn server_rpc_catalog() -> Result<MessageCatalog> {
    MessageCatalog::builder()
        .register::<RpcRequestMessage<InitializeDelay>>()
        .register::<RpcRequestMessage<SendRequest>>()
        .register::<RpcRequestMessage<SendFetch>>()
        .register::<RpcRequestMessage<SendLog>>()
        .register::<RpcRequestMessage<SendEvent>>()
        .register::<RpcRequestMessage<InitializeHost>>()
        .register::<RpcRequestMessage<StartWorkflowRun>>()
        .register::<RpcRequestMessage<CompleteWorkflowRun>>()
        .register::<RpcRequestMessage<SendWorkflowError>>()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwire_model::{RunId, Wait};

    #[test]
    fn step_methods_correlate_by_run_and_key() {
        let request = InitializeDelayRequest {
            run_id: RunId::new("run_1"),
            key: "wait-a-bit".into(),
            wait: Wait::seconds(5),
            timestamp: "2024-01-01T00:00:00Z".into(),
        };
        assert_eq!(
            InitializeDelay::correlation_key(&request).as_deref(),
            Some("INITIALIZE_DELAY:run_1:wait-a-bit")
        );
    }

    #[test]
    fn catalog_lists_all_methods() {
        let catalog = server_rpc_catalog().unwrap();
        assert_eq!(catalog.len(), 9);
        assert!(catalog.contains("INITIALIZE_HOST"));
        assert!(catalog.contains("SEND_WORKFLOW_ERROR"));
    }
}
