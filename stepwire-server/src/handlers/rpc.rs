//! Server side of the host-to-server RPC surface.
//!
//! Every method is idempotent on its run (and step key): hosts resend
//! requests after reconnecting and expect the same answer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use stepwire_core::HandlerError;
use stepwire_core::broker::{Broker, SubscriptionConfig};
use stepwire_core::coordination::{NewStep, StepCoordinator, WorkflowStore};
use stepwire_core::messaging::{MessageCatalog, SubscriberSettings};
use stepwire_core::rpc::{
    CompleteWorkflowRun, InitializeDelay, InitializeHost, RpcHandler, RpcServer,
    SendEvent, SendFetch, SendLog, SendRequest, SendWorkflowError,
    StartWorkflowRun,
};
use stepwire_model::rpc::{
    CompleteWorkflowRunRequest, HostInitResponse, InitializeDelayRequest,
    InitializeHostRequest, SendEventRequest, SendFetchRequest, SendLogRequest,
    SendRequestRequest, SendWorkflowErrorRequest, StartWorkflowRunRequest,
};
use stepwire_model::{RunId, StepKind};
use tracing::{info, warn};

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, HandlerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| HandlerError::permanent(format!("invalid timestamp {raw:?}: {err}")))
}

fn step_input<T: Serialize>(value: &T) -> Result<serde_json::Value, HandlerError> {
    serde_json::to_value(value)
        .map_err(|err| HandlerError::permanent(format!("failed to encode step input: {err}")))
}

/// Answers server RPC methods against the workflow store.
#[derive(Debug, Clone)]
pub struct ServerRpc {
    coordinator: StepCoordinator,
}

impl ServerRpc {
    pub fn new(coordinator: StepCoordinator) -> Self {
        Self { coordinator }
    }

    fn store(&self) -> &Arc<dyn WorkflowStore> {
        self.coordinator.store()
    }

    async fn record(
        &self,
        run_id: &RunId,
        key: &str,
        kind: StepKind,
        input: serde_json::Value,
        timestamp: &str,
        completed: bool,
    ) -> Result<bool, HandlerError> {
        let step = self
            .store()
            .record_step(NewStep {
                run_id: run_id.clone(),
                key: key.to_owned(),
                kind,
                input,
                started_at: parse_timestamp(timestamp)?,
                completed,
            })
            .await?;
        info!(
            run_id = %run_id,
            key,
            step_id = %step.id,
            kind = kind.as_str(),
            status = step.status.as_str(),
            "step recorded"
        );
        Ok(true)
    }
}

#[async_trait]
impl RpcHandler<InitializeDelay> for ServerRpc {
    async fn handle(&self, request: InitializeDelayRequest) -> Result<bool, HandlerError> {
        let requested_at = parse_timestamp(&request.timestamp)?;
        self.coordinator
            .schedule_delay(&request.run_id, &request.key, &request.wait, requested_at)
            .await?;
        Ok(true)
    }
}

// Connectors are out of scope; the step stays running until a connector
// reports back.
#[async_trait]
impl RpcHandler<SendRequest> for ServerRpc {
    async fn handle(&self, request: SendRequestRequest) -> Result<bool, HandlerError> {
        let input = step_input(&request.request)?;
        self.record(
            &request.run_id,
            &request.key,
            StepKind::IntegrationRequest,
            input,
            &request.timestamp,
            false,
        )
        .await
    }
}

#[async_trait]
impl RpcHandler<SendFetch> for ServerRpc {
    async fn handle(&self, request: SendFetchRequest) -> Result<bool, HandlerError> {
        let input = step_input(&request.fetch)?;
        self.record(
            &request.run_id,
            &request.key,
            StepKind::FetchRequest,
            input,
            &request.timestamp,
            false,
        )
        .await
    }
}

#[async_trait]
impl RpcHandler<SendLog> for ServerRpc {
    async fn handle(&self, request: SendLogRequest) -> Result<bool, HandlerError> {
        let input = step_input(&request.log)?;
        self.record(
            &request.run_id,
            &request.key,
            StepKind::LogMessage,
            input,
            &request.timestamp,
            true,
        )
        .await
    }
}

#[async_trait]
impl RpcHandler<SendEvent> for ServerRpc {
    async fn handle(&self, request: SendEventRequest) -> Result<bool, HandlerError> {
        let input = step_input(&request.event)?;
        self.record(
            &request.run_id,
            &request.key,
            StepKind::CustomEvent,
            input,
            &request.timestamp,
            true,
        )
        .await
    }
}

#[async_trait]
impl RpcHandler<InitializeHost> for ServerRpc {
    async fn handle(
        &self,
        request: InitializeHostRequest,
    ) -> Result<HostInitResponse, HandlerError> {
        let Some(environment) = self
            .store()
            .find_environment_by_api_key(&request.api_key)
            .await?
        else {
            warn!(workflow_id = %request.workflow_id, "host presented an unknown api key");
            return Ok(HostInitResponse::Error {
                message: "Invalid API key".to_owned(),
            });
        };

        info!(
            workflow_id = %request.workflow_id,
            workflow_name = %request.workflow_name,
            environment = %environment.slug,
            package = %request.package_name,
            version = %request.package_version,
            "host initialized"
        );
        Ok(HostInitResponse::Success)
    }
}

#[async_trait]
impl RpcHandler<StartWorkflowRun> for ServerRpc {
    async fn handle(&self, request: StartWorkflowRunRequest) -> Result<bool, HandlerError> {
        let at = parse_timestamp(&request.timestamp)?;
        self.store().start_run(&request.run_id, at).await?;
        info!(run_id = %request.run_id, "run started");
        Ok(true)
    }
}

#[async_trait]
impl RpcHandler<CompleteWorkflowRun> for ServerRpc {
    async fn handle(&self, request: CompleteWorkflowRunRequest) -> Result<bool, HandlerError> {
        let at = parse_timestamp(&request.timestamp)?;
        self.store()
            .complete_run(&request.run_id, request.output, at)
            .await?;
        info!(run_id = %request.run_id, "run completed");
        Ok(true)
    }
}

#[async_trait]
impl RpcHandler<SendWorkflowError> for ServerRpc {
    async fn handle(&self, request: SendWorkflowErrorRequest) -> Result<bool, HandlerError> {
        let at = parse_timestamp(&request.timestamp)?;
        self.store()
            .fail_run(&request.run_id, &request.error, at)
            .await?;
        warn!(
            run_id = %request.run_id,
            error_name = %request.error.name,
            error = %request.error.message,
            "run failed"
        );
        Ok(true)
    }
}

/// Builds the RPC server answering every server method with `handlers`.
pub fn server_rpc(
    broker: Arc<dyn Broker>,
    catalog: Arc<MessageCatalog>,
    handlers: ServerRpc,
    subscription: SubscriptionConfig,
    settings: SubscriberSettings,
) -> stepwire_core::Result<RpcServer> {
    RpcServer::builder(broker, catalog)?
        .on::<InitializeDelay, _>(handlers.clone())
        .on::<SendRequest, _>(handlers.clone())
        .on::<SendFetch, _>(handlers.clone())
        .on::<SendLog, _>(handlers.clone())
        .on::<SendEvent, _>(handlers.clone())
        .on::<InitializeHost, _>(handlers.clone())
        .on::<StartWorkflowRun, _>(handlers.clone())
        .on::<CompleteWorkflowRun, _>(handlers.clone())
        .on::<SendWorkflowError, _>(handlers)
        .build(subscription, settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_must_be_rfc3339() {
        let at = parse_timestamp("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(at.to_rfc3339(), "2024-05-01T10:00:00+00:00");

        let err = parse_timestamp("yesterday").unwrap_err();
        assert!(!err.retryable);
    }
}
