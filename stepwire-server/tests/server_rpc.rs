use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use stepwire_core::broker::{Broker, InMemoryBroker};
use stepwire_core::coordination::InMemoryWorkflowStore;
use stepwire_core::messaging::MessageType;
use stepwire_core::rpc::{
    CompleteWorkflowRun, InitializeDelay, InitializeHost, RpcClient, RpcClientConfig,
    RpcOutcome, SendLog, SendRequest, SendWorkflowError, StartWorkflowRun,
    server_rpc_catalog,
};
use stepwire_core::task_queue::{DEFAULT_TASK_TOPIC, DelayResolvedTask};
use stepwire_model::rpc::{
    CompleteWorkflowRunRequest, HostInitResponse, InitializeDelayRequest,
    InitializeHostRequest, IntegrationRequest, LogEntry, LogLevel, SendLogRequest,
    SendRequestRequest, SendWorkflowErrorRequest, StartWorkflowRunRequest,
    TriggerMetadata, WorkflowError,
};
use stepwire_model::{
    Environment, EnvironmentId, RunId, RunStatus, StepKind, StepStatus, Wait,
    WorkflowId, WorkflowRunRef,
};
use stepwire_server::infra::config::loader::compose;
use stepwire_server::infra::config::sources::{EnvConfig, FileConfig};
use stepwire_server::infra::startup::{BrokerHandle, Runtime, build_runtime};

struct Harness {
    store: Arc<InMemoryWorkflowStore>,
    broker: InMemoryBroker,
    runtime: Runtime,
    client: RpcClient,
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

async fn harness() -> Harness {
    let config = compose(
        FileConfig::default(),
        EnvConfig {
            broker_kind: Some("memory".into()),
            ..EnvConfig::default()
        },
    )
    .unwrap()
    .config;

    let store = Arc::new(InMemoryWorkflowStore::new());
    store
        .insert_run(WorkflowRunRef {
            id: RunId::new("run_1"),
            workflow_id: WorkflowId::new("wf_1"),
            environment_id: EnvironmentId::new("env_1"),
            status: RunStatus::Pending,
        })
        .await;
    store
        .insert_environment(Environment {
            id: EnvironmentId::new("env_1"),
            slug: "prod".into(),
            api_key: "key_live".into(),
        })
        .await;

    let broker = InMemoryBroker::new().recording();
    let runtime = build_runtime(&config, BrokerHandle::Memory(broker.clone()), store.clone())
        .unwrap();
    runtime.workers.start().await.unwrap();

    let mut client_config = RpcClientConfig::new(config.broker.rpc_request_topic.clone());
    client_config.call_timeout = Duration::from_secs(2);
    let transport: Arc<dyn Broker> = Arc::new(broker.clone());
    let client = RpcClient::connect(
        transport,
        Arc::new(server_rpc_catalog().unwrap()),
        client_config,
    )
    .await
    .unwrap();

    Harness {
        store,
        broker,
        runtime,
        client,
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn host_request(api_key: &str) -> InitializeHostRequest {
    InitializeHostRequest {
        api_key: api_key.into(),
        workflow_id: WorkflowId::new("wf_1"),
        workflow_name: "welcome".into(),
        trigger: TriggerMetadata::CustomEvent {
            service: "trigger".into(),
            name: "user.created".into(),
            filter: None,
        },
        package_version: "0.1.0".into(),
        package_name: "@acme/host".into(),
        trigger_ttl: None,
    }
}

#[tokio::test]
async fn host_initialization_checks_the_api_key() {
    let h = harness().await;

    let ok = h
        .client
        .call::<InitializeHost>(&host_request("key_live"))
        .await
        .unwrap();
    assert_eq!(ok, RpcOutcome::Response(HostInitResponse::Success));

    let rejected = h
        .client
        .call::<InitializeHost>(&host_request("key_wrong"))
        .await
        .unwrap();
    assert_eq!(
        rejected,
        RpcOutcome::Response(HostInitResponse::Error {
            message: "Invalid API key".into()
        })
    );
}

#[tokio::test]
async fn run_lifecycle_follows_host_reports() {
    let h = harness().await;
    let run_id = RunId::new("run_1");

    let started = h
        .client
        .call::<StartWorkflowRun>(&StartWorkflowRunRequest {
            run_id: run_id.clone(),
            timestamp: now(),
        })
        .await
        .unwrap();
    assert_eq!(started, RpcOutcome::Response(true));
    let stored = h.store.run(&run_id).await.unwrap();
    assert_eq!(stored.run.status, RunStatus::Running);
    assert!(stored.started_at.is_some());

    h.client
        .call::<SendWorkflowError>(&SendWorkflowErrorRequest {
            run_id: run_id.clone(),
            error: WorkflowError {
                name: "TypeError".into(),
                message: "boom".into(),
                stack_trace: None,
            },
            timestamp: now(),
        })
        .await
        .unwrap();
    let stored = h.store.run(&run_id).await.unwrap();
    assert_eq!(stored.run.status, RunStatus::Failure);
    assert_eq!(stored.error.map(|e| e.message), Some("boom".to_owned()));
}

#[tokio::test]
async fn steps_are_recorded_once_per_key() {
    let h = harness().await;
    let log = SendLogRequest {
        run_id: RunId::new("run_1"),
        key: "log-1".into(),
        log: LogEntry {
            message: "hello".into(),
            level: LogLevel::Info,
            properties: None,
        },
        timestamp: now(),
    };

    assert_eq!(
        h.client.call::<SendLog>(&log).await.unwrap(),
        RpcOutcome::Response(true)
    );
    assert_eq!(
        h.client.call::<SendLog>(&log).await.unwrap(),
        RpcOutcome::Response(true)
    );
    let step = h.store.step(&RunId::new("run_1"), "log-1").await.unwrap();
    assert_eq!(step.kind, StepKind::LogMessage);
    assert_eq!(step.status, StepStatus::Success);

    h.client
        .call::<SendRequest>(&SendRequestRequest {
            run_id: RunId::new("run_1"),
            key: "issue".into(),
            request: IntegrationRequest {
                service: "github".into(),
                endpoint: "issues.create".into(),
                params: json!({"title": "hi"}),
            },
            timestamp: now(),
        })
        .await
        .unwrap();
    let step = h.store.step(&RunId::new("run_1"), "issue").await.unwrap();
    assert_eq!(step.kind, StepKind::IntegrationRequest);
    assert_eq!(step.status, StepStatus::Running);
}

#[tokio::test]
async fn elapsed_delay_is_resolved_by_the_task_queue() {
    let h = harness().await;

    let accepted = h
        .client
        .call::<InitializeDelay>(&InitializeDelayRequest {
            run_id: RunId::new("run_1"),
            key: "nap".into(),
            wait: Wait::seconds(0),
            timestamp: now(),
        })
        .await
        .unwrap();
    assert_eq!(accepted, RpcOutcome::Response(true));

    let store = h.store.clone();
    eventually(move || {
        let store = store.clone();
        async move {
            store
                .step(&RunId::new("run_1"), "nap")
                .await
                .is_some_and(|step| step.status == StepStatus::Success)
        }
    })
    .await;

    let broker = h.broker.clone();
    eventually(move || {
        let broker = broker.clone();
        async move {
            broker
                .published(DEFAULT_TASK_TOPIC)
                .iter()
                .any(|m| {
                    m.envelope()
                        .is_ok_and(|e| e.message_type == DelayResolvedTask::TYPE)
                })
        }
    })
    .await;
}

#[tokio::test]
async fn bad_timestamp_gets_no_reply() {
    let h = harness().await;

    let outcome = h
        .client
        .call_with_timeout::<CompleteWorkflowRun>(
            &CompleteWorkflowRunRequest {
                run_id: RunId::new("run_1"),
                output: None,
                timestamp: "not a time".into(),
            },
            Duration::from_millis(300),
        )
        .await
        .unwrap();

    assert!(outcome.is_timed_out());
    assert_eq!(h.store.run(&RunId::new("run_1")).await.unwrap().run.status, RunStatus::Pending);
    h.runtime.workers.close().await.unwrap();
}
