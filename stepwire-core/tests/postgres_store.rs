#![cfg(feature = "e2e")]

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use stepwire_core::coordination::{DelayResolution, NewStep, WorkflowStore};
use stepwire_core::persistence::PgWorkflowStore;
use stepwire_core::{RecordKind, StoreError};
use stepwire_model::rpc::WorkflowError;
use stepwire_model::{
    ApiConnectionId, ExternalSourceId, RunId, RunStatus, StepKind, StepStatus, Wait,
};

async fn seed(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO environments (id, slug, api_key) \
         VALUES ('env_1', 'prod', 'key_live')",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "INSERT INTO workflow_runs (id, workflow_id, environment_id) \
         VALUES ('run_1', 'wf_1', 'env_1')",
    )
    .execute(pool)
    .await?;
    sqlx::query("INSERT INTO api_connections (id, service) VALUES ('conn_1', 'github')")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO external_sources (id, service) VALUES ('src_1', 'github')")
        .execute(pool)
        .await?;
    Ok(())
}

#[sqlx::test(migrator = "stepwire_core::MIGRATOR")]
async fn delay_steps_are_idempotent_and_resolve_once(pool: PgPool) -> Result<(), sqlx::Error> {
    seed(&pool).await?;
    let store = PgWorkflowStore::new(pool);
    let run = RunId::new("run_1");
    let requested_at = Utc::now();

    let first = store
        .record_delay_step(&run, "nap", &Wait::seconds(90), requested_at)
        .await
        .unwrap();
    let again = store
        .record_delay_step(&run, "nap", &Wait::seconds(90), requested_at)
        .await
        .unwrap();
    assert_eq!(first.delay.id, again.delay.id);
    assert_eq!(first.delay.wait_seconds, 90);
    assert_eq!(first.step.kind, StepKind::DurableDelay);
    assert_eq!(first.step.status, StepStatus::Running);
    assert_eq!(first.run.workflow_id.as_str(), "wf_1");

    let resolved_at = requested_at + Duration::seconds(90);
    let resolution = store.resolve_delay(&first.delay.id, resolved_at).await.unwrap();
    let DelayResolution::Resolved(record) = resolution else {
        panic!("first resolution should win");
    };
    assert_eq!(record.step.status, StepStatus::Success);
    assert!(record.delay.resolved_at.is_some());

    let replay = store
        .resolve_delay(&first.delay.id, resolved_at + Duration::minutes(1))
        .await
        .unwrap();
    assert!(matches!(replay, DelayResolution::AlreadyResolved(_)));
    assert_eq!(replay.record().delay.resolved_at, record.delay.resolved_at);
    Ok(())
}

#[sqlx::test(migrator = "stepwire_core::MIGRATOR")]
async fn step_for_unknown_run_is_not_found(pool: PgPool) -> Result<(), sqlx::Error> {
    seed(&pool).await?;
    let store = PgWorkflowStore::new(pool);

    let err = store
        .record_step(NewStep {
            run_id: RunId::new("run_missing"),
            key: "log-1".into(),
            kind: StepKind::LogMessage,
            input: json!({"message": "hi"}),
            started_at: Utc::now(),
            completed: true,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::NotFound { kind: RecordKind::Run, .. }));
    Ok(())
}

#[sqlx::test(migrator = "stepwire_core::MIGRATOR")]
async fn completed_steps_finish_on_insert(pool: PgPool) -> Result<(), sqlx::Error> {
    seed(&pool).await?;
    let store = PgWorkflowStore::new(pool);
    let started_at = Utc::now();

    let step = store
        .record_step(NewStep {
            run_id: RunId::new("run_1"),
            key: "event-1".into(),
            kind: StepKind::CustomEvent,
            input: json!({"name": "user.created"}),
            started_at,
            completed: true,
        })
        .await
        .unwrap();

    assert_eq!(step.status, StepStatus::Success);
    assert!(step.finished_at.is_some());

    // A delay on an existing non-delay key is a conflict.
    let err = store
        .record_delay_step(&RunId::new("run_1"), "event-1", &Wait::seconds(1), started_at)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
    Ok(())
}

#[sqlx::test(migrator = "stepwire_core::MIGRATOR")]
async fn run_lifecycle_updates_status(pool: PgPool) -> Result<(), sqlx::Error> {
    seed(&pool).await?;
    let store = PgWorkflowStore::new(pool.clone());
    let run = RunId::new("run_1");

    store.start_run(&run, Utc::now()).await.unwrap();
    store
        .fail_run(
            &run,
            &WorkflowError {
                name: "Error".into(),
                message: "boom".into(),
                stack_trace: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();

    let (status,): (String,) = sqlx::query_as("SELECT status FROM workflow_runs WHERE id = 'run_1'")
        .fetch_one(&pool)
        .await?;
    assert_eq!(status, RunStatus::Failure.as_str());

    let err = store
        .complete_run(&RunId::new("run_missing"), None, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    Ok(())
}

#[sqlx::test(migrator = "stepwire_core::MIGRATOR")]
async fn sources_connect_and_environments_resolve_by_key(
    pool: PgPool,
) -> Result<(), sqlx::Error> {
    seed(&pool).await?;
    let store = PgWorkflowStore::new(pool);

    let source = store
        .connect_external_source(&ExternalSourceId::new("src_1"), &ApiConnectionId::new("conn_1"))
        .await
        .unwrap();
    assert_eq!(source.connection_id, Some(ApiConnectionId::new("conn_1")));

    let missing = store
        .connect_external_source(&ExternalSourceId::new("src_1"), &ApiConnectionId::new("conn_x"))
        .await
        .unwrap_err();
    assert!(matches!(
        missing,
        StoreError::NotFound {
            kind: RecordKind::ApiConnection,
            ..
        }
    ));

    let environment = store.find_environment_by_api_key("key_live").await.unwrap();
    assert_eq!(environment.map(|env| env.slug), Some("prod".to_owned()));
    assert!(store.find_environment_by_api_key("nope").await.unwrap().is_none());
    Ok(())
}
