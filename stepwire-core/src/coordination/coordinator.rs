use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use stepwire_model::{
    ApiConnectionId, DelayId, DelayRecord, DelayResolved, ExternalSource,
    ExternalSourceId, ExternalSourceUpserted, ResolveDelay, RunId, TaskProperties,
    Wait,
};
use tracing::{error, info, warn};

use crate::broker::PublishOptions;
use crate::coordination::store::{DelayResolution, WorkflowStore};
use crate::error::{CoordinatorError, RecordKind};
use crate::messaging::{MessageType, Publisher};
use crate::task_queue::{DelayResolvedTask, ExternalSourceUpsertedTask, ResolveDelayTask};

fn task_properties(record: &DelayRecord) -> TaskProperties {
    TaskProperties {
        environment_id: Some(record.run.environment_id.to_string()),
        workflow_id: Some(record.run.workflow_id.to_string()),
    }
}

/// Persists step resolutions and announces them on the task queue.
///
/// Every operation commits before it publishes. A publish that fails after
/// the commit surfaces as [`CoordinatorError::Notify`] with the state
/// already durable.
#[derive(Clone)]
pub struct StepCoordinator {
    store: Arc<dyn WorkflowStore>,
    tasks: Publisher,
}

impl fmt::Debug for StepCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepCoordinator")
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

impl StepCoordinator {
    /// `tasks` must publish the task-queue catalog.
    pub fn new(store: Arc<dyn WorkflowStore>, tasks: Publisher) -> Self {
        Self { store, tasks }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub async fn resolve_delay(&self, id: &DelayId) -> Result<DelayRecord, CoordinatorError> {
        let existing = self
            .store
            .find_delay(id)
            .await
            .map_err(|err| CoordinatorError::from_store(RecordKind::Delay, id, err))?
            .ok_or_else(|| CoordinatorError::NotFound {
                kind: RecordKind::Delay,
                id: id.to_string(),
            })?;
        if existing.delay.is_resolved() {
            info!(delay_id = %id, "delay already resolved");
            return Ok(existing);
        }

        let record = match self
            .store
            .resolve_delay(id, Utc::now())
            .await
            .map_err(|err| CoordinatorError::from_store(RecordKind::Delay, id, err))?
        {
            DelayResolution::Resolved(record) => record,
            DelayResolution::AlreadyResolved(record) => {
                info!(delay_id = %id, "delay resolved concurrently");
                return Ok(record);
            }
        };

        let resolved_at = record.delay.resolved_at.unwrap_or_else(Utc::now);
        let event = DelayResolved {
            id: record.delay.id.clone(),
            step_id: record.step.id.clone(),
            run_id: record.run.id.clone(),
            resolved_at,
        };
        self.tasks
            .publish::<DelayResolvedTask>(&event, Some(&task_properties(&record)))
            .await
            .map_err(|source| {
                error!(delay_id = %id, error = %source, "delay resolved but notification failed");
                CoordinatorError::Notify {
                    kind: RecordKind::Delay,
                    id: id.to_string(),
                    message_type: DelayResolvedTask::TYPE,
                    source,
                }
            })?;

        info!(
            delay_id = %id,
            step_id = %record.step.id,
            run_id = %record.run.id,
            "delay resolved"
        );
        Ok(record)
    }

    pub async fn connect_external_source(
        &self,
        source_id: &ExternalSourceId,
        connection_id: &ApiConnectionId,
    ) -> Result<ExternalSource, CoordinatorError> {
        let source = self
            .store
            .connect_external_source(source_id, connection_id)
            .await
            .map_err(|err| {
                CoordinatorError::from_store(RecordKind::ExternalSource, source_id, err)
            })?;

        self.tasks
            .publish::<ExternalSourceUpsertedTask>(
                &ExternalSourceUpserted {
                    id: source.id.clone(),
                },
                Some(&TaskProperties::default()),
            )
            .await
            .map_err(|source_err| {
                error!(
                    source_id = %source_id,
                    error = %source_err,
                    "external source connected but notification failed"
                );
                CoordinatorError::Notify {
                    kind: RecordKind::ExternalSource,
                    id: source_id.to_string(),
                    message_type: ExternalSourceUpsertedTask::TYPE,
                    source: source_err,
                }
            })?;

        info!(
            source_id = %source_id,
            connection_id = %connection_id,
            "external source connected"
        );
        Ok(source)
    }

    /// Records a delay step and queues its resolution for when the wait
    /// elapses. Re-sending the same run/key returns the existing delay.
    pub async fn schedule_delay(
        &self,
        run_id: &RunId,
        key: &str,
        wait: &Wait,
        requested_at: DateTime<Utc>,
    ) -> Result<DelayRecord, CoordinatorError> {
        let record = self
            .store
            .record_delay_step(run_id, key, wait, requested_at)
            .await
            .map_err(|err| CoordinatorError::from_store(RecordKind::Step, run_id, err))?;
        if record.delay.is_resolved() {
            warn!(
                run_id = %run_id,
                key,
                delay_id = %record.delay.id,
                "delay step already resolved, not rescheduling"
            );
            return Ok(record);
        }

        self.tasks
            .publish_with::<ResolveDelayTask>(
                &ResolveDelay {
                    id: record.delay.id.clone(),
                },
                Some(&task_properties(&record)),
                PublishOptions::deliver_at(record.delay.resolve_at),
            )
            .await
            .map_err(|source| CoordinatorError::Notify {
                kind: RecordKind::Delay,
                id: record.delay.id.to_string(),
                message_type: ResolveDelayTask::TYPE,
                source,
            })?;

        info!(
            run_id = %run_id,
            key,
            delay_id = %record.delay.id,
            resolve_at = %record.delay.resolve_at,
            "delay scheduled"
        );
        Ok(record)
    }
}
