//! Consumers of the coordinating server's own task queue.

use std::sync::Arc;

use async_trait::async_trait;
use stepwire_core::{CoordinatorError, HandlerError};
use stepwire_core::coordination::StepCoordinator;
use stepwire_core::messaging::{
    Delivery, HandlerRegistry, MessageCatalog, MessageHandler, handler_fn,
};
use stepwire_core::task_queue::{
    DelayResolvedTask, ExternalSourceUpsertedTask, ResolveDelayTask,
};
use tracing::{debug, info};

/// Resolves a delay once its scheduled `RESOLVE_DELAY` comes due.
#[derive(Debug, Clone)]
pub struct ResolveDelayHandler {
    coordinator: StepCoordinator,
}

impl ResolveDelayHandler {
    pub fn new(coordinator: StepCoordinator) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl MessageHandler<ResolveDelayTask> for ResolveDelayHandler {
    async fn handle(
        &self,
        delivery: Delivery<ResolveDelayTask>,
    ) -> Result<bool, HandlerError> {
        debug!(
            delay_id = %delivery.data.id,
            redelivery_count = delivery.attributes.redelivery_count,
            "resolving due delay"
        );
        match self.coordinator.resolve_delay(&delivery.data.id).await {
            Ok(_) => Ok(true),
            // A redelivery finds the delay resolved and publishes nothing,
            // so the missing DELAY_RESOLVED goes to the dead-letter topic.
            Err(err @ CoordinatorError::Notify { .. }) => {
                Err(HandlerError::permanent(err.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Binds every task-queue message type to its handler.
pub fn task_handlers(
    catalog: Arc<MessageCatalog>,
    coordinator: StepCoordinator,
) -> stepwire_core::Result<HandlerRegistry> {
    HandlerRegistry::builder(catalog)
        .on::<ResolveDelayTask, _>(ResolveDelayHandler::new(coordinator))
        .on::<ExternalSourceUpsertedTask, _>(handler_fn(
            |delivery: Delivery<ExternalSourceUpsertedTask>| async move {
                info!(
                    source_id = %delivery.data.id,
                    environment_id = ?delivery.properties.environment_id,
                    "external source upserted"
                );
                Ok::<_, HandlerError>(true)
            },
        ))
        .on::<DelayResolvedTask, _>(handler_fn(
            |delivery: Delivery<DelayResolvedTask>| async move {
                info!(
                    delay_id = %delivery.data.id,
                    step_id = %delivery.data.step_id,
                    run_id = %delivery.data.run_id,
                    workflow_id = ?delivery.properties.workflow_id,
                    "delay resolution announced"
                );
                Ok::<_, HandlerError>(true)
            },
        ))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stepwire_core::broker::{InMemoryBroker, RawMessage};
    use stepwire_core::coordination::{InMemoryWorkflowStore, WorkflowStore};
    use stepwire_core::messaging::{DeliveryAttributes, Publisher, RawProperties};
    use stepwire_core::task_queue::DEFAULT_TASK_TOPIC;
    use stepwire_model::{
        EnvironmentId, ResolveDelay, RunId, RunStatus, TaskProperties, Wait, WorkflowId,
        WorkflowRunRef,
    };

    fn delivery(data: ResolveDelay) -> Delivery<ResolveDelayTask> {
        let raw = RawMessage {
            message_id: "tasks:1".into(),
            topic: DEFAULT_TASK_TOPIC.into(),
            payload: Vec::new(),
            properties: RawProperties::default(),
            publish_time_ms: Utc::now().timestamp_millis(),
            event_time_ms: 0,
            redelivery_count: 0,
        };
        Delivery {
            id: "envelope_1".into(),
            data,
            properties: TaskProperties::default(),
            attributes: DeliveryAttributes::from_raw(&raw),
        }
    }

    #[tokio::test]
    async fn unannounced_resolution_is_not_retried() {
        let store = Arc::new(InMemoryWorkflowStore::new());
        store
            .insert_run(WorkflowRunRef {
                id: RunId::new("run_1"),
                workflow_id: WorkflowId::new("wf_1"),
                environment_id: EnvironmentId::new("env_1"),
                status: RunStatus::Running,
            })
            .await;
        // Knows RESOLVE_DELAY but not DELAY_RESOLVED.
        let catalog = MessageCatalog::builder()
            .register::<ResolveDelayTask>()
            .build()
            .unwrap();
        let tasks = Publisher::new(
            Arc::new(InMemoryBroker::new()),
            Arc::new(catalog),
            DEFAULT_TASK_TOPIC,
        );
        let coordinator = StepCoordinator::new(store.clone(), tasks);
        let scheduled = coordinator
            .schedule_delay(&RunId::new("run_1"), "nap", &Wait::seconds(3600), Utc::now())
            .await
            .unwrap();

        let err = ResolveDelayHandler::new(coordinator)
            .handle(delivery(ResolveDelay {
                id: scheduled.delay.id.clone(),
            }))
            .await
            .unwrap_err();

        assert!(!err.retryable);
        assert!(err.message.contains("DELAY_RESOLVED"));
        let stored = store.find_delay(&scheduled.delay.id).await.unwrap().unwrap();
        assert!(stored.delay.is_resolved());
    }
}
