//! Message types carried on the coordinating server's task queue.

use stepwire_model::{DelayResolved, ExternalSourceUpserted, ResolveDelay, TaskProperties};

use crate::error::Result;
use crate::messaging::{MessageCatalog, MessageType};

/// Topic the task-queue catalog is published on unless configured otherwise.
pub const DEFAULT_TASK_TOPIC: &str = "workflows-task-queue";

#[derive(Debug)]
pub struct ExternalSourceUpsertedTask;

impl MessageType for ExternalSourceUpsertedTask {
    const TYPE: &'static str = "EXTERNAL_SOURCE_UPSERTED";
    type Data = ExternalSourceUpserted;
    type Properties = TaskProperties;
}

#[derive(Debug)]
pub struct ResolveDelayTask;

impl MessageType for ResolveDelayTask {
    const TYPE: &'static str = "RESOLVE_DELAY";
    type Data = ResolveDelay;
    type Properties = TaskProperties;
}

#[derive(Debug)]
pub struct DelayResolvedTask;

impl MessageType for DelayResolvedTask {
    const TYPE: &'static str = "DELAY_RESOLVED";
    type Data = DelayResolved;
    type Properties = TaskProperties;
}

pub fn task_catalog() -> Result<MessageCatalog> {
    MessageCatalog::builder()
        .register::<ExternalSourceUpsertedTask>()
        .register::<ResolveDelayTask>()
        .register::<DelayResolvedTask>()
        .build()
}
