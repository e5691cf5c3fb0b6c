use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use stepwire_model::rpc::WorkflowError;
use stepwire_model::{
    ApiConnectionId, DelayId, DelayRecord, DurableDelay, Environment,
    ExternalSource, ExternalSourceId, RunId, RunStatus, StepId, StepKind,
    StepStatus, Wait, WorkflowRunRef, WorkflowStep,
};
use tokio::sync::RwLock;

use crate::coordination::store::{DelayResolution, NewStep, WorkflowStore};
use crate::error::{RecordKind, StoreError};

/// Run row as the in-memory store keeps it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    pub run: WorkflowRunRef,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<WorkflowError>,
}

#[derive(Default)]
struct State {
    runs: HashMap<RunId, StoredRun>,
    steps: HashMap<StepId, WorkflowStep>,
    step_keys: HashMap<(RunId, String), StepId>,
    delays: HashMap<DelayId, DurableDelay>,
    delay_by_step: HashMap<StepId, DelayId>,
    sources: HashMap<ExternalSourceId, ExternalSource>,
    connections: HashSet<ApiConnectionId>,
    environments: Vec<Environment>,
}

impl State {
    fn record(&self, delay: &DurableDelay) -> Result<DelayRecord, StoreError> {
        let step = self
            .steps
            .get(&delay.step_id)
            .ok_or_else(|| StoreError::not_found(RecordKind::Step, &delay.step_id))?;
        let run = self
            .runs
            .get(&step.run_id)
            .ok_or_else(|| StoreError::not_found(RecordKind::Run, &step.run_id))?;
        Ok(DelayRecord {
            delay: delay.clone(),
            step: step.clone(),
            run: run.run.clone(),
        })
    }

    fn run_mut(&mut self, run_id: &RunId) -> Result<&mut StoredRun, StoreError> {
        self.runs
            .get_mut(run_id)
            .ok_or_else(|| StoreError::not_found(RecordKind::Run, run_id))
    }

    fn existing_step(&self, run_id: &RunId, key: &str) -> Option<&WorkflowStep> {
        self.step_keys
            .get(&(run_id.clone(), key.to_owned()))
            .and_then(|id| self.steps.get(id))
    }

    fn insert_step(&mut self, step: WorkflowStep) {
        self.step_keys
            .insert((step.run_id.clone(), step.key.clone()), step.id.clone());
        self.steps.insert(step.id.clone(), step);
    }
}

/// [`WorkflowStore`] held in process memory. Used by tests and by the
/// server's `memory` broker mode.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    state: RwLock<State>,
    writes: AtomicUsize,
    reject_step_writes: AtomicBool,
}

impl fmt::Debug for InMemoryWorkflowStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryWorkflowStore")
            .field("writes", &self.writes())
            .finish_non_exhaustive()
    }
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    /// Makes every write that touches a step fail, to exercise rollback.
    pub fn reject_step_writes(&self, reject: bool) {
        self.reject_step_writes.store(reject, Ordering::Release);
    }

    fn committed(&self) {
        self.writes.fetch_add(1, Ordering::AcqRel);
    }

    fn check_step_writes(&self) -> Result<(), StoreError> {
        if self.reject_step_writes.load(Ordering::Acquire) {
            return Err(StoreError::Database("step writes are rejected".into()));
        }
        Ok(())
    }

    pub async fn insert_run(&self, run: WorkflowRunRef) {
        self.state.write().await.runs.insert(
            run.id.clone(),
            StoredRun {
                run,
                started_at: None,
                finished_at: None,
                output: None,
                error: None,
            },
        );
    }

    pub async fn insert_environment(&self, environment: Environment) {
        self.state.write().await.environments.push(environment);
    }

    pub async fn insert_external_source(&self, source: ExternalSource) {
        self.state
            .write()
            .await
            .sources
            .insert(source.id.clone(), source);
    }

    pub async fn insert_api_connection(&self, connection_id: ApiConnectionId) {
        self.state.write().await.connections.insert(connection_id);
    }

    /// Seeds a delay together with its step. The step's run must exist.
    pub async fn insert_delay(&self, delay: DurableDelay, step: WorkflowStep) {
        let mut state = self.state.write().await;
        state.delay_by_step.insert(step.id.clone(), delay.id.clone());
        state.delays.insert(delay.id.clone(), delay);
        state.insert_step(step);
    }

    pub async fn run(&self, run_id: &RunId) -> Option<StoredRun> {
        self.state.read().await.runs.get(run_id).cloned()
    }

    pub async fn step(&self, run_id: &RunId, key: &str) -> Option<WorkflowStep> {
        self.state.read().await.existing_step(run_id, key).cloned()
    }

    pub async fn external_source(&self, id: &ExternalSourceId) -> Option<ExternalSource> {
        self.state.read().await.sources.get(id).cloned()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn find_delay(&self, id: &DelayId) -> Result<Option<DelayRecord>, StoreError> {
        let state = self.state.read().await;
        state.delays.get(id).map(|delay| state.record(delay)).transpose()
    }

    async fn resolve_delay(
        &self,
        id: &DelayId,
        resolved_at: DateTime<Utc>,
    ) -> Result<DelayResolution, StoreError> {
        let mut state = self.state.write().await;
        let current = state
            .delays
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(RecordKind::Delay, id))?;
        let record = state.record(&current)?;
        if current.is_resolved() {
            return Ok(DelayResolution::AlreadyResolved(record));
        }
        // Both rows are staged before either is written.
        self.check_step_writes()?;

        let mut delay = record.delay;
        delay.resolved_at = Some(resolved_at);
        let mut step = record.step;
        step.status = StepStatus::Success;
        step.finished_at = Some(resolved_at);

        state.delays.insert(delay.id.clone(), delay.clone());
        state.steps.insert(step.id.clone(), step.clone());
        self.committed();
        Ok(DelayResolution::Resolved(DelayRecord {
            delay,
            step,
            run: record.run,
        }))
    }

    async fn connect_external_source(
        &self,
        source_id: &ExternalSourceId,
        connection_id: &ApiConnectionId,
    ) -> Result<ExternalSource, StoreError> {
        let mut state = self.state.write().await;
        if !state.connections.contains(connection_id) {
            return Err(StoreError::not_found(RecordKind::ApiConnection, connection_id));
        }
        let source = state
            .sources
            .get_mut(source_id)
            .ok_or_else(|| StoreError::not_found(RecordKind::ExternalSource, source_id))?;
        source.connection_id = Some(connection_id.clone());
        source.updated_at = Utc::now();
        let updated = source.clone();
        self.committed();
        Ok(updated)
    }

    async fn find_environment_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<Environment>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .environments
            .iter()
            .find(|env| env.api_key == api_key)
            .cloned())
    }

    async fn start_run(&self, run_id: &RunId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stored = state.run_mut(run_id)?;
        if stored.run.status == RunStatus::Pending {
            stored.run.status = RunStatus::Running;
            stored.started_at = Some(at);
        }
        self.committed();
        Ok(())
    }

    async fn complete_run(
        &self,
        run_id: &RunId,
        output: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stored = state.run_mut(run_id)?;
        stored.run.status = RunStatus::Success;
        stored.finished_at = Some(at);
        stored.output = output;
        self.committed();
        Ok(())
    }

    async fn fail_run(
        &self,
        run_id: &RunId,
        error: &WorkflowError,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let stored = state.run_mut(run_id)?;
        stored.run.status = RunStatus::Failure;
        stored.finished_at = Some(at);
        stored.error = Some(error.clone());
        self.committed();
        Ok(())
    }

    async fn record_delay_step(
        &self,
        run_id: &RunId,
        key: &str,
        wait: &Wait,
        requested_at: DateTime<Utc>,
    ) -> Result<DelayRecord, StoreError> {
        let mut state = self.state.write().await;
        if let Some(step) = state.existing_step(run_id, key) {
            let delay_id = state.delay_by_step.get(&step.id).ok_or_else(|| {
                StoreError::Conflict {
                    kind: RecordKind::Step,
                    id: step.id.to_string(),
                    reason: format!("step key {key} is not a delay"),
                }
            })?;
            let delay = state
                .delays
                .get(delay_id)
                .ok_or_else(|| StoreError::not_found(RecordKind::Delay, delay_id))?;
            return state.record(delay);
        }
        if !state.runs.contains_key(run_id) {
            return Err(StoreError::not_found(RecordKind::Run, run_id));
        }
        self.check_step_writes()?;

        let resolve_at = wait.resolve_at(requested_at);
        let step = WorkflowStep {
            id: StepId::generate(),
            run_id: run_id.clone(),
            key: key.to_owned(),
            kind: StepKind::DurableDelay,
            status: StepStatus::Running,
            input: Some(json!(wait)),
            started_at: requested_at,
            finished_at: None,
        };
        let delay = DurableDelay {
            id: DelayId::generate(),
            step_id: step.id.clone(),
            wait_seconds: (resolve_at - requested_at).num_seconds(),
            resolve_at,
            resolved_at: None,
            created_at: Utc::now(),
        };
        state.delay_by_step.insert(step.id.clone(), delay.id.clone());
        state.delays.insert(delay.id.clone(), delay.clone());
        state.insert_step(step);
        self.committed();
        state.record(&delay)
    }

    async fn record_step(&self, new: NewStep) -> Result<WorkflowStep, StoreError> {
        let mut state = self.state.write().await;
        if let Some(step) = state.existing_step(&new.run_id, &new.key) {
            return Ok(step.clone());
        }
        if !state.runs.contains_key(&new.run_id) {
            return Err(StoreError::not_found(RecordKind::Run, &new.run_id));
        }
        self.check_step_writes()?;

        let step = WorkflowStep {
            id: StepId::generate(),
            run_id: new.run_id,
            key: new.key,
            kind: new.kind,
            status: if new.completed {
                StepStatus::Success
            } else {
                StepStatus::Running
            },
            input: Some(new.input),
            started_at: new.started_at,
            finished_at: new.completed.then_some(new.started_at),
        };
        state.insert_step(step.clone());
        self.committed();
        Ok(step)
    }
}
