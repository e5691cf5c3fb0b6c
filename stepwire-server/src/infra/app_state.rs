use std::{fmt, sync::Arc};

use stepwire_core::coordination::StepCoordinator;
use stepwire_core::messaging::{Subscriber, SubscriberStatus};
use stepwire_core::rpc::RpcServer;

/// Long-running consumers owned by the server process.
#[derive(Debug)]
pub struct Workers {
    pub task_queue: Subscriber,
    pub rpc: RpcServer,
}

impl Workers {
    /// Starts both consumers. Returns the first one that failed to connect.
    pub async fn start(&self) -> Result<(), &'static str> {
        if !self.task_queue.initialize().await {
            return Err("task queue");
        }
        if !self.rpc.start().await {
            return Err("server rpc");
        }
        Ok(())
    }

    pub async fn statuses(&self) -> [(&'static str, SubscriberStatus); 2] {
        [
            ("task_queue", self.task_queue.status().await),
            ("server_rpc", self.rpc.status().await),
        ]
    }

    /// Closes both consumers, draining in-flight deliveries. Both are
    /// closed even when the first fails.
    pub async fn close(&self) -> stepwire_core::Result<()> {
        let tasks = self.task_queue.close().await;
        let rpc = self.rpc.close().await;
        tasks.and(rpc)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub coordinator: StepCoordinator,
    pub workers: Option<Arc<Workers>>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(coordinator: StepCoordinator) -> Self {
        Self {
            coordinator,
            workers: None,
        }
    }

    pub fn with_workers(mut self, workers: Arc<Workers>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn coordinator(&self) -> &StepCoordinator {
        &self.coordinator
    }
}
