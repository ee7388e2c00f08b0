use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::engine::AgentEngine;
use crate::agent_engine::event_bus::AgentEvent;
use crate::agent_engine::state::TaskOutcome;

const DEFAULT_GRACE: Duration = Duration::from_secs(5);

type SharedOutcome = Shared<BoxFuture<'static, Option<TaskOutcome>>>;

struct RunningTask {
    cancel: CancellationToken,
    abort: AbortHandle,
    outcome: SharedOutcome,
}

/// Keeps at most one task alive. Starting a task interrupts the previous one
/// and waits for its cleanup before the new one begins.
pub struct TaskSupervisor {
    engine: Arc<AgentEngine>,
    grace: Duration,
    current: Mutex<Option<RunningTask>>,
}

impl TaskSupervisor {
    pub fn new(engine: Arc<AgentEngine>) -> Self {
        Self {
            engine,
            grace: DEFAULT_GRACE,
            current: Mutex::new(None),
        }
    }

    /// How long a cancelled task may take to clean up before it is aborted.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub async fn start(&self, task: impl Into<String>) {
        let task = task.into();
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            tracing::info!("interrupting running task");
            self.shut_down(previous).await;
        }

        let cancel = CancellationToken::new();
        let engine = Arc::clone(&self.engine);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { engine.run_task(&task, token).await });
        let abort = handle.abort_handle();
        let outcome = handle
            .map(|joined| match joined {
                Ok(outcome) => Some(outcome),
                Err(e) => {
                    tracing::error!(error = %e, "task join failed");
                    None
                }
            })
            .boxed()
            .shared();
        *current = Some(RunningTask { cancel, abort, outcome });
    }

    /// Cancels the running task and waits for it to wind down.
    pub async fn stop(&self) -> Option<TaskOutcome> {
        let running = self.current.lock().await.take()?;
        self.shut_down(running).await
    }

    /// Waits for the running task to end on its own. Dropping this future
    /// leaves the task running and still stoppable.
    pub async fn wait(&self) -> Option<TaskOutcome> {
        let outcome = self.current.lock().await.as_ref()?.outcome.clone();
        let result = outcome.await;
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|t| t.abort.is_finished()) {
            *current = None;
        }
        result
    }

    #[cfg(test)]
    pub async fn is_running(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.abort.is_finished())
    }

    async fn shut_down(&self, running: RunningTask) -> Option<TaskOutcome> {
        running.cancel.cancel();
        match tokio::time::timeout(self.grace, running.outcome.clone()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if let Some(outcome) = running.outcome.now_or_never() {
                    return outcome;
                }
                tracing::warn!(grace_ms = self.grace.as_millis() as u64, "task ignored cancellation, aborting");
                running.abort.abort();
                // The aborted task never reaches its own final event.
                let outcome = TaskOutcome::Cancelled;
                self.engine.events().emit(AgentEvent::TaskEnded {
                    outcome: outcome.clone(),
                    message: outcome.final_message(),
                });
                Some(outcome)
            }
        }
    }
}
