use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, mpsc, Mutex};

use crate::agent_engine::state::{Command, FinalMessage, TaskOutcome};
use crate::errors::FailureKind;
use crate::executor::safety::HumanGate;

/// Everything a host UI may show about a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    TaskStarted { session_id: String, task: String },
    StepStarted { step: u32 },
    Rationale { step: u32, text: String },
    CommandParsed { step: u32, command: Command },
    ActionFailed { step: u32, message: String },
    ServiceError { kind: FailureKind, message: String },
    ConfirmationRequested { request_id: u64, message: String },
    TakeOverRequested { request_id: u64, message: String },
    InteractRequested { request_id: u64, message: String },
    TaskEnded { outcome: TaskOutcome, message: FinalMessage },
}

/// Replies from the human side of the loop, each naming the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum UserSignal {
    Confirm { request_id: u64, approved: bool },
    TakeOverDone { request_id: u64 },
    Choice { request_id: u64, reply: Option<String> },
}

impl UserSignal {
    pub fn request_id(&self) -> u64 {
        match self {
            UserSignal::Confirm { request_id, .. }
            | UserSignal::TakeOverDone { request_id }
            | UserSignal::Choice { request_id, .. } => *request_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Broadcasts to current subscribers; having none is not an error.
    pub fn emit(&self, event: AgentEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("agent event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// [`HumanGate`] that publishes requests on the event bus and waits for a
/// matching [`UserSignal`] on an mpsc channel.
pub struct ChannelGate {
    events: EventBus,
    replies: Mutex<mpsc::Receiver<UserSignal>>,
    next_request: AtomicU64,
}

impl ChannelGate {
    pub fn new(events: EventBus) -> (Self, mpsc::Sender<UserSignal>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                events,
                replies: Mutex::new(rx),
                next_request: AtomicU64::new(1),
            },
            tx,
        )
    }

    /// Emits the request built by `request` under a fresh id and returns the
    /// first signal answering that id which `pick` accepts. Answers to earlier,
    /// abandoned requests are discarded whenever they arrive.
    async fn ask<T>(
        &self,
        request: impl FnOnce(u64) -> AgentEvent,
        pick: impl Fn(UserSignal) -> Option<T>,
    ) -> Option<T> {
        let mut rx = self.replies.lock().await;
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        self.events.emit(request(id));
        while let Some(signal) = rx.recv().await {
            if signal.request_id() != id {
                tracing::debug!(?signal, request_id = id, "discarding stale user signal");
                continue;
            }
            match pick(signal) {
                Some(v) => return Some(v),
                None => tracing::debug!(request_id = id, "ignoring user signal of the wrong kind"),
            }
        }
        None
    }
}

#[async_trait]
impl HumanGate for ChannelGate {
    async fn confirm(&self, message: &str) -> bool {
        let message = message.to_string();
        self.ask(
            |request_id| AgentEvent::ConfirmationRequested { request_id, message },
            |s| match s {
                UserSignal::Confirm { approved, .. } => Some(approved),
                _ => None,
            },
        )
        .await
        .unwrap_or(false)
    }

    async fn take_over(&self, message: &str) {
        let message = message.to_string();
        self.ask(
            |request_id| AgentEvent::TakeOverRequested { request_id, message },
            |s| matches!(s, UserSignal::TakeOverDone { .. }).then_some(()),
        )
        .await;
    }

    async fn interact(&self, message: &str) -> Option<String> {
        let message = message.to_string();
        self.ask(
            |request_id| AgentEvent::InteractRequested { request_id, message },
            |s| match s {
                UserSignal::Choice { reply, .. } => Some(reply),
                _ => None,
            },
        )
        .await
        .flatten()
    }
}
