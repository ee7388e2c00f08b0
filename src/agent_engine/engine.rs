use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::event_bus::{AgentEvent, EventBus};
use crate::agent_engine::history::{HistoryEntry, TaskHistory};
use crate::agent_engine::loop_control::LoopController;
use crate::agent_engine::session::{Session, SessionModels, StepOutput};
use crate::agent_engine::state::TaskOutcome;
use crate::apps::{AppResolver, AppTable};
use crate::config::AppConfig;
use crate::device::DeviceControl;
use crate::errors::DroidClawError;
use crate::executor::dispatcher::{ActionExecutor, DEFAULT_FINISH_MESSAGE};
use crate::executor::safety::HumanGate;
use crate::executor::text_input::ImeReservation;
use crate::perception::screenshot::capture_frame;

/// Runs tasks: capture → reason → execute, until a terminal state.
///
/// The configuration is fixed at construction; edits made while a task runs
/// only apply to engines built afterwards.
pub struct AgentEngine {
    config: Arc<AppConfig>,
    models: SessionModels,
    device: Arc<dyn DeviceControl>,
    apps: Arc<dyn AppResolver>,
    gate: Arc<dyn HumanGate>,
    events: EventBus,
    history_dir: Option<PathBuf>,
}

impl AgentEngine {
    pub fn new(
        config: Arc<AppConfig>,
        models: SessionModels,
        device: Arc<dyn DeviceControl>,
        gate: Arc<dyn HumanGate>,
        events: EventBus,
    ) -> Self {
        let apps = Arc::new(AppTable::new(config.apps.clone()));
        Self {
            config,
            models,
            device,
            apps,
            gate,
            events,
            history_dir: None,
        }
    }

    /// Writes task transcripts to `dir` instead of the platform data directory.
    pub fn with_history_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.history_dir = Some(dir.into());
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Runs one task to its end and reports exactly one `TaskEnded` event.
    ///
    /// The input method is restored on every exit: normal completion,
    /// cancellation, a panic inside the loop, or this future being dropped.
    pub async fn run_task(&self, task: &str, cancel: CancellationToken) -> TaskOutcome {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut history = self.open_history(session_id.clone());

        let mut session = Session::new(
            self.models.clone(),
            Arc::clone(&self.device),
            Arc::clone(&self.apps),
            self.events.clone(),
            self.config.agent.language.clone(),
        );
        let mut executor = ActionExecutor::new(
            Arc::clone(&self.device),
            Arc::clone(&self.apps),
            Arc::clone(&self.gate),
            session.notes(),
            self.config.executor.clone(),
        );
        let cleanup = RestoreGuard::new(executor.ime_handle());

        tracing::info!(session = %session_id, task = %task, "task started");
        self.events.emit(AgentEvent::TaskStarted {
            session_id: session_id.clone(),
            task: task.to_string(),
        });
        history.record(HistoryEntry::new(0, "task").content(task));

        let run = AssertUnwindSafe(self.drive(task, &mut session, &mut executor, &mut history, &cancel))
            .catch_unwind()
            .await;
        let outcome = match run {
            Ok(outcome) => outcome,
            Err(payload) => {
                let error = panic_message(payload.as_ref());
                tracing::error!(session = %session_id, error = %error, "agent loop panicked");
                TaskOutcome::Crashed { error }
            }
        };
        session.stop();
        cleanup.run().await;

        let message = outcome.final_message();
        tracing::info!(session = %session_id, ?outcome, "task ended");
        history.record(
            HistoryEntry::new(0, "final")
                .content(message.text.clone())
                .data(&outcome),
        );
        self.events.emit(AgentEvent::TaskEnded {
            outcome: outcome.clone(),
            message,
        });
        outcome
    }

    async fn drive(
        &self,
        task: &str,
        session: &mut Session,
        executor: &mut ActionExecutor,
        history: &mut TaskHistory,
        cancel: &CancellationToken,
    ) -> TaskOutcome {
        session.start(task).await;
        let mut control = LoopController::new(&self.config.agent);
        let retry_delay = Duration::from_millis(self.config.agent.retry_delay_ms);

        loop {
            if cancel.is_cancelled() {
                return TaskOutcome::Cancelled;
            }
            if !control.begin_step() {
                tracing::warn!(steps = control.step_count(), "step budget exhausted");
                return TaskOutcome::StepBudgetExhausted { steps: control.step_count() };
            }
            let step = control.step_count();
            self.events.emit(AgentEvent::StepStarted { step });

            let captured = tokio::select! {
                biased;
                _ = cancel.cancelled() => return TaskOutcome::Cancelled,
                frame = capture_frame(self.device.as_ref()) => frame,
            };
            let frame = match captured {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(step, error = %e, "frame capture failed");
                    return TaskOutcome::CaptureFailed { error: e.to_string() };
                }
            };
            executor.prime(&frame.meta);

            let output = match session.step(&frame, cancel).await {
                Ok(output) => output,
                Err(DroidClawError::Cancelled) => return TaskOutcome::Cancelled,
                Err(e) => {
                    tracing::warn!(step, error = %e, "step failed");
                    None
                }
            };
            drop(frame);

            let Some(StepOutput { rationale, command }) = output else {
                history.record(HistoryEntry::new(step, "no_command"));
                if control.record_failure() {
                    tracing::warn!(failures = control.consecutive_failures(), "failure budget exhausted");
                    return TaskOutcome::RepeatedFailure { failures: control.consecutive_failures() };
                }
                tracing::info!(
                    step,
                    failures = control.consecutive_failures(),
                    "no command this step, retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return TaskOutcome::Cancelled,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
                continue;
            };

            control.record_command();
            if !rationale.trim().is_empty() {
                self.events.emit(AgentEvent::Rationale { step, text: rationale.clone() });
            }
            self.events.emit(AgentEvent::CommandParsed { step, command: command.clone() });
            history.record(
                HistoryEntry::new(step, "command")
                    .content(rationale)
                    .data(&command),
            );

            if command.is_finish() {
                let message = command
                    .message
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_FINISH_MESSAGE.to_string());
                return TaskOutcome::Finished { message };
            }

            let result = executor.execute(&command, cancel).await;
            history.record(HistoryEntry::new(step, "result").data(&result));
            if cancel.is_cancelled() {
                return TaskOutcome::Cancelled;
            }

            if !result.success {
                let message = result
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("{} failed", command.verb));
                tracing::warn!(step, verb = %command.verb, error = %message, "command failed");
                self.events.emit(AgentEvent::ActionFailed { step, message });
                if control.record_failure() {
                    return TaskOutcome::RepeatedFailure { failures: control.consecutive_failures() };
                }
            }
            if !result.should_continue {
                return TaskOutcome::Declined;
            }
            if let Some(reply) = result.user_reply {
                session.push_user_text(format!("User reply: {reply}"));
            }
        }
    }

    fn open_history(&self, session_id: String) -> TaskHistory {
        if !self.config.agent.record_history {
            return TaskHistory::in_memory(session_id);
        }
        match &self.history_dir {
            Some(dir) => TaskHistory::in_dir(session_id, dir),
            None => TaskHistory::persistent(session_id),
        }
    }
}

/// Restores the input method once, either through [`run`](Self::run) or, if
/// the owning future is dropped first, from `Drop` on a spawned task.
struct RestoreGuard {
    ime: Option<Arc<ImeReservation>>,
}

impl RestoreGuard {
    fn new(ime: Arc<ImeReservation>) -> Self {
        Self { ime: Some(ime) }
    }

    async fn run(mut self) {
        if let Some(ime) = &self.ime {
            ime.restore().await;
        }
        self.ime = None;
    }
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        let Some(ime) = self.ime.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if ime.restore().await {
                        tracing::info!("input method restored after task was dropped");
                    }
                });
            }
            Err(_) => tracing::error!("task dropped outside a runtime, input method not restored"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_engine::session::ModelHandle;
    use crate::agent_engine::state::Severity;
    use crate::llm::provider::LlmProvider;
    use crate::llm::types::{CallConfig, ChatMessage, LlmResponse};
    use crate::testing::{MockDevice, ScriptedGate, ScriptedProvider, ORIGINAL_IME};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast::{self, error::TryRecvError};

    const AUTOMATION_IME: &str = "com.android.adbkeyboard/.AdbIME";

    struct Harness {
        engine: AgentEngine,
        device: Arc<MockDevice>,
        events: broadcast::Receiver<AgentEvent>,
        dir: tempfile::TempDir,
    }

    fn harness(vision: Arc<dyn LlmProvider>, gate: ScriptedGate) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(MockDevice::new(dir.path()));
        let summary: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::repeating("summary"));
        let models = SessionModels {
            vision: ModelHandle { provider: vision, cfg: ScriptedProvider::cfg() },
            summary: ModelHandle { provider: summary, cfg: ScriptedProvider::cfg() },
        };
        let mut config = AppConfig::default();
        config
            .apps
            .insert("Settings".to_string(), "com.android.settings".to_string());
        let events = EventBus::new();
        let receiver = events.subscribe();
        let engine = AgentEngine::new(Arc::new(config), models, device.clone(), Arc::new(gate), events)
            .with_history_dir(dir.path());
        Harness { engine, device, events: receiver, dir }
    }

    fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => out.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return out,
            }
        }
    }

    fn ended(events: &[AgentEvent]) -> Vec<&AgentEvent> {
        events
            .iter()
            .filter(|e| matches!(e, AgentEvent::TaskEnded { .. }))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn finish_ends_the_task_with_its_message() {
        let vision = Arc::new(ScriptedProvider::new(&[
            "<answer>do(action=\"Home\")</answer>",
            "<think>done</think><answer>finish(message=\"All set\")</answer>",
        ]));
        let mut h = harness(vision.clone(), ScriptedGate::approving());

        let outcome = h.engine.run_task("go home", CancellationToken::new()).await;
        assert_eq!(outcome, TaskOutcome::Finished { message: "All set".into() });
        assert_eq!(h.device.shell_calls(), vec!["input keyevent 3".to_string()]);

        let events = drain(&mut h.events);
        assert_eq!(ended(&events).len(), 1);
        match ended(&events)[0] {
            AgentEvent::TaskEnded { message, .. } => assert_eq!(message.severity, Severity::Success),
            _ => unreachable!(),
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Rationale { step: 2, text } if text == "done")));
    }

    #[tokio::test(start_paused = true)]
    async fn finish_without_message_uses_default() {
        let vision = Arc::new(ScriptedProvider::new(&["finish()"]));
        let h = harness(vision, ScriptedGate::approving());
        let outcome = h.engine.run_task("t", CancellationToken::new()).await;
        assert_eq!(outcome, TaskOutcome::Finished { message: DEFAULT_FINISH_MESSAGE.into() });
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_exactly_three_empty_steps() {
        let vision = Arc::new(ScriptedProvider::repeating("I am not sure what to do"));
        let mut h = harness(vision.clone(), ScriptedGate::approving());

        let outcome = h.engine.run_task("t", CancellationToken::new()).await;
        assert_eq!(outcome, TaskOutcome::RepeatedFailure { failures: 3 });
        assert_eq!(vision.requests().len(), 3);
        assert_eq!(h.device.captures(), 3);

        let events = drain(&mut h.events);
        match ended(&events).as_slice() {
            [AgentEvent::TaskEnded { message, .. }] => assert_eq!(message.severity, Severity::Error),
            _ => panic!("expected one TaskEnded"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_command_resets_the_failure_count() {
        let vision = Arc::new(ScriptedProvider::new(&[
            "nonsense",
            "nonsense",
            "do(action=\"Back\")",
            "nonsense",
            "nonsense",
            "nonsense",
        ]));
        let h = harness(vision.clone(), ScriptedGate::approving());
        let outcome = h.engine.run_task("t", CancellationToken::new()).await;
        assert_eq!(outcome, TaskOutcome::RepeatedFailure { failures: 3 });
        assert_eq!(vision.requests().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn service_errors_count_as_failures() {
        let vision = Arc::new(ScriptedProvider::new(&[]));
        for _ in 0..3 {
            vision.push_error(DroidClawError::Api { status: 503, body: "busy".into() });
        }
        let mut h = harness(vision, ScriptedGate::approving());
        let outcome = h.engine.run_task("t", CancellationToken::new()).await;
        assert_eq!(outcome, TaskOutcome::RepeatedFailure { failures: 3 });

        let service_errors = drain(&mut h.events)
            .into_iter()
            .filter(|e| matches!(e, AgentEvent::ServiceError { .. }))
            .count();
        assert_eq!(service_errors, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_exactly_fifty_steps() {
        let vision = Arc::new(ScriptedProvider::repeating("<answer>do(action=\"Back\")</answer>"));
        let mut h = harness(vision.clone(), ScriptedGate::approving());

        let outcome = h.engine.run_task("t", CancellationToken::new()).await;
        assert_eq!(outcome, TaskOutcome::StepBudgetExhausted { steps: 50 });
        assert_eq!(vision.requests().len(), 50);
        assert_eq!(h.device.shell_calls().len(), 50);

        let events = drain(&mut h.events);
        match ended(&events).as_slice() {
            [AgentEvent::TaskEnded { message, .. }] => assert_eq!(message.severity, Severity::Warning),
            _ => panic!("expected one TaskEnded"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn declined_confirmation_stops_without_tapping() {
        let vision = Arc::new(ScriptedProvider::repeating(
            "<answer>do(action=\"Tap\", element=[500,900], message=\"Pay 30 yuan\")</answer>",
        ));
        let h = harness(vision.clone(), ScriptedGate::declining());

        let outcome = h.engine.run_task("buy", CancellationToken::new()).await;
        assert_eq!(outcome, TaskOutcome::Declined);
        assert_eq!(outcome.final_message().severity, Severity::Info);
        assert!(h.device.shell_calls().is_empty());
        assert_eq!(vision.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_failure_is_fatal() {
        let vision = Arc::new(ScriptedProvider::repeating("do(action=\"Back\")"));
        let h = harness(vision.clone(), ScriptedGate::approving());
        h.device.fail_capture();

        let outcome = h.engine.run_task("t", CancellationToken::new()).await;
        assert!(matches!(outcome, TaskOutcome::CaptureFailed { .. }));
        assert!(vision.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_launch_is_reported_and_the_loop_continues() {
        let vision = Arc::new(ScriptedProvider::new(&[
            "<answer>do(action=\"Launch\", app=\"Nowhere\")</answer>",
            "<answer>finish(message=\"gave up\")</answer>",
        ]));
        let mut h = harness(vision, ScriptedGate::approving());

        let outcome = h.engine.run_task("t", CancellationToken::new()).await;
        assert_eq!(outcome, TaskOutcome::Finished { message: "gave up".into() });
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ActionFailed { step: 1, message } if message == "App not found: Nowhere"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_restores_the_input_method_once() {
        let vision = Arc::new(ScriptedProvider::new(&[
            "<answer>do(action=\"Type\", text=\"hello\")</answer>",
        ]));
        let h = harness(vision, ScriptedGate::approving());
        let cancel = CancellationToken::new();
        h.device.cancel_on_inject(cancel.clone());

        let outcome = h.engine.run_task("t", cancel).await;
        tokio::task::yield_now().await;

        assert_eq!(outcome, TaskOutcome::Cancelled);
        assert_eq!(h.device.current_ime_now(), ORIGINAL_IME);
        assert_eq!(
            h.device.set_ime_calls(),
            vec![AUTOMATION_IME.to_string(), ORIGINAL_IME.to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn normal_completion_restores_the_input_method() {
        let vision = Arc::new(ScriptedProvider::new(&[
            "do(action=\"Type\", text=\"hello\")",
            "finish(message=\"typed\")",
        ]));
        let h = harness(vision, ScriptedGate::approving());
        h.engine.run_task("t", CancellationToken::new()).await;
        assert_eq!(h.device.current_ime_now(), ORIGINAL_IME);
        assert_eq!(h.device.set_ime_calls().len(), 2);
    }

    struct PanicsOnSecondCall {
        inner: ScriptedProvider,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for PanicsOnSecondCall {
        fn name(&self) -> &str {
            "panicky"
        }

        async fn chat(&self, messages: &[ChatMessage], cfg: &CallConfig) -> crate::errors::DroidClawResult<LlmResponse> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
                panic!("provider blew up");
            }
            self.inner.chat(messages, cfg).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_panic_still_restores_the_input_method() {
        let vision = Arc::new(PanicsOnSecondCall {
            inner: ScriptedProvider::new(&["do(action=\"Type\", text=\"x\")"]),
            calls: AtomicUsize::new(0),
        });
        let mut h = harness(vision, ScriptedGate::approving());

        let outcome = h.engine.run_task("t", CancellationToken::new()).await;
        assert_eq!(outcome, TaskOutcome::Crashed { error: "provider blew up".into() });
        assert_eq!(h.device.current_ime_now(), ORIGINAL_IME);
        assert_eq!(ended(&drain(&mut h.events)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_task_restores_the_input_method() {
        let vision = Arc::new(ScriptedProvider::new(&["do(action=\"Type\", text=\"x\")"]));
        let h = harness(vision, ScriptedGate::never_answering());
        let engine = Arc::new(h.engine);

        let runner = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            runner.run_task("t", CancellationToken::new()).await
        });
        // Typing done and the loop is idling in its retry delay.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.device.current_ime_now(), AUTOMATION_IME);

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.device.current_ime_now(), ORIGINAL_IME);
    }

    #[tokio::test(start_paused = true)]
    async fn interact_reply_reaches_the_next_request() {
        let vision = Arc::new(ScriptedProvider::new(&[
            "do(action=\"Interact\", message=\"Which colour?\")",
            "finish(message=\"ok\")",
        ]));
        let h = harness(vision.clone(), ScriptedGate::approving().with_choice("the blue one"));
        h.engine.run_task("t", CancellationToken::new()).await;

        let second = &vision.requests()[1];
        assert!(second.iter().any(|m| m.text().contains("the blue one")));
    }

    #[tokio::test(start_paused = true)]
    async fn transcript_is_written_as_jsonl() {
        let vision = Arc::new(ScriptedProvider::new(&["finish(message=\"ok\")"]));
        let h = harness(vision, ScriptedGate::approving());
        h.engine.run_task("write it down", CancellationToken::new()).await;

        let file = std::fs::read_dir(h.dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.extension().is_some_and(|ext| ext == "jsonl"))
            .unwrap();
        let lines: Vec<HistoryEntry> = std::fs::read_to_string(file)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.first().unwrap().kind, "task");
        assert_eq!(lines.first().unwrap().content.as_deref(), Some("write it down"));
        assert_eq!(lines.last().unwrap().kind, "final");
    }
}
