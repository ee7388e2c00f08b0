use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::event_bus::{AgentEvent, EventBus};
use crate::agent_engine::parser;
use crate::agent_engine::prompts;
use crate::agent_engine::state::{Command, Verb};
use crate::apps::AppResolver;
use crate::device::DeviceControl;
use crate::errors::{DroidClawError, DroidClawResult};
use crate::llm::provider::LlmProvider;
use crate::llm::registry::{AgentRole, ProviderRegistry};
use crate::llm::types::{CallConfig, ChatMessage};
use crate::perception::types::Frame;

/// Rationale surfaced when no reply has carried one yet.
pub const RATIONALE_PLACEHOLDER: &str = "(no reasoning provided)";

const SUMMARY_SYSTEM_PROMPT: &str =
    "You condense notes taken during a phone automation task. Answer with the summary only.";

/// Notes recorded by the `note` action, shared between session and executor.
pub type SharedNotes = Arc<Mutex<Vec<String>>>;

/// A provider plus the call settings it is used with.
#[derive(Clone)]
pub struct ModelHandle {
    pub provider: Arc<dyn LlmProvider>,
    pub cfg: CallConfig,
}

#[derive(Clone)]
pub struct SessionModels {
    pub vision: ModelHandle,
    pub summary: ModelHandle,
}

impl SessionModels {
    pub fn from_registry(registry: &ProviderRegistry) -> DroidClawResult<Self> {
        let (provider, cfg) = registry.call_config_for_role(AgentRole::Vision)?;
        let vision = ModelHandle { provider, cfg };
        let (provider, cfg) = registry.call_config_for_role(AgentRole::Summary)?;
        let summary = ModelHandle { provider, cfg };
        Ok(Self { vision, summary })
    }
}

/// What one step produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub rationale: String,
    pub command: Command,
}

/// Conversation state of one task attempt.
pub struct Session {
    models: SessionModels,
    device: Arc<dyn DeviceControl>,
    apps: Arc<dyn AppResolver>,
    events: EventBus,
    language: String,
    history: Vec<ChatMessage>,
    notes: SharedNotes,
    running: bool,
    last_rationale: Option<String>,
}

impl Session {
    pub fn new(
        models: SessionModels,
        device: Arc<dyn DeviceControl>,
        apps: Arc<dyn AppResolver>,
        events: EventBus,
        language: impl Into<String>,
    ) -> Self {
        Self {
            models,
            device,
            apps,
            events,
            language: language.into(),
            history: Vec::new(),
            notes: Arc::new(Mutex::new(Vec::new())),
            running: false,
            last_rationale: None,
        }
    }

    /// Clears history and notes, seeds the system instruction and the task.
    pub async fn start(&mut self, task: &str) {
        self.history.clear();
        self.notes.lock().await.clear();
        self.last_rationale = None;
        self.history
            .push(ChatMessage::system(prompts::system_prompt(&self.language)));
        self.history.push(ChatMessage::user(format!("Task: {task}")));
        self.running = true;
        tracing::info!(task = %task, "session started");
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn notes(&self) -> SharedNotes {
        Arc::clone(&self.notes)
    }

    /// Appends a plain user turn (e.g. a choice made during `interact`).
    pub fn push_user_text(&mut self, text: impl Into<String>) {
        self.history.push(ChatMessage::user(text));
    }

    /// Sends the frame with the conversation and parses the reply.
    ///
    /// `Ok(None)` covers a stopped session, a reply without a command, and a
    /// service failure (already reported on the event bus). The only error is
    /// [`DroidClawError::Cancelled`].
    pub async fn step(&mut self, frame: &Frame, cancel: &CancellationToken) -> DroidClawResult<Option<StepOutput>> {
        if !self.running {
            return Ok(None);
        }
        checkpoint(cancel)?;

        let app = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DroidClawError::Cancelled),
            app = self.foreground_app_name() => app,
        };
        let info = prompts::screen_info(&app, chrono::Local::now());

        checkpoint(cancel)?;
        let turn = ChatMessage::user_with_image(info.clone(), frame.to_data_uri());

        for msg in self.history.iter_mut().filter(|m| m.has_image()) {
            msg.strip_images();
        }
        let mut request = self.history.clone();
        request.push(turn);

        checkpoint(cancel)?;
        let vision = &self.models.vision;
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DroidClawError::Cancelled),
            r = vision.provider.chat(&request, &vision.cfg) => r,
        };
        drop(request);
        checkpoint(cancel)?;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                self.report_service_error(&e);
                return Ok(None);
            }
        };

        self.history.push(ChatMessage::user(info));
        self.history.push(ChatMessage::assistant(reply.content.clone()));

        let parsed = parser::parse(&reply.content);
        let fresh = parsed.rationale.or_else(|| {
            let r = reply.reasoning.trim();
            (!r.is_empty()).then(|| r.to_string())
        });
        let rationale = self.remember_rationale(fresh);

        let Some(command) = parsed.command else {
            tracing::warn!("reply contained no recognizable command");
            return Ok(None);
        };
        tracing::info!(verb = %command.verb, "command parsed");

        if command.verb == Verb::CallApi {
            self.summarize_notes(&command, cancel).await?;
        }
        Ok(Some(StepOutput { rationale, command }))
    }

    /// Last-known-good rationale: a fresh one replaces the cache, a missing one reuses it.
    fn remember_rationale(&mut self, fresh: Option<String>) -> String {
        if let Some(r) = fresh {
            self.last_rationale = Some(r);
        }
        self.last_rationale
            .clone()
            .unwrap_or_else(|| RATIONALE_PLACEHOLDER.to_string())
    }

    async fn foreground_app_name(&self) -> String {
        match self.device.foreground_app().await {
            Ok(package) => self.apps.name_for(&package).unwrap_or(package),
            Err(e) => {
                tracing::warn!(error = %e, "foreground app lookup failed");
                "unknown".to_string()
            }
        }
    }

    /// Asks the summary model to condense all notes and appends the result as a user turn.
    async fn summarize_notes(&mut self, command: &Command, cancel: &CancellationToken) -> DroidClawResult<()> {
        let notes = self.notes.lock().await.clone();
        if notes.is_empty() {
            tracing::info!("call_api with no notes recorded");
            self.history
                .push(ChatMessage::user("Summary of recorded notes: no notes were recorded."));
            return Ok(());
        }

        let instruction = command
            .instruction
            .as_deref()
            .unwrap_or("Summarize the notes.");
        let request = vec![
            ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
            ChatMessage::user(prompts::summary_request(instruction, &notes)),
        ];

        let summary = &self.models.summary;
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DroidClawError::Cancelled),
            r = summary.provider.chat(&request, &summary.cfg) => r,
        };
        match reply {
            Ok(reply) => {
                tracing::info!(notes = notes.len(), "notes summarized");
                self.history.push(ChatMessage::user(format!(
                    "Summary of recorded notes:\n{}",
                    reply.content.trim()
                )));
            }
            Err(e) => self.report_service_error(&e),
        }
        Ok(())
    }

    fn report_service_error(&self, err: &DroidClawError) {
        let kind = err.classify();
        tracing::warn!(error = %err, ?kind, "reasoning service call failed");
        self.events.emit(AgentEvent::ServiceError {
            kind,
            message: kind.user_message().to_string(),
        });
    }
}

fn checkpoint(cancel: &CancellationToken) -> DroidClawResult<()> {
    if cancel.is_cancelled() {
        Err(DroidClawError::Cancelled)
    } else {
        Ok(())
    }
}
