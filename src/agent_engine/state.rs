use serde::{Deserialize, Serialize};

/// Normalized action verb of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Tap,
    DoubleTap,
    LongPress,
    Swipe,
    Type,
    TypeName,
    Launch,
    Home,
    Back,
    Enter,
    Wait,
    Note,
    TakeOver,
    Interact,
    CallApi,
    Finish,
    /// Anything the dispatch table does not know; carried verbatim (lowercased).
    Unknown(String),
}

impl Verb {
    /// Case-insensitive; `_` and runs of whitespace are treated alike ("Long_Press" = "long press").
    pub fn parse(raw: &str) -> Self {
        let key = raw
            .trim()
            .to_lowercase()
            .replace(['_', '-'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        match key.as_str() {
            "tap" => Verb::Tap,
            "double tap" => Verb::DoubleTap,
            "long press" => Verb::LongPress,
            "swipe" => Verb::Swipe,
            "type" => Verb::Type,
            "type name" => Verb::TypeName,
            "launch" => Verb::Launch,
            "home" => Verb::Home,
            "back" => Verb::Back,
            "enter" => Verb::Enter,
            "wait" => Verb::Wait,
            "note" => Verb::Note,
            "take over" => Verb::TakeOver,
            "interact" => Verb::Interact,
            "call api" => Verb::CallApi,
            "finish" => Verb::Finish,
            _ => Verb::Unknown(key),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Verb::Tap => "tap",
            Verb::DoubleTap => "double tap",
            Verb::LongPress => "long press",
            Verb::Swipe => "swipe",
            Verb::Type => "type",
            Verb::TypeName => "type_name",
            Verb::Launch => "launch",
            Verb::Home => "home",
            Verb::Back => "back",
            Verb::Enter => "enter",
            Verb::Wait => "wait",
            Verb::Note => "note",
            Verb::TakeOver => "take_over",
            Verb::Interact => "interact",
            Verb::CallApi => "call_api",
            Verb::Finish => "finish",
            Verb::Unknown(v) => v.as_str(),
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model-space coordinates in `[0, 1000]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coords {
    Point([i32; 2]),
    /// Start point followed by end point.
    Span([i32; 4]),
}

impl Coords {
    pub fn as_slice(&self) -> &[i32] {
        match self {
            Coords::Point(p) => p,
            Coords::Span(s) => s,
        }
    }
}

/// One validated action instruction parsed from a model reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub verb: Verb,
    pub coords: Option<Coords>,
    /// Textual payload: first of `text=`, `message=`, `app=`.
    pub text: Option<String>,
    pub duration_ms: Option<u64>,
    /// `instruction=` argument of `call_api`.
    pub instruction: Option<String>,
    /// `message=` argument: sensitive-action prompt, finish summary or hand-off reason.
    pub message: Option<String>,
}

impl Command {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            coords: None,
            text: None,
            duration_ms: None,
            instruction: None,
            message: None,
        }
    }

    pub fn is_finish(&self) -> bool {
        self.verb == Verb::Finish
    }

    pub fn point(&self) -> Option<(i32, i32)> {
        match self.coords {
            Some(Coords::Point([x, y])) => Some((x, y)),
            _ => None,
        }
    }

    pub fn span(&self) -> Option<[i32; 4]> {
        match self.coords {
            Some(Coords::Span(s)) => Some(s),
            _ => None,
        }
    }
}

/// Parser output for one reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseResult {
    pub rationale: Option<String>,
    pub command: Option<Command>,
}

/// Executor output for one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub success: bool,
    pub should_continue: bool,
    pub error: Option<String>,
    /// Text the user supplied during an `interact` hand-off.
    pub user_reply: Option<String>,
}

impl ExecuteResult {
    pub fn ok() -> Self {
        Self { success: true, should_continue: true, error: None, user_reply: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, should_continue: true, error: Some(error.into()), user_reply: None }
    }

    /// Command skipped and the loop asked to stop (declined confirmation or cancelled wait).
    pub fn stop() -> Self {
        Self { success: true, should_continue: false, error: None, user_reply: None }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Finished { message: String },
    StepBudgetExhausted { steps: u32 },
    RepeatedFailure { failures: u32 },
    CaptureFailed { error: String },
    Declined,
    Cancelled,
    Crashed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Warning,
    Error,
    Info,
}

/// The single user-visible message a task ends with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalMessage {
    pub severity: Severity,
    pub text: String,
}

impl TaskOutcome {
    pub fn final_message(&self) -> FinalMessage {
        let (severity, text) = match self {
            TaskOutcome::Finished { message } => (Severity::Success, message.clone()),
            TaskOutcome::StepBudgetExhausted { steps } => (
                Severity::Warning,
                format!("Step budget exhausted after {steps} steps; the task was stopped."),
            ),
            TaskOutcome::RepeatedFailure { failures } => (
                Severity::Error,
                format!("Stopped after {failures} consecutive failed steps."),
            ),
            TaskOutcome::CaptureFailed { error } => {
                (Severity::Error, format!("Screen capture failed: {error}"))
            }
            TaskOutcome::Declined => (
                Severity::Info,
                "Sensitive action declined; the task was stopped.".to_string(),
            ),
            TaskOutcome::Cancelled => (Severity::Info, "Task cancelled.".to_string()),
            TaskOutcome::Crashed { error } => {
                (Severity::Error, format!("Task aborted by an internal error: {error}"))
            }
        };
        FinalMessage { severity, text }
    }
}
