//! Scripted collaborators shared by the unit tests.
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::device::DeviceControl;
use crate::errors::{DroidClawError, DroidClawResult};
use crate::executor::safety::HumanGate;
use crate::llm::provider::LlmProvider;
use crate::llm::types::{CallConfig, ChatMessage, LlmResponse};
use crate::perception::screenshot::load_frame;
use crate::perception::types::Frame;

pub const ORIGINAL_IME: &str = "com.google.android.inputmethod.latin/.LatinIME";
pub const FRAME_WIDTH: u32 = 108;
pub const FRAME_HEIGHT: u32 = 240;

fn write_png(path: &Path, width: u32, height: u32) {
    image::RgbImage::new(width, height).save(path).unwrap();
}

/// A small black PNG loaded as a frame.
pub async fn test_frame(dir: &Path) -> Frame {
    let path = dir.join("test_frame.png");
    write_png(&path, FRAME_WIDTH, FRAME_HEIGHT);
    load_frame(&path).await.unwrap()
}

#[derive(Default)]
struct DeviceState {
    current_ime: String,
    set_ime_calls: Vec<String>,
    fail_set_ime_to: Option<String>,
    shell_calls: Vec<String>,
    fail_shell: bool,
    hang_shell: bool,
    hang_set_ime_to: Option<String>,
    fail_capture: bool,
    captures: u32,
    injected: Vec<String>,
    cancel_on_inject: Option<CancellationToken>,
}

/// In-memory phone: records every call and serves a fixed frame.
pub struct MockDevice {
    frame_path: PathBuf,
    state: Mutex<DeviceState>,
}

impl MockDevice {
    pub fn new(dir: &Path) -> Self {
        let frame_path = dir.join("mock_capture.png");
        write_png(&frame_path, FRAME_WIDTH, FRAME_HEIGHT);
        Self {
            frame_path,
            state: Mutex::new(DeviceState {
                current_ime: ORIGINAL_IME.to_string(),
                ..DeviceState::default()
            }),
        }
    }

    pub fn set_current_ime(&self, id: &str) {
        self.state.lock().unwrap().current_ime = id.to_string();
    }

    pub fn current_ime_now(&self) -> String {
        self.state.lock().unwrap().current_ime.clone()
    }

    pub fn fail_set_ime_to(&self, id: &str) {
        self.state.lock().unwrap().fail_set_ime_to = Some(id.to_string());
    }

    pub fn fail_shell(&self) {
        self.state.lock().unwrap().fail_shell = true;
    }

    /// Shell commands never return from now on.
    pub fn hang_shell(&self) {
        self.state.lock().unwrap().hang_shell = true;
    }

    /// Switching to `id` never returns from now on.
    pub fn hang_set_ime_to(&self, id: &str) {
        self.state.lock().unwrap().hang_set_ime_to = Some(id.to_string());
    }

    pub fn fail_capture(&self) {
        self.state.lock().unwrap().fail_capture = true;
    }

    /// Cancels `token` from inside the next text injection.
    pub fn cancel_on_inject(&self, token: CancellationToken) {
        self.state.lock().unwrap().cancel_on_inject = Some(token);
    }

    pub fn set_ime_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().set_ime_calls.clone()
    }

    pub fn shell_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().shell_calls.clone()
    }

    pub fn injected(&self) -> Vec<String> {
        self.state.lock().unwrap().injected.clone()
    }

    pub fn captures(&self) -> u32 {
        self.state.lock().unwrap().captures
    }
}

#[async_trait]
impl DeviceControl for MockDevice {
    async fn current_ime(&self) -> DroidClawResult<String> {
        Ok(self.current_ime_now())
    }

    async fn set_ime(&self, id: &str) -> DroidClawResult<bool> {
        let hang = self.state.lock().unwrap().hang_set_ime_to.as_deref() == Some(id);
        if hang {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        state.set_ime_calls.push(id.to_string());
        if state.fail_set_ime_to.as_deref() == Some(id) {
            return Err(DroidClawError::Device(format!("ime set {id} failed")));
        }
        state.current_ime = id.to_string();
        Ok(true)
    }

    async fn is_ime_enabled(&self, _id: &str) -> DroidClawResult<bool> {
        Ok(true)
    }

    async fn foreground_app(&self) -> DroidClawResult<String> {
        Ok("com.android.settings".to_string())
    }

    async fn capture_screen_to_file(&self) -> DroidClawResult<PathBuf> {
        let mut state = self.state.lock().unwrap();
        if state.fail_capture {
            return Err(DroidClawError::Device("screencap failed".into()));
        }
        state.captures += 1;
        Ok(self.frame_path.clone())
    }

    async fn inject_text_base64(&self, payload: &str) -> DroidClawResult<()> {
        let mut state = self.state.lock().unwrap();
        state.injected.push(payload.to_string());
        if let Some(token) = state.cancel_on_inject.take() {
            token.cancel();
        }
        Ok(())
    }

    async fn shell(&self, command: &str) -> DroidClawResult<String> {
        let hang = self.state.lock().unwrap().hang_shell;
        if hang {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_shell {
            return Err(DroidClawError::Device("device offline".into()));
        }
        state.shell_calls.push(command.to_string());
        Ok(String::new())
    }
}

/// Provider that replays queued replies, then an optional repeating one.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<DroidClawResult<LlmResponse>>>,
    repeat: Mutex<Option<String>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    pub fn new(replies: &[&str]) -> Self {
        let queue = replies
            .iter()
            .map(|r| Ok(LlmResponse { content: r.to_string(), reasoning: String::new() }))
            .collect();
        Self {
            replies: Mutex::new(queue),
            repeat: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies with `content` forever once the queue is empty.
    pub fn repeating(content: &str) -> Self {
        let provider = Self::new(&[]);
        *provider.repeat.lock().unwrap() = Some(content.to_string());
        provider
    }

    pub fn cfg() -> CallConfig {
        CallConfig { model: "scripted".into(), stream: false, temperature: 0.1 }
    }

    pub fn push_reply_with_reasoning(&self, content: &str, reasoning: &str) {
        self.replies.lock().unwrap().push_back(Ok(LlmResponse {
            content: content.to_string(),
            reasoning: reasoning.to_string(),
        }));
    }

    pub fn push_error(&self, err: DroidClawError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(&self, messages: &[ChatMessage], _cfg: &CallConfig) -> DroidClawResult<LlmResponse> {
        self.requests.lock().unwrap().push(messages.to_vec());
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        match self.repeat.lock().unwrap().clone() {
            Some(content) => Ok(LlmResponse { content, reasoning: String::new() }),
            None => Err(DroidClawError::LlmProvider("script exhausted".into())),
        }
    }
}

/// Gate with fixed answers that records what it was asked.
pub struct ScriptedGate {
    approve: Option<bool>,
    choice: Option<String>,
    confirmations: Mutex<Vec<String>>,
    hand_offs: Mutex<Vec<String>>,
}

impl ScriptedGate {
    fn with_answer(approve: Option<bool>) -> Self {
        Self {
            approve,
            choice: None,
            confirmations: Mutex::new(Vec::new()),
            hand_offs: Mutex::new(Vec::new()),
        }
    }

    pub fn approving() -> Self {
        Self::with_answer(Some(true))
    }

    pub fn declining() -> Self {
        Self::with_answer(Some(false))
    }

    /// Confirmation requests never resolve.
    pub fn never_answering() -> Self {
        Self::with_answer(None)
    }

    pub fn with_choice(mut self, choice: &str) -> Self {
        self.choice = Some(choice.to_string());
        self
    }

    pub fn confirmations(&self) -> Vec<String> {
        self.confirmations.lock().unwrap().clone()
    }

    pub fn hand_offs(&self) -> Vec<String> {
        self.hand_offs.lock().unwrap().clone()
    }
}

#[async_trait]
impl HumanGate for ScriptedGate {
    async fn confirm(&self, message: &str) -> bool {
        self.confirmations.lock().unwrap().push(message.to_string());
        match self.approve {
            Some(answer) => answer,
            None => std::future::pending().await,
        }
    }

    async fn take_over(&self, message: &str) {
        self.hand_offs.lock().unwrap().push(message.to_string());
    }

    async fn interact(&self, message: &str) -> Option<String> {
        self.hand_offs.lock().unwrap().push(message.to_string());
        self.choice.clone()
    }
}
