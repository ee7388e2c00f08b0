use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent_engine::session::SharedNotes;
use crate::agent_engine::state::{Command, ExecuteResult, Verb};
use crate::apps::AppResolver;
use crate::config::ExecutorConfig;
use crate::device::DeviceControl;
use crate::errors::{DroidClawError, DroidClawResult};
use crate::executor::coordinator::CoordinateMapper;
use crate::executor::input;
use crate::executor::safety::{sensitive_message, HumanGate};
use crate::executor::text_input::{self, ImeReservation};
use crate::perception::types::FrameMeta;

pub const DEFAULT_FINISH_MESSAGE: &str = "task complete";
pub const DEFAULT_TAKE_OVER_MESSAGE: &str = "needs manual intervention";
pub const DEFAULT_INTERACT_MESSAGE: &str = "please choose";

/// Turns parsed commands into device operations.
///
/// Device-call failures are logged and reported as success; the only
/// execution failure is a `launch` whose app cannot be resolved.
pub struct ActionExecutor {
    device: Arc<dyn DeviceControl>,
    apps: Arc<dyn AppResolver>,
    gate: Arc<dyn HumanGate>,
    ime: Arc<ImeReservation>,
    notes: SharedNotes,
    mapper: CoordinateMapper,
    config: ExecutorConfig,
}

impl ActionExecutor {
    pub fn new(
        device: Arc<dyn DeviceControl>,
        apps: Arc<dyn AppResolver>,
        gate: Arc<dyn HumanGate>,
        notes: SharedNotes,
        config: ExecutorConfig,
    ) -> Self {
        let ime = Arc::new(ImeReservation::new(
            Arc::clone(&device),
            config.automation_ime.clone(),
        ));
        Self {
            device,
            apps,
            gate,
            ime,
            notes,
            mapper: CoordinateMapper::default(),
            config,
        }
    }

    /// Re-primes the coordinate mapper with a freshly captured frame.
    pub fn prime(&mut self, meta: &FrameMeta) {
        self.mapper.prime(meta);
    }

    /// The input-method reservation, for cleanup that must outlive this executor.
    pub fn ime_handle(&self) -> Arc<ImeReservation> {
        Arc::clone(&self.ime)
    }

    pub async fn execute(&self, command: &Command, cancel: &CancellationToken) -> ExecuteResult {
        if let Some(message) = sensitive_message(command) {
            tracing::info!(verb = %command.verb, prompt = message, "awaiting confirmation");
            let approved = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                approved = self.gate.confirm(message) => approved,
            };
            if !approved {
                tracing::info!(verb = %command.verb, "sensitive action declined");
                return ExecuteResult::stop();
            }
        }

        match self.dispatch(command, cancel).await {
            Ok(result) => result,
            Err(DroidClawError::Cancelled) => {
                tracing::info!(verb = %command.verb, "command interrupted by cancellation");
                ExecuteResult::stop()
            }
            Err(e) => {
                tracing::warn!(verb = %command.verb, error = %e, "device call failed, continuing");
                ExecuteResult::ok()
            }
        }
    }

    async fn dispatch(&self, command: &Command, cancel: &CancellationToken) -> DroidClawResult<ExecuteResult> {
        let device = self.device.as_ref();
        let cfg = &self.config;

        match &command.verb {
            Verb::Tap => {
                let Some((x, y)) = self.pixel(command) else { return Ok(missing(command, "element")) };
                tracing::info!(x, y, "tap");
                interruptible(cancel, input::tap(device, x, y)).await?;
                self.settle(cfg.post_action_delay_ms, cancel).await?;
            }
            Verb::DoubleTap => {
                let Some((x, y)) = self.pixel(command) else { return Ok(missing(command, "element")) };
                tracing::info!(x, y, "double tap");
                let gap = Duration::from_millis(cfg.double_tap_gap_ms);
                interruptible(cancel, input::double_tap(device, x, y, gap)).await?;
                self.settle(cfg.post_action_delay_ms, cancel).await?;
            }
            Verb::LongPress => {
                let Some((x, y)) = self.pixel(command) else { return Ok(missing(command, "element")) };
                let hold = command.duration_ms.unwrap_or(cfg.long_press_ms);
                tracing::info!(x, y, hold_ms = hold, "long press");
                interruptible(cancel, input::long_press(device, x, y, Duration::from_millis(hold))).await?;
                self.settle(cfg.post_action_delay_ms, cancel).await?;
            }
            Verb::Swipe => {
                let Some([x1, y1, x2, y2]) = command.span() else { return Ok(missing(command, "start/end")) };
                let from = self.mapper.to_pixel(x1, y1);
                let to = self.mapper.to_pixel(x2, y2);
                let duration = command.duration_ms.unwrap_or(cfg.swipe_ms);
                tracing::info!(?from, ?to, duration_ms = duration, "swipe");
                interruptible(cancel, input::swipe(device, from, to, Duration::from_millis(duration))).await?;
                self.settle(cfg.post_swipe_delay_ms, cancel).await?;
            }
            Verb::Type | Verb::TypeName => {
                let Some(text) = command.text.as_deref() else { return Ok(missing(command, "text")) };
                match interruptible(cancel, self.ime.reserve()).await {
                    Ok(true) => self.settle(cfg.ime_switch_delay_ms, cancel).await?,
                    Ok(false) => {}
                    Err(DroidClawError::Cancelled) => return Err(DroidClawError::Cancelled),
                    Err(e) => tracing::warn!(error = %e, "input method switch failed, typing anyway"),
                }
                tracing::info!(chars = text.chars().count(), "type");
                interruptible(cancel, text_input::type_text(device, text)).await?;
                self.settle(cfg.post_type_delay_ms, cancel).await?;
            }
            Verb::Launch => {
                let Some(name) = command.text.as_deref() else {
                    return Ok(ExecuteResult::failed("launch needs an app name"));
                };
                let Some(package) = self.apps.package_for(name) else {
                    tracing::warn!(app = %name, "launch target not in app table");
                    return Ok(ExecuteResult::failed(format!("App not found: {name}")));
                };
                tracing::info!(app = %name, package = %package, "launch");
                interruptible(cancel, input::launch_package(device, &package)).await?;
                self.settle(cfg.post_launch_delay_ms, cancel).await?;
            }
            Verb::Home | Verb::Back | Verb::Enter => {
                let keycode = match command.verb {
                    Verb::Home => input::KEYCODE_HOME,
                    Verb::Back => input::KEYCODE_BACK,
                    _ => input::KEYCODE_ENTER,
                };
                tracing::info!(verb = %command.verb, keycode, "key event");
                interruptible(cancel, input::key_event(device, keycode)).await?;
                self.settle(cfg.post_action_delay_ms, cancel).await?;
            }
            Verb::Wait => {
                let ms = command.duration_ms.unwrap_or(cfg.wait_ms);
                tracing::info!(ms, "wait");
                self.settle(ms, cancel).await?;
            }
            Verb::Note => {
                let Some(note) = command.text.as_deref() else { return Ok(missing(command, "message")) };
                let mut notes = self.notes.lock().await;
                notes.push(note.to_string());
                tracing::info!(count = notes.len(), "note recorded");
            }
            Verb::TakeOver => {
                let message = hand_off_message(command, DEFAULT_TAKE_OVER_MESSAGE);
                tracing::info!(prompt = message, "handing device to the user");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DroidClawError::Cancelled),
                    _ = self.gate.take_over(message) => {}
                }
                tracing::info!("device handed back");
            }
            Verb::Interact => {
                let message = hand_off_message(command, DEFAULT_INTERACT_MESSAGE);
                tracing::info!(prompt = message, "asking the user to choose");
                let reply = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DroidClawError::Cancelled),
                    reply = self.gate.interact(message) => reply,
                };
                return Ok(ExecuteResult { user_reply: reply, ..ExecuteResult::ok() });
            }
            Verb::CallApi => {
                tracing::debug!("call_api handled by the session");
            }
            Verb::Finish => {
                tracing::debug!("finish reached the executor, nothing to do");
            }
            Verb::Unknown(verb) => {
                tracing::warn!(verb = %verb, "unrecognized verb ignored");
            }
        }
        Ok(ExecuteResult::ok())
    }

    fn pixel(&self, command: &Command) -> Option<(i32, i32)> {
        command.point().map(|(x, y)| self.mapper.to_pixel(x, y))
    }

    async fn settle(&self, ms: u64, cancel: &CancellationToken) -> DroidClawResult<()> {
        if ms == 0 {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DroidClawError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
        }
    }
}

/// Races a device call against cancellation.
async fn interruptible<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = DroidClawResult<T>>,
) -> DroidClawResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DroidClawError::Cancelled),
        result = call => result,
    }
}

fn hand_off_message<'a>(command: &'a Command, default: &'a str) -> &'a str {
    command
        .message
        .as_deref()
        .or(command.text.as_deref())
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(default)
}

fn missing(command: &Command, param: &str) -> ExecuteResult {
    tracing::warn!(verb = %command.verb, param, "required parameter missing, command skipped");
    ExecuteResult::ok()
}
