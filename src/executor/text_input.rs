// Text entry through the automation input method, plus the reservation of that
// input method as an exclusive, restorable device setting.
use std::sync::Arc;

use base64::Engine as _;
use tokio::sync::Mutex;

use crate::device::DeviceControl;
use crate::errors::DroidClawResult;

#[derive(Debug, Default)]
struct ImeState {
    original: Option<String>,
    switched: bool,
}

/// Exclusive hold on the device's active input method.
///
/// The first `reserve` records the current input method and switches to the
/// automation one; `restore` switches back. `restore` is idempotent and runs the
/// device call at most once per reservation.
pub struct ImeReservation {
    device: Arc<dyn DeviceControl>,
    automation_ime: String,
    state: Mutex<ImeState>,
}

impl ImeReservation {
    pub fn new(device: Arc<dyn DeviceControl>, automation_ime: impl Into<String>) -> Self {
        Self {
            device,
            automation_ime: automation_ime.into(),
            state: Mutex::new(ImeState::default()),
        }
    }

    /// Switches to the automation input method unless already reserved.
    /// Returns `true` when a switch was issued by this call.
    pub async fn reserve(&self) -> DroidClawResult<bool> {
        let mut state = self.state.lock().await;
        if state.switched {
            return Ok(false);
        }

        let current = self.device.current_ime().await?;
        if current == self.automation_ime {
            tracing::debug!(ime = %current, "automation input method already active");
            return Ok(false);
        }

        // Marked before switching so a failed or interrupted switch is still undone.
        state.original = Some(current.clone());
        state.switched = true;

        match self.device.is_ime_enabled(&self.automation_ime).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(ime = %self.automation_ime, "automation input method not enabled, enabling");
                self.device
                    .shell(&format!("ime enable {}", self.automation_ime))
                    .await?;
            }
            Err(e) => tracing::warn!(error = %e, "could not query enabled input methods"),
        }

        let selected = self.device.set_ime(&self.automation_ime).await?;
        if !selected {
            tracing::warn!(ime = %self.automation_ime, "device did not confirm input method switch");
        }
        tracing::info!(from = %current, to = %self.automation_ime, "input method switched");
        Ok(true)
    }

    /// Reverts a switch made by [`reserve`](Self::reserve). Safe to call at any time.
    /// Returns `true` if a restoration was attempted.
    pub async fn restore(&self) -> bool {
        let mut state = self.state.lock().await;
        if !state.switched {
            return false;
        }
        // Cleared only after the device call, so a restore interrupted mid-call can be retried.
        if let Some(original) = state.original.clone() {
            match self.device.set_ime(&original).await {
                Ok(_) => tracing::info!(ime = %original, "input method restored"),
                Err(e) => tracing::warn!(error = %e, ime = %original, "input method restore failed"),
            }
        }
        state.original = None;
        state.switched = false;
        true
    }

    #[cfg(test)]
    pub async fn is_switched(&self) -> bool {
        self.state.lock().await.switched
    }
}

/// Injects UTF-8 text as a base64 payload through the automation input method.
pub async fn type_text(device: &dyn DeviceControl, text: &str) -> DroidClawResult<()> {
    let payload = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
    device.inject_text_base64(&payload).await
}
