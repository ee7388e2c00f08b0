pub mod adb;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::DroidClawResult;

/// Privileged automation channel to the phone. Every call is a fallible remote call.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Id of the currently active input method.
    async fn current_ime(&self) -> DroidClawResult<String>;

    async fn set_ime(&self, id: &str) -> DroidClawResult<bool>;

    async fn is_ime_enabled(&self, id: &str) -> DroidClawResult<bool>;

    /// Package id of the app in the foreground.
    async fn foreground_app(&self) -> DroidClawResult<String>;

    /// Captures the screen to a local PNG file and returns its path.
    async fn capture_screen_to_file(&self) -> DroidClawResult<PathBuf>;

    /// Injects base64-encoded UTF-8 text through the automation input method.
    async fn inject_text_base64(&self, payload: &str) -> DroidClawResult<()>;

    /// Runs an allow-listed shell command on the device and returns its stdout.
    async fn shell(&self, command: &str) -> DroidClawResult<String>;
}
