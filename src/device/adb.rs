/// `adb`-backed device control.
///
/// Every operation spawns the configured adb binary with `tokio::process`;
/// the target device is selected with `-s <serial>` when one is configured.
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::DeviceConfig;
use crate::device::DeviceControl;
use crate::errors::{DroidClawError, DroidClawResult};
use crate::executor::safety::is_allowed_shell_command;

const FRAME_FILE: &str = "droidclaw_frame.png";

pub struct AdbDevice {
    adb_path: String,
    serial: Option<String>,
    capture_dir: PathBuf,
    allowed_prefixes: Vec<String>,
}

impl AdbDevice {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            adb_path: config.adb_path.clone(),
            serial: config.serial.clone(),
            capture_dir: config
                .capture_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            allowed_prefixes: config.allowed_shell_prefixes.clone(),
        }
    }

    async fn adb(&self, args: &[&str]) -> DroidClawResult<Vec<u8>> {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(args = ?args, "adb");
        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DroidClawError::Device(format!(
                "adb {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    /// Unchecked shell used for the device interface's own queries.
    async fn exec_shell(&self, command: &str) -> DroidClawResult<String> {
        let out = self.adb(&["shell", command]).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[async_trait]
impl DeviceControl for AdbDevice {
    async fn current_ime(&self) -> DroidClawResult<String> {
        let out = self.exec_shell("settings get secure default_input_method").await?;
        let id = out.trim();
        if id.is_empty() || id == "null" {
            return Err(DroidClawError::Device("no default input method reported".into()));
        }
        Ok(id.to_string())
    }

    async fn set_ime(&self, id: &str) -> DroidClawResult<bool> {
        let out = self.exec_shell(&format!("ime set {id}")).await?;
        Ok(out.to_lowercase().contains("selected"))
    }

    async fn is_ime_enabled(&self, id: &str) -> DroidClawResult<bool> {
        let out = self.exec_shell("ime list -s").await?;
        Ok(ime_list_contains(&out, id))
    }

    async fn foreground_app(&self) -> DroidClawResult<String> {
        let out = self.exec_shell("dumpsys window").await?;
        parse_focused_package(&out)
            .ok_or_else(|| DroidClawError::Device("no focused window in dumpsys output".into()))
    }

    async fn capture_screen_to_file(&self) -> DroidClawResult<PathBuf> {
        let png = self.adb(&["exec-out", "screencap", "-p"]).await?;
        if png.is_empty() {
            return Err(DroidClawError::Perception("screencap returned no data".into()));
        }
        tokio::fs::create_dir_all(&self.capture_dir).await?;
        let path = self.capture_dir.join(FRAME_FILE);
        tokio::fs::write(&path, &png).await?;
        Ok(path)
    }

    async fn inject_text_base64(&self, payload: &str) -> DroidClawResult<()> {
        self.exec_shell(&format!("am broadcast -a ADB_INPUT_B64 --es msg {payload}"))
            .await?;
        Ok(())
    }

    async fn shell(&self, command: &str) -> DroidClawResult<String> {
        if !is_allowed_shell_command(command, &self.allowed_prefixes) {
            return Err(DroidClawError::SafetyViolation(format!(
                "shell command not allow-listed: {command}"
            )));
        }
        self.exec_shell(command).await
    }
}

fn ime_list_contains(list: &str, id: &str) -> bool {
    list.lines().any(|line| line.trim() == id)
}

/// Extracts the package of the focused window from `dumpsys window` output.
///
/// Looks at `mCurrentFocus` first and falls back to `mFocusedApp`.
fn parse_focused_package(dump: &str) -> Option<String> {
    let re = regex::Regex::new(r"([A-Za-z][\w]*(?:\.[\w]+)+)/[\w.$]+").ok()?;
    for key in ["mCurrentFocus", "mFocusedApp"] {
        for line in dump.lines().filter(|l| l.contains(key)) {
            if let Some(caps) = re.captures(line) {
                return Some(caps[1].to_string());
            }
        }
    }
    None
}
