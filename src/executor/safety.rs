// Human-in-the-loop gates and the device shell allow-list.
use async_trait::async_trait;

use crate::agent_engine::state::{Command, Verb};

/// The human side of sensitive actions and hand-offs.
///
/// Implementations block until the user answers. Callers race them against
/// task cancellation, so an implementation never needs its own timeout.
#[async_trait]
pub trait HumanGate: Send + Sync {
    /// Asks the user to approve a sensitive action. `false` declines.
    async fn confirm(&self, message: &str) -> bool;

    /// Hands the device to the user; returns once they hand it back.
    async fn take_over(&self, message: &str);

    /// Asks the user to choose; the reply, if any, is fed back to the model.
    async fn interact(&self, message: &str) -> Option<String>;
}

/// Gate that approves everything and never waits. Used for unattended runs.
pub struct AutoApprove;

#[async_trait]
impl HumanGate for AutoApprove {
    async fn confirm(&self, message: &str) -> bool {
        tracing::info!(prompt = message, "sensitive action auto-approved");
        true
    }

    async fn take_over(&self, message: &str) {
        tracing::warn!(prompt = message, "take-over requested in unattended mode, continuing");
    }

    async fn interact(&self, message: &str) -> Option<String> {
        tracing::warn!(prompt = message, "interaction requested in unattended mode, no reply");
        None
    }
}

pub const DEFAULT_CONFIRM_MESSAGE: &str = "confirm this sensitive action";

/// The confirmation prompt for a command, if it needs one.
/// Any tap carrying a `message` argument is gated, even an empty one.
pub fn sensitive_message(command: &Command) -> Option<&str> {
    match (&command.verb, command.message.as_deref()) {
        (Verb::Tap, Some(m)) if m.trim().is_empty() => Some(DEFAULT_CONFIRM_MESSAGE),
        (Verb::Tap, Some(m)) => Some(m),
        _ => None,
    }
}

const SHELL_METACHARACTERS: &[&str] = &[";", "&", "|", "`", "$(", ">", "<", "\n"];

/// Whether `command` may be sent to the device shell.
pub fn is_allowed_shell_command(command: &str, allowed_prefixes: &[String]) -> bool {
    let command = command.trim_start();
    if SHELL_METACHARACTERS.iter().any(|m| command.contains(m)) {
        return false;
    }
    allowed_prefixes
        .iter()
        .any(|prefix| command.starts_with(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    #[test]
    fn allow_list_checks_prefix_and_chaining() {
        let prefixes = DeviceConfig::default().allowed_shell_prefixes;
        assert!(is_allowed_shell_command("input tap 540 1200", &prefixes));
        assert!(is_allowed_shell_command("ime set com.android.adbkeyboard/.AdbIME", &prefixes));
        assert!(is_allowed_shell_command("dumpsys window", &prefixes));

        assert!(!is_allowed_shell_command("rm -rf /sdcard", &prefixes));
        assert!(!is_allowed_shell_command("input tap 1 1; reboot", &prefixes));
        assert!(!is_allowed_shell_command("input text $(cat /data/x)", &prefixes));
        assert!(!is_allowed_shell_command("am start x && reboot", &prefixes));
        assert!(!is_allowed_shell_command("settings put global x 1", &prefixes));
    }

    #[test]
    fn only_messaged_taps_are_sensitive() {
        let mut tap = Command::new(Verb::Tap);
        assert_eq!(sensitive_message(&tap), None);
        tap.message = Some("Pay 30 yuan".into());
        assert_eq!(sensitive_message(&tap), Some("Pay 30 yuan"));
        tap.message = Some("  ".into());
        assert_eq!(sensitive_message(&tap), Some(DEFAULT_CONFIRM_MESSAGE));
        tap.message = Some(String::new());
        assert_eq!(sensitive_message(&tap), Some(DEFAULT_CONFIRM_MESSAGE));

        let mut back = Command::new(Verb::Back);
        back.message = Some("x".into());
        assert_eq!(sensitive_message(&back), None);
    }
}
