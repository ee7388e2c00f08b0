use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::DroidClawResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: i64,
    pub step: u32,
    pub kind: String,
    pub content: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl HistoryEntry {
    pub fn new(step: u32, kind: &str) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            step,
            kind: kind.to_string(),
            content: None,
            data: None,
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }
}

/// JSONL transcript of one task. A recorder without a file path keeps
/// entries in memory only.
pub struct TaskHistory {
    pub session_id: String,
    entries: Vec<HistoryEntry>,
    file_path: Option<PathBuf>,
}

impl TaskHistory {
    /// Transcript under the platform data directory.
    pub fn persistent(session_id: String) -> Self {
        let file_path = sessions_dir().map(|d| d.join(format!("session_{session_id}.jsonl")));
        Self {
            session_id,
            entries: Vec::new(),
            file_path,
        }
    }

    pub fn in_dir(session_id: String, dir: &Path) -> Self {
        Self {
            file_path: Some(dir.join(format!("session_{session_id}.jsonl"))),
            session_id,
            entries: Vec::new(),
        }
    }

    pub fn in_memory(session_id: String) -> Self {
        Self {
            session_id,
            entries: Vec::new(),
            file_path: None,
        }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Records an entry and appends it to the file; write failures are logged, not raised.
    pub fn record(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, session = %self.session_id, "history flush failed");
        }
    }

    /// Append the latest entry to the JSONL file.
    fn flush(&self) -> DroidClawResult<()> {
        let (Some(path), Some(last)) = (&self.file_path, self.entries.last()) else {
            return Ok(());
        };
        let line = serde_json::to_string(last)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{}", line)?;
        tracing::trace!(path = %path.display(), "history entry flushed");
        Ok(())
    }
}

/// `<data dir>/DroidClaw/sessions`, created on demand.
fn sessions_dir() -> Option<PathBuf> {
    let dir = dirs::data_local_dir()?.join("DroidClaw").join("sessions");
    match std::fs::create_dir_all(&dir) {
        Ok(()) => Some(dir),
        Err(e) => {
            tracing::warn!(error = %e, path = %dir.display(), "cannot create sessions dir, history kept in memory");
            None
        }
    }
}
