//! App-name resolution for `launch` and for the screen-info block.
use std::collections::HashMap;

/// Maps human-readable app names to platform package ids and back.
pub trait AppResolver: Send + Sync {
    fn package_for(&self, name: &str) -> Option<String>;
    fn name_for(&self, package: &str) -> Option<String>;
}

/// Static table lookup: exact match first, then case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct AppTable {
    entries: HashMap<String, String>,
}

impl AppTable {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }
}

impl AppResolver for AppTable {
    fn package_for(&self, name: &str) -> Option<String> {
        let name = name.trim();
        if let Some(pkg) = self.entries.get(name) {
            return Some(pkg.clone());
        }
        let wanted = name.to_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| k.to_lowercase() == wanted)
            .map(|(_, v)| v.clone())
    }

    fn name_for(&self, package: &str) -> Option<String> {
        // Several names may share a package; pick the shortest so the result is stable.
        self.entries
            .iter()
            .filter(|(_, v)| v.as_str() == package)
            .map(|(k, _)| k)
            .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
            .cloned()
    }
}
