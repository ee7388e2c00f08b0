use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, LlmConfig};
use crate::errors::{DroidClawError, DroidClawResult};
use crate::llm::provider::LlmProvider;
use crate::llm::providers::openai_compatible::OpenAiCompatibleProvider;
use crate::llm::types::CallConfig;

/// Agent roles that can be mapped to a provider + model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    /// Screen reading and action selection.
    Vision,
    /// Notes summarization for `call_api`.
    Summary,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Vision => "vision",
            AgentRole::Summary => "summary",
        }
    }
}

/// Registry of all available LLM providers, keyed by their config.toml identifier.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    active: String,
    /// Kept for role-to-model lookups (does not need to be mutable after init).
    llm_config: LlmConfig,
}

impl ProviderRegistry {
    pub fn new(active: String, llm_config: LlmConfig) -> Self {
        Self {
            providers: HashMap::new(),
            active,
            llm_config,
        }
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get_active(&self) -> DroidClawResult<Arc<dyn LlmProvider>> {
        self.providers
            .get(&self.active)
            .cloned()
            .ok_or_else(|| DroidClawError::Config(format!("Active provider '{}' not found in registry", self.active)))
    }

    pub fn list_names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    /// Return the provider and call configuration for an agent role.
    ///
    /// Role resolution order:
    /// 1. `[llm.roles.<role>]` in config.toml
    /// 2. Fallback: active provider with its default model / temperature, non-streaming
    pub fn call_config_for_role(&self, role: AgentRole) -> DroidClawResult<(Arc<dyn LlmProvider>, CallConfig)> {
        let role_entry = match role {
            AgentRole::Vision => self.llm_config.roles.vision.as_ref(),
            AgentRole::Summary => self.llm_config.roles.summary.as_ref(),
        };

        if let Some(entry) = role_entry {
            let provider = self.providers.get(&entry.provider).cloned().ok_or_else(|| {
                DroidClawError::Config(format!(
                    "Role '{}' references unknown provider '{}'",
                    role.as_str(),
                    entry.provider
                ))
            })?;
            let temperature = entry.temperature.unwrap_or_else(|| {
                self.llm_config
                    .providers
                    .get(&entry.provider)
                    .map(|p| p.temperature)
                    .unwrap_or(0.1)
            });
            tracing::debug!(
                role = role.as_str(),
                provider = %entry.provider,
                model = %entry.model,
                stream = entry.stream,
                temperature = temperature,
                "resolved role config"
            );
            return Ok((provider, CallConfig {
                model: entry.model.clone(),
                stream: entry.stream,
                temperature,
            }));
        }

        // Fallback: active provider, provider-level defaults
        let provider = self.get_active()?;
        let entry = self.llm_config.providers.get(&self.active);
        let (model, temperature) = entry
            .map(|p| (p.model.clone(), p.temperature))
            .unwrap_or_else(|| (String::new(), 0.1));
        tracing::debug!(
            role = role.as_str(),
            provider = %self.active,
            model = %model,
            "role not configured, using active provider fallback"
        );
        Ok((provider, CallConfig { model, stream: false, temperature }))
    }

    /// Build a registry from the loaded app config.
    /// API keys are read from environment variables named `DROIDCLAW_<ID>_API_KEY`.
    pub fn from_config(config: &AppConfig) -> DroidClawResult<Self> {
        let mut registry = Self::new(config.llm.active_provider.clone(), config.llm.clone());
        for (id, entry) in &config.llm.providers {
            let api_key = std::env::var(format!("DROIDCLAW_{}_API_KEY", id.to_uppercase()))
                .unwrap_or_else(|_| entry.api_key.clone().unwrap_or_default());
            if api_key.is_empty() {
                tracing::warn!(provider = %id, "no API key configured");
            }
            let provider = OpenAiCompatibleProvider::new(
                id.clone(),
                entry.api_base.clone(),
                api_key,
                Duration::from_secs(entry.request_timeout_secs),
            )?;
            registry.register(Arc::new(provider));
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    const CONFIG: &str = r#"
[llm]
active_provider = "main"

[llm.providers.main]
display_name = "Main"
api_base = "http://127.0.0.1:9/v1/chat/completions"
model = "autoglm-phone"
temperature = 0.2

[llm.providers.cheap]
display_name = "Cheap"
api_base = "http://127.0.0.1:9/v1/chat/completions"
model = "small"

[llm.roles.summary]
provider = "cheap"
model = "small-summarizer"
stream = true
"#;

    #[test]
    fn unconfigured_role_falls_back_to_active_provider() {
        let registry = ProviderRegistry::from_config(&parse_config(CONFIG).unwrap()).unwrap();
        let (provider, cfg) = registry.call_config_for_role(AgentRole::Vision).unwrap();
        assert_eq!(provider.name(), "main");
        assert_eq!(cfg.model, "autoglm-phone");
        assert_eq!(cfg.temperature, 0.2);
        assert!(!cfg.stream);
    }

    #[test]
    fn configured_role_uses_its_provider() {
        let registry = ProviderRegistry::from_config(&parse_config(CONFIG).unwrap()).unwrap();
        let (provider, cfg) = registry.call_config_for_role(AgentRole::Summary).unwrap();
        assert_eq!(provider.name(), "cheap");
        assert_eq!(cfg.model, "small-summarizer");
        assert_eq!(cfg.temperature, 0.1);
        assert!(cfg.stream);
    }

    #[test]
    fn empty_registry_reports_missing_provider() {
        let registry = ProviderRegistry::new("nope".into(), LlmConfig::default());
        assert!(registry.call_config_for_role(AgentRole::Vision).is_err());
        assert!(registry.list_names().is_empty());
    }
}
