//! Provider Registry: name → factory, encapsulated behind a registrar object so tests can
//! build a private registry instead of relying on implicit global init order.
//!
//! A crate-level [`build_provider`] pre-populates the eight built-in provider names the same way
//! the reference crate exposes a single `lazy_static!` shared resource
//! (`SHARED_HTTP_CLIENT`) rather than scattering ad-hoc global state across modules.

use std::collections::HashMap;
use std::sync::Arc;

use lazy_static::lazy_static;

use crate::error::LlmError;
use crate::provider::{Provider, ProviderConfig, ProviderFactory};
use crate::providers::{anthropic, bedrock, compat, gemini, openai};

pub struct ProviderRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ProviderFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn build(&self, name: &str, config: ProviderConfig) -> Result<Arc<dyn Provider>, LlmError> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory(config)),
            None => Err(LlmError::validation(
                format!("no provider registered under name '{}'", name),
                None,
                None,
            )),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    /// Registers the four native providers (openai, anthropic, gemini, bedrock) plus the
    /// four Compat-backed vendor names (deepseek, openrouter, qwen, glm).
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(
            "openai",
            Arc::new(|cfg| Arc::new(openai::OpenAiProvider::new(cfg)) as Arc<dyn Provider>),
        );
        reg.register(
            "anthropic",
            Arc::new(|cfg| Arc::new(anthropic::AnthropicProvider::new(cfg)) as Arc<dyn Provider>),
        );
        reg.register(
            "gemini",
            Arc::new(|cfg| Arc::new(gemini::GeminiProvider::new(cfg)) as Arc<dyn Provider>),
        );
        reg.register(
            "bedrock",
            Arc::new(|cfg| Arc::new(bedrock::BedrockProvider::new(cfg)) as Arc<dyn Provider>),
        );
        reg.register(
            "deepseek",
            Arc::new(|cfg| Arc::new(compat::CompatProvider::deepseek(cfg)) as Arc<dyn Provider>),
        );
        reg.register(
            "openrouter",
            Arc::new(|cfg| Arc::new(compat::CompatProvider::openrouter(cfg)) as Arc<dyn Provider>),
        );
        reg.register(
            "qwen",
            Arc::new(|cfg| Arc::new(compat::CompatProvider::qwen(cfg)) as Arc<dyn Provider>),
        );
        reg.register(
            "glm",
            Arc::new(|cfg| Arc::new(compat::CompatProvider::glm(cfg)) as Arc<dyn Provider>),
        );
        reg
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

lazy_static! {
    static ref DEFAULT_REGISTRY: std::sync::Mutex<ProviderRegistry> =
        std::sync::Mutex::new(ProviderRegistry::with_builtins());
}

/// Builds a provider by name from the process-wide default registry.
pub fn build_provider(name: &str, config: ProviderConfig) -> Result<Arc<dyn Provider>, LlmError> {
    DEFAULT_REGISTRY
        .lock()
        .expect("default provider registry poisoned")
        .build(name, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_all_eight_provider_names() {
        let reg = ProviderRegistry::with_builtins();
        let mut names = reg.names();
        names.sort();
        assert_eq!(
            names,
            vec![
                "anthropic",
                "bedrock",
                "deepseek",
                "gemini",
                "glm",
                "openai",
                "openrouter",
                "qwen",
            ]
        );
    }

    #[test]
    fn unknown_provider_name_errors() {
        let reg = ProviderRegistry::with_builtins();
        let err = reg.build("not-a-real-provider", ProviderConfig::new());
        assert!(err.is_err());
    }
}
