//! Provider factory for creating model instances from configuration.
//!
//! Creates `LanguageModel` instances based on configuration, loading API keys
//! from environment variables when they are not supplied explicitly.

use crate::{ClaudeProvider, MockProvider, OpenAiProvider};
use cadre_abstraction::{LanguageModel, ModelError};
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Provider kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Mock provider for testing.
    Mock,
    /// Anthropic Claude models.
    Anthropic,
    /// OpenAI's hosted API.
    OpenAi,
    /// Any OpenAI-compatible server (vLLM, LocalAI, LM Studio, Ollama).
    OpenAiCompatible,
}

impl FromStr for ProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mock" => Ok(Self::Mock),
            "anthropic" | "claude" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "openai-compatible" | "local" | "ollama" => Ok(Self::OpenAiCompatible),
            _ => Err(()),
        }
    }
}

/// Configuration for one model backend.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// The provider kind.
    pub kind: ProviderKind,
    /// The model ID (e.g., "claude-sonnet-4-5", "gpt-4o").
    pub model_id: String,
    /// Optional API key (if not provided, loaded from the environment).
    pub api_key: Option<String>,
    /// Optional base URL (required for OpenAI-compatible servers).
    pub base_url: Option<String>,
}

impl ProviderConfig {
    /// Creates a new `ProviderConfig` with the given kind and model ID.
    #[must_use]
    pub fn new(kind: ProviderKind, model_id: impl Into<String>) -> Self {
        Self { kind, model_id: model_id.into(), api_key: None, base_url: None }
    }

    /// Sets the API key for this configuration.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the base URL for this configuration.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// Factory for creating provider instances.
pub struct ProviderFactory;

impl ProviderFactory {
    /// Creates a provider instance from the given configuration.
    ///
    /// # Errors
    /// Returns a `ModelError` if creation fails (e.g., missing API key or
    /// base URL).
    pub fn create(config: &ProviderConfig) -> Result<Arc<dyn LanguageModel>, ModelError> {
        debug!(
            kind = ?config.kind,
            model_id = %config.model_id,
            "Creating provider instance"
        );

        match config.kind {
            ProviderKind::Mock => Ok(Arc::new(MockProvider::new(config.model_id.clone()))),
            ProviderKind::Anthropic => {
                let api_key = Self::resolve_key(config, "ANTHROPIC_API_KEY")?;
                let mut provider = ClaudeProvider::new(config.model_id.clone(), api_key);
                if let Some(ref base_url) = config.base_url {
                    provider = provider.with_base_url(base_url.clone());
                }
                Ok(Arc::new(provider))
            }
            ProviderKind::OpenAi => {
                let api_key = Self::resolve_key(config, "OPENAI_API_KEY")?;
                let base_url =
                    config.base_url.clone().unwrap_or_else(|| OPENAI_BASE_URL.to_string());
                Ok(Arc::new(OpenAiProvider::new(config.model_id.clone(), base_url, api_key)))
            }
            ProviderKind::OpenAiCompatible => {
                let base_url = config.base_url.clone().ok_or_else(|| {
                    ModelError::UnsupportedProvider(
                        "base_url is required for OpenAI-compatible providers. Use ProviderConfig::with_base_url() to set it.".to_string(),
                    )
                })?;
                let provider = match config.api_key.clone() {
                    Some(api_key) => {
                        OpenAiProvider::new(config.model_id.clone(), base_url, api_key)
                    }
                    None => OpenAiProvider::without_auth(config.model_id.clone(), base_url),
                };
                Ok(Arc::new(provider))
            }
        }
    }

    fn resolve_key(config: &ProviderConfig, env_var: &str) -> Result<String, ModelError> {
        if let Some(ref key) = config.api_key {
            return Ok(key.clone());
        }
        env::var(env_var).map_err(|_| {
            error!(env_var = %env_var, "API key not configured");
            ModelError::UnsupportedProvider(format!(
                "{} environment variable not set and no api_key configured",
                env_var
            ))
        })
    }

    /// Creates a provider from a kind string and model ID.
    ///
    /// # Errors
    /// Returns a `ModelError` if the kind is unrecognized or creation fails.
    pub fn create_from_str(
        kind_str: &str,
        model_id: impl Into<String>,
    ) -> Result<Arc<dyn LanguageModel>, ModelError> {
        let kind = ProviderKind::from_str(kind_str).map_err(|()| {
            error!(kind = %kind_str, "Unrecognized provider kind");
            ModelError::UnsupportedProvider(format!("Unrecognized provider kind: {}", kind_str))
        })?;
        Self::create(&ProviderConfig::new(kind, model_id))
    }
}
