use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

/// One prior turn handed to the model as history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Role::Model, text)
    }
}

/// Sampling options sent with every request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub max_output_tokens: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 40,
            top_p: 0.95,
            max_output_tokens: 8192,
        }
    }
}

impl GenerationConfig {
    pub fn new(
        temperature: f64,
        top_k: u32,
        top_p: f64,
        max_output_tokens: u64,
    ) -> ProviderResult<Self> {
        let config = Self {
            temperature,
            top_k,
            top_p,
            max_output_tokens,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ProviderResult<()> {
        ensure!(
            (0.0..=2.0).contains(&self.temperature),
            InvalidGenerationConfigSnafu {
                stage: "generation-config-temperature",
                details: format!("temperature must be within 0..=2, got {}", self.temperature),
            }
        );
        ensure!(
            self.top_k >= 1,
            InvalidGenerationConfigSnafu {
                stage: "generation-config-top-k",
                details: "top_k must be at least 1".to_string(),
            }
        );
        ensure!(
            self.top_p > 0.0 && self.top_p <= 1.0,
            InvalidGenerationConfigSnafu {
                stage: "generation-config-top-p",
                details: format!("top_p must be within (0, 1], got {}", self.top_p),
            }
        );
        ensure!(
            self.max_output_tokens >= 1,
            InvalidGenerationConfigSnafu {
                stage: "generation-config-max-output-tokens",
                details: "max_output_tokens must be at least 1".to_string(),
            }
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    /// Empty means the provider's public endpoint.
    pub endpoint: String,
    pub model_id: String,
    pub generation: GenerationConfig,
    pub request_timeout: Duration,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: String::new(),
            model_id: model_id.into().trim().to_string(),
            generation: GenerationConfig::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim().to_string();
        self
    }

    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("invalid generation config: {details}"))]
    InvalidGenerationConfig {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("prompt is empty"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("request timed out after {timeout_ms} ms"))]
    RequestTimedOut { stage: &'static str, timeout_ms: u128 },
    #[snafu(display("model returned no text"))]
    EmptyReply { stage: &'static str },
}

impl ProviderError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::MissingApiKey { stage, .. }
            | Self::UnsupportedProvider { stage, .. }
            | Self::InvalidGenerationConfig { stage, .. }
            | Self::EmptyPrompt { stage }
            | Self::HttpClient { stage, .. }
            | Self::CompletionsFailed { stage, .. }
            | Self::RequestTimedOut { stage, .. }
            | Self::EmptyReply { stage } => stage,
        }
    }
}

/// Request/response conversation with a generative model.
///
/// `send` owns its arguments and returns a `'static` future so callers can
/// await it without holding any borrow of the session or of their own state.
pub trait ChatSession: Send + Sync {
    fn id(&self) -> &str;
    fn model_id(&self) -> &str;
    fn send(
        &self,
        prompt: String,
        history: Vec<ChatTurn>,
    ) -> BoxFuture<'static, ProviderResult<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_generation_config_is_valid() {
        let config = GenerationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.top_k, 40);
        assert_eq!(config.max_output_tokens, 8192);
    }

    #[test]
    fn out_of_range_generation_options_are_rejected() {
        for result in [
            GenerationConfig::new(2.5, 40, 0.95, 8192),
            GenerationConfig::new(1.0, 0, 0.95, 8192),
            GenerationConfig::new(1.0, 40, 0.0, 8192),
            GenerationConfig::new(1.0, 40, 1.5, 8192),
            GenerationConfig::new(1.0, 40, 0.95, 0),
        ] {
            let error = result.unwrap_err();
            assert!(matches!(
                error,
                ProviderError::InvalidGenerationConfig { .. }
            ));
        }
    }

    #[test]
    fn partial_generation_config_fills_defaults() {
        let config: GenerationConfig = serde_json::from_str(r#"{"temperature":0.2}"#).unwrap();
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.top_p, 0.95);
    }
}
