use rig::completion::{AssistantContent, CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::gemini;
use serde_json::json;
use snafu::{ResultExt, ensure};

use super::model::DEFAULT_GEMINI_MODEL;
use super::provider::{
    BoxFuture, ChatSession, ChatTurn, CompletionsFailedSnafu, EmptyPromptSnafu, EmptyReplySnafu,
    HttpClientSnafu, MissingApiKeySnafu, ProviderConfig, ProviderResult, RequestTimedOutSnafu,
    Role,
};

pub const RIG_GEMINI_PROVIDER_ID: &str = "gemini";

type GeminiModel = <gemini::Client as CompletionClient>::CompletionModel;

/// Chat session backed by rig's Gemini completion model.
pub struct RigChatSession {
    config: ProviderConfig,
    model: GeminiModel,
}

impl RigChatSession {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-session-new",
                provider_id: config.provider_id.clone(),
            }
        );
        config.generation.validate()?;

        let client = Self::build_client(&config)?;
        let model_id = if config.model_id.is_empty() {
            DEFAULT_GEMINI_MODEL.to_string()
        } else {
            config.model_id.clone()
        };
        let model = client.completion_model(model_id.clone());

        Ok(Self {
            config: ProviderConfig { model_id, ..config },
            model,
        })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(config.api_key.as_str());
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn to_rig_message(turn: &ChatTurn) -> RigMessage {
        match turn.role {
            Role::User => RigMessage::user(turn.text.clone()),
            Role::Model => RigMessage::assistant(turn.text.clone()),
        }
    }

    fn reply_text(choice: impl IntoIterator<Item = AssistantContent>) -> String {
        choice
            .into_iter()
            .filter_map(|content| match content {
                AssistantContent::Text(text) => Some(text.text),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    async fn complete(
        config: ProviderConfig,
        model: GeminiModel,
        prompt: String,
        history: Vec<ChatTurn>,
    ) -> ProviderResult<String> {
        ensure!(
            !prompt.trim().is_empty(),
            EmptyPromptSnafu {
                stage: "complete-validate-prompt",
            }
        );

        let history_len = history.len();
        let messages = history.iter().map(Self::to_rig_message).collect::<Vec<_>>();
        let generation = config.generation;

        let request = model
            .completion_request(RigMessage::user(prompt))
            .messages(messages)
            .temperature(generation.temperature)
            .max_tokens(generation.max_output_tokens)
            .additional_params(json!({
                "generationConfig": {
                    "topK": generation.top_k,
                    "topP": generation.top_p,
                }
            }));

        tracing::debug!(
            model_id = %config.model_id,
            history_len,
            "sending chat request"
        );

        let response = match tokio::time::timeout(config.request_timeout, request.send()).await {
            Ok(response) => response.context(CompletionsFailedSnafu {
                stage: "complete-send",
            })?,
            Err(_) => {
                tracing::warn!(
                    model_id = %config.model_id,
                    timeout_ms = config.request_timeout.as_millis(),
                    "chat request timed out"
                );
                return RequestTimedOutSnafu {
                    stage: "complete-timeout",
                    timeout_ms: config.request_timeout.as_millis(),
                }
                .fail();
            }
        };

        let text = Self::reply_text(response.choice);
        ensure!(
            !text.trim().is_empty(),
            EmptyReplySnafu {
                stage: "complete-extract-text",
            }
        );
        Ok(text)
    }
}

impl ChatSession for RigChatSession {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn send(
        &self,
        prompt: String,
        history: Vec<ChatTurn>,
    ) -> BoxFuture<'static, ProviderResult<String>> {
        Box::pin(Self::complete(
            self.config.clone(),
            self.model.clone(),
            prompt,
            history,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{GenerationConfig, ProviderError};

    #[test]
    fn session_requires_api_key() {
        let config = ProviderConfig::new(RIG_GEMINI_PROVIDER_ID, "  ", DEFAULT_GEMINI_MODEL);
        let error = RigChatSession::new(config).err().unwrap();
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));
    }

    #[test]
    fn session_rejects_invalid_generation_config() {
        let config = ProviderConfig::new(RIG_GEMINI_PROVIDER_ID, "key", DEFAULT_GEMINI_MODEL)
            .with_generation(GenerationConfig {
                top_k: 0,
                ..GenerationConfig::default()
            });
        let error = RigChatSession::new(config).err().unwrap();
        assert!(matches!(error, ProviderError::InvalidGenerationConfig { .. }));
    }

    #[test]
    fn blank_model_id_uses_default_model() {
        let session =
            RigChatSession::new(ProviderConfig::new(RIG_GEMINI_PROVIDER_ID, "key", "")).unwrap();
        assert_eq!(session.model_id(), DEFAULT_GEMINI_MODEL);
        assert_eq!(session.id(), RIG_GEMINI_PROVIDER_ID);
    }

    #[tokio::test]
    async fn blank_prompt_is_rejected_before_any_request() {
        let session =
            RigChatSession::new(ProviderConfig::new(RIG_GEMINI_PROVIDER_ID, "key", "")).unwrap();
        let error = session.send("   ".to_string(), Vec::new()).await.unwrap_err();
        assert!(matches!(error, ProviderError::EmptyPrompt { .. }));
    }

    #[test]
    fn history_roles_map_to_rig_messages() {
        let user = RigChatSession::to_rig_message(&ChatTurn::user("hi"));
        let model = RigChatSession::to_rig_message(&ChatTurn::model("hello"));
        assert!(matches!(user, RigMessage::User { .. }));
        assert!(matches!(model, RigMessage::Assistant { .. }));
    }
}
