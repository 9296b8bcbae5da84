use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;

pub use model::{DEFAULT_GEMINI_MODEL, Model, default_gemini_models, is_known_gemini_model};
pub use provider::{
    BoxFuture, ChatSession, ChatTurn, DEFAULT_REQUEST_TIMEOUT, GenerationConfig, ProviderConfig,
    ProviderError, ProviderResult, Role,
};
pub use rig_adapter::{RIG_GEMINI_PROVIDER_ID, RigChatSession};

pub fn create_session(mut config: ProviderConfig) -> ProviderResult<Arc<dyn ChatSession>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_GEMINI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "gemini" | "google" | "rig-gemini" => {
            config.provider_id = RIG_GEMINI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigChatSession::new(config)?))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-session",
            provider_id: config.provider_id,
        }),
    }
}
