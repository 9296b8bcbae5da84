use std::sync::Arc;

use bestie_llm::{ChatSession, ProviderError, ProviderResult, create_session, is_known_gemini_model};
use bestie_storage::{
    DocumentStore, HttpDocumentStore, InMemoryDocumentStore, LocalFallbackStore,
    PersistenceGateway, StorageResult,
};

use super::settings::AppSettings;

/// Primary store named by the settings: the REST service, or process memory
/// when no URL is configured.
pub fn primary_store(settings: &AppSettings) -> StorageResult<Arc<dyn DocumentStore>> {
    if settings.store_url.is_empty() {
        tracing::info!("no conversation store configured; keeping conversations in memory");
        return Ok(Arc::new(InMemoryDocumentStore::new()));
    }

    let store = HttpDocumentStore::new(&settings.store_url, settings.store_timeout())?;
    tracing::debug!(base_url = store.base_url(), "using conversation REST store");
    Ok(Arc::new(store))
}

pub fn gateway(settings: &AppSettings) -> StorageResult<Arc<PersistenceGateway>> {
    let primary = primary_store(settings)?;
    let fallback = LocalFallbackStore::open(settings.fallback_path());
    tracing::debug!(
        primary = primary.name(),
        fallback = %fallback.path().display(),
        "persistence gateway ready"
    );
    Ok(Arc::new(PersistenceGateway::new(primary, fallback)))
}

pub fn chat_session(settings: &AppSettings) -> ProviderResult<Arc<dyn ChatSession>> {
    let config = settings
        .provider
        .to_provider_config()
        .ok_or_else(|| ProviderError::MissingApiKey {
            stage: "app-chat-session",
            provider_id: settings.provider.provider_id.clone(),
        })?;

    if !is_known_gemini_model(&config.model_id) {
        tracing::warn!(model_id = %config.model_id, "model is not in the built-in list");
    }
    create_session(config)
}
