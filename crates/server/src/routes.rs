use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use bestie_storage::{
    ConversationId, DocumentStore, NewTranscript, Transcript, TranscriptPatch, TranscriptSummary,
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::envelope::Envelope;
use super::error::{ServerError, ServerResult};

pub type SharedStore = Arc<dyn DocumentStore>;

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// Conversation routes, mounted under `/api`.
pub fn router(store: SharedStore) -> Router {
    let conversations = Router::new()
        .route(
            "/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/conversations/{id}",
            get(get_conversation)
                .put(update_conversation)
                .delete(delete_conversation),
        );

    Router::new()
        .nest("/api", conversations)
        .fallback(route_not_found)
        .with_state(store)
}

async fn list_conversations(
    State(store): State<SharedStore>,
    Query(params): Query<ListParams>,
) -> ServerResult<Json<Envelope<Vec<TranscriptSummary>>>> {
    let owner_id = params
        .user_id
        .as_deref()
        .map(str::trim)
        .filter(|owner| !owner.is_empty());
    let summaries = store
        .list(owner_id)
        .await
        .map_err(|error| ServerError::from_storage("route-list", error))?;

    tracing::debug!(
        owner_id = owner_id.unwrap_or("*"),
        count = summaries.len(),
        "listed conversations"
    );
    Ok(Json(Envelope::ok(summaries)))
}

async fn get_conversation(
    State(store): State<SharedStore>,
    Path(raw_id): Path<String>,
) -> ServerResult<Json<Envelope<Transcript>>> {
    let id = parse_id("route-get", &raw_id)?;
    match store
        .get(&id)
        .await
        .map_err(|error| ServerError::from_storage("route-get", error))?
    {
        Some(transcript) => Ok(Json(Envelope::ok(transcript))),
        None => Err(ServerError::NotFound {
            stage: "route-get-missing",
            id: raw_id,
        }),
    }
}

async fn create_conversation(
    State(store): State<SharedStore>,
    payload: Result<Json<NewTranscript>, JsonRejection>,
) -> ServerResult<(StatusCode, Json<Envelope<Transcript>>)> {
    let Json(input) = payload.map_err(|rejection| ServerError::BadRequest {
        stage: "route-create-body",
        details: rejection.body_text(),
    })?;

    let created = store
        .create(input)
        .await
        .map_err(|error| ServerError::from_storage("route-create", error))?;

    tracing::info!(
        id = %created.id().map(ToString::to_string).unwrap_or_default(),
        owner_id = created.owner_id(),
        "created conversation"
    );
    Ok((StatusCode::CREATED, Json(Envelope::ok(created))))
}

async fn update_conversation(
    State(store): State<SharedStore>,
    Path(raw_id): Path<String>,
    payload: Result<Json<TranscriptPatch>, JsonRejection>,
) -> ServerResult<Json<Envelope<Transcript>>> {
    let id = parse_id("route-update", &raw_id)?;
    let Json(patch) = payload.map_err(|rejection| ServerError::BadRequest {
        stage: "route-update-body",
        details: rejection.body_text(),
    })?;

    let updated = store
        .update(&id, patch)
        .await
        .map_err(|error| ServerError::from_storage("route-update", error))?;
    Ok(Json(Envelope::ok(updated)))
}

async fn delete_conversation(
    State(store): State<SharedStore>,
    Path(raw_id): Path<String>,
) -> ServerResult<Json<Envelope<Value>>> {
    let id = parse_id("route-delete", &raw_id)?;
    let removed = store
        .delete(&id)
        .await
        .map_err(|error| ServerError::from_storage("route-delete", error))?;

    if !removed {
        return Err(ServerError::NotFound {
            stage: "route-delete-missing",
            id: raw_id,
        });
    }

    tracing::info!(id = %id, "deleted conversation");
    Ok(Json(Envelope::ok(json!({ "_id": id }))))
}

async fn route_not_found() -> (StatusCode, Json<Envelope<()>>) {
    (StatusCode::NOT_FOUND, Json(Envelope::failure("Route not found")))
}

fn parse_id(stage: &'static str, raw: &str) -> ServerResult<ConversationId> {
    ConversationId::parse(raw).map_err(|error| ServerError::from_storage(stage, error))
}
