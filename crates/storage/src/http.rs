use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use super::error::{
    BuildHttpClientSnafu, NotFoundSnafu, StorageResult, StoreUnreachableSnafu, ValidationSnafu,
};
use super::ids::ConversationId;
use super::types::{NewTranscript, Transcript, TranscriptPatch, TranscriptSummary};
use super::{BoxFuture, DocumentStore};

const STORE_NAME: &str = "http";

/// Client for the conversation REST service.
///
/// Every response body is an envelope `{ success, data | error }`. Transport
/// failures, timeouts, 5xx answers and unreadable bodies all count as the store
/// being unreachable; 404 is absence and other 4xx answers are validation errors.
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default = "Option::default")]
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpDocumentStore {
    /// `base_url` is the API root the `/conversations` routes hang off,
    /// e.g. `http://localhost:5000/api`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> StorageResult<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context(BuildHttpClientSnafu {
                stage: "http-store-build-client",
                base_url: base_url.clone(),
            })?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self) -> String {
        format!("{}/conversations", self.base_url)
    }

    fn record_url(&self, id: &ConversationId) -> String {
        format!("{}/conversations/{id}", self.base_url)
    }

    /// Sends one request and unwraps the envelope; `Ok(None)` on 404.
    async fn exchange<T: DeserializeOwned>(
        &self,
        stage: &'static str,
        request: RequestBuilder,
    ) -> StorageResult<Option<T>> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                return StoreUnreachableSnafu {
                    stage,
                    store: STORE_NAME,
                    details: error.to_string(),
                }
                .fail();
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(error) => {
                return StoreUnreachableSnafu {
                    stage,
                    store: STORE_NAME,
                    details: error.to_string(),
                }
                .fail();
            }
        };

        if status.is_server_error() {
            return StoreUnreachableSnafu {
                stage,
                store: STORE_NAME,
                details: format!("status {}: {}", status.as_u16(), envelope_error(&body)),
            }
            .fail();
        }

        if status.is_client_error() {
            return ValidationSnafu {
                stage,
                details: envelope_error(&body),
            }
            .fail();
        }

        let envelope = match serde_json::from_str::<Envelope<T>>(&body) {
            Ok(envelope) => envelope,
            Err(error) => {
                return StoreUnreachableSnafu {
                    stage,
                    store: STORE_NAME,
                    details: format!("malformed response body: {error}"),
                }
                .fail();
            }
        };

        if !envelope.success {
            return ValidationSnafu {
                stage,
                details: envelope
                    .error
                    .unwrap_or_else(|| "request was rejected".to_string()),
            }
            .fail();
        }

        Ok(envelope.data)
    }
}

impl DocumentStore for HttpDocumentStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    fn list<'a>(
        &'a self,
        owner_id: Option<&'a str>,
    ) -> BoxFuture<'a, StorageResult<Vec<TranscriptSummary>>> {
        Box::pin(async move {
            let mut request = self.client.get(self.collection_url());
            if let Some(owner_id) = owner_id {
                request = request.query(&[("userId", owner_id)]);
            }
            let summaries = self
                .exchange::<Vec<TranscriptSummary>>("http-list", request)
                .await?;
            Ok(summaries.unwrap_or_default())
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<Transcript>>> {
        Box::pin(async move {
            let request = self.client.get(self.record_url(id));
            self.exchange("http-get", request).await
        })
    }

    fn create<'a>(&'a self, input: NewTranscript) -> BoxFuture<'a, StorageResult<Transcript>> {
        Box::pin(async move {
            let request = self.client.post(self.collection_url()).json(&input);
            match self.exchange::<Transcript>("http-create", request).await? {
                Some(created) => Ok(created),
                None => StoreUnreachableSnafu {
                    stage: "http-create-missing-route",
                    store: STORE_NAME,
                    details: "create route answered 404",
                }
                .fail(),
            }
        })
    }

    fn update<'a>(
        &'a self,
        id: &'a ConversationId,
        patch: TranscriptPatch,
    ) -> BoxFuture<'a, StorageResult<Transcript>> {
        Box::pin(async move {
            let request = self.client.put(self.record_url(id)).json(&patch);
            match self.exchange::<Transcript>("http-update", request).await? {
                Some(updated) => Ok(updated),
                None => NotFoundSnafu {
                    stage: "http-update-missing",
                    entity: "conversation",
                    id: id.to_string(),
                }
                .fail(),
            }
        })
    }

    fn delete<'a>(&'a self, id: &'a ConversationId) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let request = self.client.delete(self.record_url(id));
            let deleted = self
                .exchange::<serde_json::Value>("http-delete", request)
                .await?;
            Ok(deleted.is_some())
        })
    }
}

fn envelope_error(body: &str) -> String {
    serde_json::from_str::<Envelope<serde_json::Value>>(body)
        .ok()
        .and_then(|envelope| envelope.error)
        .unwrap_or_else(|| body.chars().take(200).collect())
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::http::{StatusCode as ServedStatus, header};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;

    use super::*;

    fn reply(status: ServedStatus, body: &'static str) -> Response {
        (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
    }

    /// Serves `router` on an ephemeral port and points a store at its `/api` root.
    async fn store_for(router: Router) -> HttpDocumentStore {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        HttpDocumentStore::new(format!("http://{address}/api"), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn failing_answers_map_to_the_storage_taxonomy() {
        let router = Router::new()
            .route(
                "/api/conversations",
                get(|| async {
                    reply(
                        ServedStatus::INTERNAL_SERVER_ERROR,
                        r#"{"success":false,"error":"Internal server error"}"#,
                    )
                })
                .post(|| async {
                    reply(
                        ServedStatus::BAD_REQUEST,
                        r#"{"success":false,"error":"messages must be an array"}"#,
                    )
                }),
            )
            .route(
                "/api/conversations/{id}",
                get(|| async { reply(ServedStatus::OK, "<html>gateway page</html>") })
                    .put(|| async {
                        reply(
                            ServedStatus::NOT_FOUND,
                            r#"{"success":false,"error":"Conversation not found"}"#,
                        )
                    })
                    .delete(|| async {
                        reply(ServedStatus::OK, r#"{"success":false,"error":"locked"}"#)
                    }),
            );
        let store = store_for(router).await;
        let id = ConversationId::new_v7();

        let error = store.list(None).await.unwrap_err();
        assert!(error.is_unreachable(), "5xx: {error}");

        let error = store
            .create(NewTranscript {
                title: String::new(),
                messages: Vec::new(),
                owner_id: None,
            })
            .await
            .unwrap_err();
        assert!(error.is_validation(), "4xx: {error}");
        assert!(error.to_string().contains("messages must be an array"));

        let error = store.get(&id).await.unwrap_err();
        assert!(error.is_unreachable(), "malformed body: {error}");

        let error = store
            .update(&id, TranscriptPatch::default())
            .await
            .unwrap_err();
        assert!(error.is_not_found(), "404 on update: {error}");

        let error = store.delete(&id).await.unwrap_err();
        assert!(error.is_validation(), "success false: {error}");
        assert!(error.to_string().contains("locked"));
    }

    #[tokio::test]
    async fn missing_records_read_as_absent() {
        let router = Router::new()
            .route(
                "/api/conversations",
                get(|| async { reply(ServedStatus::OK, r#"{"success":true,"data":[]}"#) }),
            )
            .route(
                "/api/conversations/{id}",
                get(|| async {
                    reply(
                        ServedStatus::NOT_FOUND,
                        r#"{"success":false,"error":"Conversation not found"}"#,
                    )
                })
                .delete(|| async {
                    reply(
                        ServedStatus::NOT_FOUND,
                        r#"{"success":false,"error":"Conversation not found"}"#,
                    )
                }),
            );
        let store = store_for(router).await;
        let id = ConversationId::new_v7();

        assert!(store.list(Some("anonymous")).await.unwrap().is_empty());
        assert_eq!(store.get(&id).await.unwrap(), None);
        assert!(!store.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn refused_connection_counts_as_unreachable() {
        // Nothing listens on port 9 (discard) in the test environment.
        let store =
            HttpDocumentStore::new("http://127.0.0.1:9/api/", Duration::from_millis(500)).unwrap();
        assert_eq!(store.base_url(), "http://127.0.0.1:9/api");

        let error = store.list(Some("anonymous")).await.unwrap_err();
        assert!(error.is_unreachable(), "unexpected error: {error}");
    }

    #[test]
    fn envelope_error_prefers_the_error_field() {
        assert_eq!(
            envelope_error(r#"{"success":false,"error":"Conversation not found"}"#),
            "Conversation not found"
        );
        assert_eq!(envelope_error("plain failure"), "plain failure");
    }
}
