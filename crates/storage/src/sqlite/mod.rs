use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, DecodeDocumentSnafu, EncodeDocumentSnafu, InvariantViolationSnafu,
    NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqliteQuerySnafu, StorageResult,
};
use super::ids::ConversationId;
use super::types::{Message, NewTranscript, Transcript, TranscriptPatch, TranscriptSummary};
use super::{BoxFuture, DocumentStore};

const STORE_NAME: &str = "sqlite";

/// Document store for the `conversations` collection on SQLite.
///
/// Each row is one document; the message list is kept as the JSON array of
/// `{ role, parts }` documents so the stored shape matches the wire shape.
#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    database_url: String,
}

impl SqliteDocumentStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let in_memory = database_url.contains(":memory:");
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let mut pool_options = SqlitePoolOptions::new().max_connections(1);
        if in_memory {
            // An in-memory database lives exactly as long as its only connection.
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "sqlite document store ready");
        Ok(Self { pool, database_url })
    }

    pub async fn open_in_memory() -> StorageResult<Self> {
        Self::open(":memory:").await
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn load_row(
        &self,
        id: &ConversationId,
        stage: &'static str,
    ) -> StorageResult<Option<ConversationRow>> {
        sqlx::query_as::<_, ConversationRow>(
            "SELECT id, title, messages_json, user_id, created_at_ms, updated_at_ms FROM conversations WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu { stage })
    }
}

impl DocumentStore for SqliteDocumentStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    fn list<'a>(
        &'a self,
        owner_id: Option<&'a str>,
    ) -> BoxFuture<'a, StorageResult<Vec<TranscriptSummary>>> {
        Box::pin(async move {
            let rows = match owner_id {
                Some(owner_id) => {
                    sqlx::query_as::<_, SummaryRow>(
                        "SELECT id, title, user_id, created_at_ms, updated_at_ms FROM conversations WHERE user_id = ? ORDER BY updated_at_ms DESC, id DESC",
                    )
                    .bind(owner_id)
                    .fetch_all(&self.pool)
                    .await
                }
                None => {
                    sqlx::query_as::<_, SummaryRow>(
                        "SELECT id, title, user_id, created_at_ms, updated_at_ms FROM conversations ORDER BY updated_at_ms DESC, id DESC",
                    )
                    .fetch_all(&self.pool)
                    .await
                }
            }
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(summary_row_to_summary).collect()
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<Transcript>>> {
        Box::pin(async move {
            self.load_row(id, "conversation-get-query")
                .await?
                .map(conversation_row_to_transcript)
                .transpose()
        })
    }

    fn create<'a>(&'a self, input: NewTranscript) -> BoxFuture<'a, StorageResult<Transcript>> {
        Box::pin(async move {
            let id = ConversationId::new_v7();
            let title = input.resolved_title();
            let owner_id = input.resolved_owner();
            let messages_json = encode_messages(&input.messages, "conversation-create-encode")?;
            let now_ms = Utc::now().timestamp_millis();

            sqlx::query(
                "INSERT INTO conversations (id, title, messages_json, user_id, created_at_ms, updated_at_ms) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id.as_str())
            .bind(title.as_str())
            .bind(messages_json)
            .bind(owner_id.as_str())
            .bind(now_ms)
            .bind(now_ms)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            let created_at = millis_to_datetime(now_ms, "conversation-create-timestamp")?;
            Ok(Transcript::from_parts(
                id,
                title,
                input.messages,
                owner_id,
                created_at,
                created_at,
            ))
        })
    }

    fn update<'a>(
        &'a self,
        id: &'a ConversationId,
        patch: TranscriptPatch,
    ) -> BoxFuture<'a, StorageResult<Transcript>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-update-begin",
            })?;

            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, messages_json, user_id, created_at_ms, updated_at_ms FROM conversations WHERE id = ?",
            )
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-update-load",
            })?
            .context(NotFoundSnafu {
                stage: "conversation-update-missing",
                entity: "conversation",
                id: id.to_string(),
            })?;

            let mut transcript = conversation_row_to_transcript(row)?;
            transcript.apply_patch(patch);

            let messages_json =
                encode_messages(transcript.messages(), "conversation-update-encode")?;
            sqlx::query(
                "UPDATE conversations SET title = ?, messages_json = ?, updated_at_ms = ? WHERE id = ?",
            )
            .bind(transcript.title())
            .bind(messages_json)
            .bind(transcript.updated_at().timestamp_millis())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-update-apply",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-update-commit",
            })?;

            Ok(transcript)
        })
    }

    fn delete<'a>(&'a self, id: &'a ConversationId) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(id.as_str())
                .execute(&self.pool)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-apply",
                })?;

            Ok(result.rows_affected() > 0)
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    messages_json: String,
    user_id: String,
    created_at_ms: i64,
    updated_at_ms: i64,
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    id: String,
    title: String,
    user_id: String,
    created_at_ms: i64,
    updated_at_ms: i64,
}

fn conversation_row_to_transcript(row: ConversationRow) -> StorageResult<Transcript> {
    let messages = serde_json::from_str::<Vec<Message>>(&row.messages_json).context(
        DecodeDocumentSnafu {
            stage: "conversation-row-decode-messages",
        },
    )?;

    Ok(Transcript::from_parts(
        ConversationId::parse(&row.id)?,
        row.title,
        messages,
        row.user_id,
        millis_to_datetime(row.created_at_ms, "conversation-row-created-at")?,
        millis_to_datetime(row.updated_at_ms, "conversation-row-updated-at")?,
    ))
}

fn summary_row_to_summary(row: SummaryRow) -> StorageResult<TranscriptSummary> {
    Ok(TranscriptSummary {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        owner_id: row.user_id,
        created_at: millis_to_datetime(row.created_at_ms, "summary-row-created-at")?,
        updated_at: millis_to_datetime(row.updated_at_ms, "summary-row-updated-at")?,
        fallback_only: false,
    })
}

fn encode_messages(messages: &[Message], stage: &'static str) -> StorageResult<String> {
    serde_json::to_string(messages).context(EncodeDocumentSnafu { stage })
}

fn millis_to_datetime(value: i64, stage: &'static str) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value).context(InvariantViolationSnafu {
        stage,
        details: format!("sqlite timestamp '{value}' is out of range"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
