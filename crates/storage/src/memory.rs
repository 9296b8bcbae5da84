use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use snafu::{OptionExt, ensure};
use tokio::sync::RwLock;

use super::error::{NotFoundSnafu, StorageResult, StoreUnreachableSnafu};
use super::ids::ConversationId;
use super::types::{NewTranscript, Transcript, TranscriptPatch, TranscriptSummary, sort_summaries};
use super::{BoxFuture, DocumentStore};

const STORE_NAME: &str = "memory";

/// Process-local document store with a reachability switch.
///
/// Used when no primary store is configured and to simulate an unreachable
/// primary in tests.
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    records: RwLock<HashMap<ConversationId, Transcript>>,
    reachable: AtomicBool,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn ensure_reachable(&self, stage: &'static str) -> StorageResult<()> {
        ensure!(
            self.reachable.load(Ordering::SeqCst),
            StoreUnreachableSnafu {
                stage,
                store: STORE_NAME,
                details: "store is switched offline",
            }
        );
        Ok(())
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    fn list<'a>(
        &'a self,
        owner_id: Option<&'a str>,
    ) -> BoxFuture<'a, StorageResult<Vec<TranscriptSummary>>> {
        Box::pin(async move {
            self.ensure_reachable("memory-list")?;
            let records = self.records.read().await;
            let mut summaries = records
                .values()
                .filter(|record| owner_id.is_none_or(|owner| record.owner_id() == owner))
                .filter_map(Transcript::summary)
                .collect::<Vec<_>>();
            sort_summaries(&mut summaries);
            Ok(summaries)
        })
    }

    fn get<'a>(
        &'a self,
        id: &'a ConversationId,
    ) -> BoxFuture<'a, StorageResult<Option<Transcript>>> {
        Box::pin(async move {
            self.ensure_reachable("memory-get")?;
            Ok(self.records.read().await.get(id).cloned())
        })
    }

    fn create<'a>(&'a self, input: NewTranscript) -> BoxFuture<'a, StorageResult<Transcript>> {
        Box::pin(async move {
            self.ensure_reachable("memory-create")?;
            let now = Utc::now();
            let id = ConversationId::new_v7();
            let created = Transcript::from_parts(
                id.clone(),
                input.resolved_title(),
                input.messages.clone(),
                input.resolved_owner(),
                now,
                now,
            );
            self.records.write().await.insert(id, created.clone());
            Ok(created)
        })
    }

    fn update<'a>(
        &'a self,
        id: &'a ConversationId,
        patch: TranscriptPatch,
    ) -> BoxFuture<'a, StorageResult<Transcript>> {
        Box::pin(async move {
            self.ensure_reachable("memory-update")?;
            let mut records = self.records.write().await;
            let record = records.get_mut(id).context(NotFoundSnafu {
                stage: "memory-update-missing",
                entity: "conversation",
                id: id.to_string(),
            })?;
            record.apply_patch(patch);
            Ok(record.clone())
        })
    }

    fn delete<'a>(&'a self, id: &'a ConversationId) -> BoxFuture<'a, StorageResult<bool>> {
        Box::pin(async move {
            self.ensure_reachable("memory-delete")?;
            Ok(self.records.write().await.remove(id).is_some())
        })
    }
}
