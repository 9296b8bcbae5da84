use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use snafu::OptionExt;

use super::DocumentStore;
use super::error::{NotFoundSnafu, StorageError, StorageResult};
use super::ids::ConversationId;
use super::local::LocalFallbackStore;
use super::types::{Transcript, TranscriptPatch, TranscriptSummary, sort_summaries};

/// Where a conversation listing came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingSource {
    Primary,
    FallbackCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub summaries: Vec<TranscriptSummary>,
    pub source: ListingSource,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedTranscript {
    pub local_id: ConversationId,
    pub primary_id: ConversationId,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub synced: Vec<SyncedTranscript>,
    /// Primary records whose offline edits were replayed.
    pub updated: Vec<ConversationId>,
    /// Cached transcripts still waiting for the primary store.
    pub pending: usize,
    /// Transcripts the primary rejected outright, with the reason.
    pub failed: Vec<(ConversationId, String)>,
}

/// Conversation persistence over a primary document store with a local cache.
///
/// Unreachable-store failures never reach the caller: reads fall back to the
/// cache and writes land in it (new transcripts under a locally minted id,
/// edits flagged as pending) until [`reconcile`] pushes them upstream.
///
/// [`reconcile`]: PersistenceGateway::reconcile
pub struct PersistenceGateway {
    primary: Arc<dyn DocumentStore>,
    fallback: LocalFallbackStore,
    degraded: AtomicBool,
}

impl std::fmt::Debug for PersistenceGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceGateway")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.path())
            .field("degraded", &self.is_degraded())
            .finish()
    }
}

impl PersistenceGateway {
    pub fn new(primary: Arc<dyn DocumentStore>, fallback: LocalFallbackStore) -> Self {
        Self {
            primary,
            fallback,
            degraded: AtomicBool::new(false),
        }
    }

    /// True while the last primary call failed because the store was unreachable.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn fallback(&self) -> &LocalFallbackStore {
        &self.fallback
    }

    /// Never fails: an unusable primary yields the cached listing plus a warning.
    pub async fn list(&self, owner_id: &str) -> Listing {
        match self.primary.list(Some(owner_id)).await {
            Ok(primary) => {
                self.mark_reachable();
                self.mirror(|cache| cache.replace_summaries(owner_id, &primary));

                let mut summaries = primary;
                let unsynced = self.cached_summaries(owner_id);
                summaries.extend(
                    unsynced
                        .into_iter()
                        .filter(|summary| summary.fallback_only),
                );
                sort_summaries(&mut summaries);

                Listing {
                    summaries,
                    source: ListingSource::Primary,
                    warning: None,
                }
            }
            Err(error) => {
                self.note_failure(&error);
                tracing::warn!(
                    store = self.primary.name(),
                    owner_id,
                    error = %error,
                    "listing conversations from the local cache"
                );

                Listing {
                    summaries: self.cached_summaries(owner_id),
                    source: ListingSource::FallbackCache,
                    warning: Some(format!(
                        "conversation store unavailable, showing cached list: {error}"
                    )),
                }
            }
        }
    }

    pub async fn get(&self, id: &ConversationId) -> StorageResult<Transcript> {
        if !id.is_local() {
            match self.primary.get(id).await {
                Ok(Some(transcript)) => {
                    self.mark_reachable();
                    if let Some(cached) = self.pending_copy(id) {
                        tracing::debug!(
                            id = %id,
                            "cached copy has unsynced edits; primary copy ignored"
                        );
                        return Ok(cached);
                    }
                    self.mirror(|cache| cache.put(&transcript));
                    return Ok(transcript);
                }
                Ok(None) => self.mark_reachable(),
                Err(error) if error.is_unreachable() => {
                    self.note_failure(&error);
                    tracing::warn!(
                        store = self.primary.name(),
                        id = %id,
                        error = %error,
                        "reading conversation from the local cache"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        self.fallback.get(id)?.context(NotFoundSnafu {
            stage: "gateway-get-missing",
            entity: "conversation",
            id: id.to_string(),
        })
    }

    /// Persists a transcript and returns it with an id. When the primary is
    /// unreachable the copy is kept locally under a `local-` id.
    pub async fn create(&self, transcript: &Transcript) -> StorageResult<Transcript> {
        match self.primary.create(transcript.to_new_transcript()).await {
            Ok(created) => {
                self.mark_reachable();
                self.mirror(|cache| cache.put(&created));
                Ok(created)
            }
            Err(error) if error.is_unreachable() => {
                self.note_failure(&error);
                let cached = transcript.clone().into_fallback(ConversationId::new_local());
                tracing::warn!(
                    store = self.primary.name(),
                    local_id = %cached.id().map(ToString::to_string).unwrap_or_default(),
                    error = %error,
                    "primary store unreachable; conversation kept in the local cache"
                );
                self.fallback.put(&cached)?;
                Ok(cached)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn update(
        &self,
        id: &ConversationId,
        patch: TranscriptPatch,
    ) -> StorageResult<Transcript> {
        let mut queue_for_sync = false;
        if !id.is_local() {
            // Edits still queued locally ride along so the primary never loses them.
            let outgoing = match self.pending_copy(id) {
                Some(mut cached) => {
                    cached.apply_patch(patch.clone());
                    TranscriptPatch::full(&cached)
                }
                None => patch.clone(),
            };
            match self.primary.update(id, outgoing).await {
                Ok(updated) => {
                    self.mark_reachable();
                    self.mirror(|cache| cache.put(&updated));
                    return Ok(updated);
                }
                Err(error) if error.is_unreachable() => {
                    self.note_failure(&error);
                    tracing::warn!(
                        store = self.primary.name(),
                        id = %id,
                        error = %error,
                        "updating the cached copy of the conversation"
                    );
                    queue_for_sync = true;
                }
                Err(error) if error.is_not_found() => self.mark_reachable(),
                Err(error) => return Err(error),
            }
        }

        let mut cached = self.fallback.get(id)?.context(NotFoundSnafu {
            stage: "gateway-update-missing",
            entity: "conversation",
            id: id.to_string(),
        })?;
        cached.apply_patch(patch);
        if queue_for_sync {
            cached.mark_pending_update();
        }
        self.fallback.put(&cached)?;
        Ok(cached)
    }

    /// True when either store removed something. The cached copy is dropped
    /// whatever the primary answers; a primary rejection only surfaces when the
    /// cache held nothing either.
    pub async fn delete(&self, id: &ConversationId) -> StorageResult<bool> {
        let mut removed = false;
        let mut rejected = None;
        if !id.is_local() {
            match self.primary.delete(id).await {
                Ok(deleted) => {
                    self.mark_reachable();
                    removed = deleted;
                }
                Err(error) if error.is_unreachable() => {
                    self.note_failure(&error);
                    tracing::warn!(
                        store = self.primary.name(),
                        id = %id,
                        error = %error,
                        "primary delete failed; removing the cached copy only"
                    );
                }
                Err(error) => {
                    tracing::warn!(
                        store = self.primary.name(),
                        id = %id,
                        error = %error,
                        "primary store rejected the delete; removing the cached copy only"
                    );
                    rejected = Some(error);
                }
            }
        }

        let cache_removed = self.fallback.remove(id)?;
        match rejected {
            Some(error) if !cache_removed => Err(error),
            _ => Ok(removed || cache_removed),
        }
    }

    /// Pushes the cache's unsynced work to the primary store, oldest first:
    /// fallback-only transcripts are created and rebound to the id the primary
    /// hands out, offline edits of primary records are replayed as full updates.
    pub async fn reconcile(&self) -> StorageResult<ReconcileReport> {
        let queued = self.fallback.unsynced()?;
        let mut report = ReconcileReport::default();

        for (index, cached) in queued.iter().enumerate() {
            let Some(cached_id) = cached.id().cloned() else {
                continue;
            };

            let pushed = if cached.is_fallback_only() {
                self.primary.create(cached.to_new_transcript()).await
            } else {
                self.primary
                    .update(&cached_id, TranscriptPatch::full(cached))
                    .await
            };

            match pushed {
                Ok(stored) => {
                    self.mark_reachable();
                    let Some(primary_id) = stored.id().cloned() else {
                        tracing::warn!(
                            id = %cached_id,
                            "primary store answered without an id; cached copy kept"
                        );
                        report.failed.push((
                            cached_id,
                            "primary store returned a conversation without an id".to_string(),
                        ));
                        continue;
                    };

                    if cached.is_fallback_only() {
                        self.fallback.remove(&cached_id)?;
                        self.fallback.put(&stored)?;
                        tracing::info!(
                            local_id = %cached_id,
                            primary_id = %primary_id,
                            "synced cached conversation to the primary store"
                        );
                        report.synced.push(SyncedTranscript {
                            local_id: cached_id,
                            primary_id,
                        });
                    } else {
                        self.fallback.put(&stored)?;
                        tracing::info!(
                            id = %primary_id,
                            "replayed offline edits to the primary store"
                        );
                        report.updated.push(primary_id);
                    }
                }
                Err(error) if error.is_unreachable() => {
                    self.note_failure(&error);
                    let remaining = queued.len() - index;
                    tracing::warn!(
                        store = self.primary.name(),
                        error = %error,
                        remaining,
                        "primary store still unreachable; reconciliation paused"
                    );
                    report.pending = remaining;
                    return Ok(report);
                }
                Err(error) => {
                    tracing::warn!(
                        id = %cached_id,
                        error = %error,
                        "primary store rejected cached conversation"
                    );
                    report.failed.push((cached_id, error.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Cached copy of `id` when it holds edits the primary has not seen.
    fn pending_copy(&self, id: &ConversationId) -> Option<Transcript> {
        match self.fallback.get(id) {
            Ok(cached) => cached.filter(Transcript::is_pending_update),
            Err(error) => {
                tracing::warn!(id = %id, error = %error, "local cache entry unreadable");
                None
            }
        }
    }

    fn cached_summaries(&self, owner_id: &str) -> Vec<TranscriptSummary> {
        match self.fallback.summaries() {
            Ok(summaries) => summaries
                .into_iter()
                .filter(|summary| summary.owner_id == owner_id)
                .collect(),
            Err(error) => {
                tracing::warn!(error = %error, "local cache summaries unreadable");
                Vec::new()
            }
        }
    }

    /// Cache writes after a primary success are best effort.
    fn mirror(&self, write: impl FnOnce(&LocalFallbackStore) -> StorageResult<()>) {
        if let Err(error) = write(&self.fallback) {
            tracing::warn!(
                path = %self.fallback.path().display(),
                error = %error,
                "failed to mirror conversation into the local cache"
            );
        }
    }

    fn mark_reachable(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            tracing::info!(store = self.primary.name(), "primary store reachable again");
        }
    }

    fn note_failure(&self, error: &StorageError) {
        if error.is_unreachable() {
            self.degraded.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use crate::error::ValidationSnafu;
    use crate::memory::InMemoryDocumentStore;
    use crate::types::{Message, NewTranscript};

    /// In-memory store that rejects deletes or forgets the id on create.
    struct MisbehavingStore {
        inner: InMemoryDocumentStore,
        reject_delete: bool,
        drop_created_id: bool,
    }

    impl MisbehavingStore {
        fn new(reject_delete: bool, drop_created_id: bool) -> Arc<Self> {
            Arc::new(Self {
                inner: InMemoryDocumentStore::new(),
                reject_delete,
                drop_created_id,
            })
        }
    }

    impl DocumentStore for MisbehavingStore {
        fn name(&self) -> &str {
            "misbehaving"
        }

        fn list<'a>(
            &'a self,
            owner_id: Option<&'a str>,
        ) -> BoxFuture<'a, StorageResult<Vec<TranscriptSummary>>> {
            self.inner.list(owner_id)
        }

        fn get<'a>(
            &'a self,
            id: &'a ConversationId,
        ) -> BoxFuture<'a, StorageResult<Option<Transcript>>> {
            self.inner.get(id)
        }

        fn create<'a>(&'a self, input: NewTranscript) -> BoxFuture<'a, StorageResult<Transcript>> {
            Box::pin(async move {
                let created = self.inner.create(input).await?;
                if self.drop_created_id {
                    return Ok(Transcript::draft(created.owner_id()));
                }
                Ok(created)
            })
        }

        fn update<'a>(
            &'a self,
            id: &'a ConversationId,
            patch: TranscriptPatch,
        ) -> BoxFuture<'a, StorageResult<Transcript>> {
            self.inner.update(id, patch)
        }

        fn delete<'a>(&'a self, id: &'a ConversationId) -> BoxFuture<'a, StorageResult<bool>> {
            if !self.reject_delete {
                return self.inner.delete(id);
            }
            Box::pin(async {
                ValidationSnafu {
                    stage: "misbehaving-delete",
                    details: "400 from server",
                }
                .fail()
            })
        }
    }

    fn gateway_over(primary: Arc<dyn DocumentStore>) -> (tempfile::TempDir, PersistenceGateway) {
        let temp = tempfile::tempdir().unwrap();
        let gateway = PersistenceGateway::new(
            primary,
            LocalFallbackStore::open(temp.path().join("fallback.json")),
        );
        (temp, gateway)
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        primary: Arc<InMemoryDocumentStore>,
        gateway: PersistenceGateway,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let primary = Arc::new(InMemoryDocumentStore::new());
        let gateway = PersistenceGateway::new(
            primary.clone(),
            LocalFallbackStore::open(temp.path().join("fallback.json")),
        );
        Fixture {
            _temp: temp,
            primary,
            gateway,
        }
    }

    fn exchange(prompt: &str, reply: &str) -> Transcript {
        let mut draft = Transcript::draft("anonymous");
        draft.append(Message::user(prompt).unwrap());
        draft.append(Message::model(reply).unwrap());
        draft.derive_title();
        draft
    }

    #[tokio::test]
    async fn create_uses_primary_and_mirrors_into_cache() {
        let fixture = fixture();
        let created = fixture
            .gateway
            .create(&exchange("Hello", "Hi there"))
            .await
            .unwrap();
        let id = created.id().cloned().unwrap();

        assert!(!id.is_local());
        assert_eq!(created.title(), "Hello...");
        assert_eq!(fixture.primary.len().await, 1);
        assert_eq!(fixture.gateway.fallback().get(&id).unwrap(), Some(created));
        assert!(!fixture.gateway.is_degraded());
    }

    #[tokio::test]
    async fn create_falls_back_when_primary_is_unreachable() {
        let fixture = fixture();
        fixture.primary.set_reachable(false);

        let created = fixture
            .gateway
            .create(&exchange("offline", "still here"))
            .await
            .unwrap();
        let id = created.id().cloned().unwrap();

        assert!(id.is_local());
        assert!(created.is_fallback_only());
        assert!(fixture.gateway.is_degraded());
        assert_eq!(fixture.gateway.get(&id).await.unwrap(), created);

        let listing = fixture.gateway.list("anonymous").await;
        assert_eq!(listing.source, ListingSource::FallbackCache);
        assert!(listing.warning.is_some());
        assert_eq!(listing.summaries.len(), 1);
    }

    #[tokio::test]
    async fn get_reports_not_found_when_absent_everywhere() {
        let fixture = fixture();
        let missing = ConversationId::new_v7();
        let error = fixture.gateway.get(&missing).await.unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn list_prefers_primary_and_keeps_unsynced_rows() {
        let fixture = fixture();
        let first = fixture
            .gateway
            .create(&exchange("first", "one"))
            .await
            .unwrap();

        fixture.primary.set_reachable(false);
        let offline = fixture
            .gateway
            .create(&exchange("second", "two"))
            .await
            .unwrap();
        fixture.primary.set_reachable(true);

        let listing = fixture.gateway.list("anonymous").await;
        assert_eq!(listing.source, ListingSource::Primary);
        assert_eq!(listing.warning, None);
        let ids = listing
            .summaries
            .iter()
            .map(|summary| summary.id.clone())
            .collect::<Vec<_>>();
        assert_eq!(
            ids,
            vec![offline.id().cloned().unwrap(), first.id().cloned().unwrap()]
        );
        assert!(!fixture.gateway.is_degraded());
    }

    #[tokio::test]
    async fn update_of_local_id_touches_only_the_cache() {
        let fixture = fixture();
        fixture.primary.set_reachable(false);
        let created = fixture
            .gateway
            .create(&exchange("draft", "reply"))
            .await
            .unwrap();
        fixture.primary.set_reachable(true);

        let mut messages = created.messages().to_vec();
        messages.push(Message::user("more").unwrap());
        let updated = fixture
            .gateway
            .update(created.id().unwrap(), TranscriptPatch::messages(messages))
            .await
            .unwrap();

        assert_eq!(updated.messages().len(), 3);
        assert!(updated.updated_at() >= created.updated_at());
        assert!(fixture.primary.is_empty().await);
    }

    #[tokio::test]
    async fn update_of_unknown_id_is_not_found() {
        let fixture = fixture();
        let error = fixture
            .gateway
            .update(&ConversationId::new_v7(), TranscriptPatch::default())
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn delete_clears_both_stores() {
        let fixture = fixture();
        let created = fixture
            .gateway
            .create(&exchange("bye", "ok"))
            .await
            .unwrap();
        let id = created.id().cloned().unwrap();

        assert!(fixture.gateway.delete(&id).await.unwrap());
        assert!(fixture.primary.is_empty().await);
        assert_eq!(fixture.gateway.fallback().get(&id).unwrap(), None);
        assert!(!fixture.gateway.delete(&id).await.unwrap());
    }

    #[tokio::test]
    async fn reconcile_moves_cached_transcripts_to_primary() {
        let fixture = fixture();
        fixture.primary.set_reachable(false);
        let offline = fixture
            .gateway
            .create(&exchange("queued", "later"))
            .await
            .unwrap();
        let local_id = offline.id().cloned().unwrap();

        let paused = fixture.gateway.reconcile().await.unwrap();
        assert!(paused.synced.is_empty());
        assert_eq!(paused.pending, 1);

        fixture.primary.set_reachable(true);
        let report = fixture.gateway.reconcile().await.unwrap();
        assert_eq!(report.pending, 0);
        assert_eq!(report.synced.len(), 1);
        assert_eq!(report.synced[0].local_id, local_id);

        let primary_id = report.synced[0].primary_id.clone();
        let synced = fixture.gateway.get(&primary_id).await.unwrap();
        assert_eq!(synced.messages(), offline.messages());
        assert!(!synced.is_fallback_only());
        assert_eq!(fixture.gateway.fallback().get(&local_id).unwrap(), None);
        assert!(fixture.gateway.fallback().unsynced().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_while_unreachable_still_clears_the_cache() {
        let fixture = fixture();
        let created = fixture
            .gateway
            .create(&exchange("forget", "me"))
            .await
            .unwrap();
        let id = created.id().cloned().unwrap();
        fixture.primary.set_reachable(false);

        assert!(fixture.gateway.delete(&id).await.unwrap());
        assert_eq!(fixture.gateway.fallback().get(&id).unwrap(), None);
        assert!(fixture.gateway.fallback().summaries().unwrap().is_empty());
        assert!(fixture.gateway.is_degraded());
    }

    #[tokio::test]
    async fn rejected_primary_delete_still_clears_the_cache() {
        let primary = MisbehavingStore::new(true, false);
        let (_temp, gateway) = gateway_over(primary.clone());
        let created = gateway.create(&exchange("stubborn", "record")).await.unwrap();
        let id = created.id().cloned().unwrap();

        assert!(gateway.delete(&id).await.unwrap());
        assert_eq!(gateway.fallback().get(&id).unwrap(), None);
        assert!(gateway.fallback().summaries().unwrap().is_empty());

        // Nothing cached any more, so the rejection is the only answer left.
        let error = gateway.delete(&id).await.unwrap_err();
        assert!(error.is_validation());
    }

    #[tokio::test]
    async fn offline_edit_of_a_primary_record_survives_until_replayed() {
        let fixture = fixture();
        let created = fixture
            .gateway
            .create(&exchange("kept", "upstream"))
            .await
            .unwrap();
        let id = created.id().cloned().unwrap();

        fixture.primary.set_reachable(false);
        let mut messages = created.messages().to_vec();
        messages.push(Message::user("written offline").unwrap());
        let edited = fixture
            .gateway
            .update(&id, TranscriptPatch::messages(messages))
            .await
            .unwrap();
        assert_eq!(edited.messages().len(), 3);
        assert!(edited.is_pending_update());

        fixture.primary.set_reachable(true);
        let read_back = fixture.gateway.get(&id).await.unwrap();
        assert_eq!(read_back.messages().len(), 3);
        assert_eq!(fixture.gateway.fallback().unsynced().unwrap().len(), 1);

        let report = fixture.gateway.reconcile().await.unwrap();
        assert_eq!(report.updated, vec![id.clone()]);
        assert!(report.synced.is_empty());
        assert_eq!(report.pending, 0);

        let upstream = fixture.primary.get(&id).await.unwrap().unwrap();
        assert_eq!(upstream.messages().len(), 3);
        assert!(!upstream.is_pending_update());
        assert!(fixture.gateway.fallback().unsynced().unwrap().is_empty());
    }

    #[tokio::test]
    async fn online_update_carries_queued_offline_edits() {
        let fixture = fixture();
        let created = fixture
            .gateway
            .create(&exchange("base", "line"))
            .await
            .unwrap();
        let id = created.id().cloned().unwrap();

        fixture.primary.set_reachable(false);
        let mut messages = created.messages().to_vec();
        messages.push(Message::user("offline turn").unwrap());
        fixture
            .gateway
            .update(&id, TranscriptPatch::messages(messages))
            .await
            .unwrap();

        fixture.primary.set_reachable(true);
        let retitled = fixture
            .gateway
            .update(
                &id,
                TranscriptPatch {
                    title: Some("Renamed".to_string()),
                    messages: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(retitled.title(), "Renamed");
        assert_eq!(retitled.messages().len(), 3);
        assert!(!retitled.is_pending_update());
        assert!(fixture.gateway.fallback().unsynced().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_reports_created_records_without_an_id() {
        let primary = MisbehavingStore::new(false, true);
        let (_temp, gateway) = gateway_over(primary.clone());
        primary.inner.set_reachable(false);
        let offline = gateway.create(&exchange("orphan", "reply")).await.unwrap();
        let local_id = offline.id().cloned().unwrap();

        primary.inner.set_reachable(true);
        let report = gateway.reconcile().await.unwrap();

        assert!(report.synced.is_empty());
        assert_eq!(report.pending, 0);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, local_id);
        assert_eq!(gateway.fallback().get(&local_id).unwrap(), Some(offline));
    }
}
