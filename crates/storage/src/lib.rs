use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod gateway;
pub mod http;
pub mod ids;
pub mod local;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use gateway::{Listing, ListingSource, PersistenceGateway, ReconcileReport, SyncedTranscript};
pub use http::HttpDocumentStore;
pub use ids::{ConversationId, LOCAL_ID_PREFIX};
pub use local::{LOCAL_STORE_NAMESPACE, LocalFallbackStore};
pub use memory::InMemoryDocumentStore;
pub use sqlite::SqliteDocumentStore;
pub use types::{
    DEFAULT_OWNER_ID, DEFAULT_TRANSCRIPT_TITLE, Message, NewTranscript, Role, TITLE_PREFIX_CHARS,
    TITLE_TRUNCATION_MARKER, Transcript, TranscriptPatch, TranscriptSummary, derive_title,
    sort_summaries,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Primary document store for the `conversations` collection.
///
/// Absence is reported as `Ok(None)` / `Ok(false)` for reads and deletes and as
/// [`StorageError::NotFound`] for updates. Backend failures the caller cannot
/// fix must satisfy [`StorageError::is_unreachable`] so the gateway can fall back.
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &str;

    /// Summaries sorted by `updated_at` descending; all owners when `owner_id` is `None`.
    fn list<'a>(
        &'a self,
        owner_id: Option<&'a str>,
    ) -> BoxFuture<'a, StorageResult<Vec<TranscriptSummary>>>;

    fn get<'a>(&'a self, id: &'a ConversationId)
    -> BoxFuture<'a, StorageResult<Option<Transcript>>>;

    fn create<'a>(&'a self, input: NewTranscript) -> BoxFuture<'a, StorageResult<Transcript>>;

    fn update<'a>(
        &'a self,
        id: &'a ConversationId,
        patch: TranscriptPatch,
    ) -> BoxFuture<'a, StorageResult<Transcript>>;

    fn delete<'a>(&'a self, id: &'a ConversationId) -> BoxFuture<'a, StorageResult<bool>>;
}
