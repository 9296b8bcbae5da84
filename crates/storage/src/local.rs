use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::ResultExt;

use super::error::{
    CreateLocalStoreDirectorySnafu, DecodeDocumentSnafu, EncodeDocumentSnafu,
    InvariantViolationSnafu, ReadLocalStoreSnafu, ReplaceLocalStoreSnafu, StorageResult,
    WriteLocalStoreSnafu,
};
use super::ids::ConversationId;
use super::types::{Transcript, TranscriptSummary, sort_summaries};

/// Key namespace shared by every entry this store writes.
pub const LOCAL_STORE_NAMESPACE: &str = "bestie";

/// Browser-style key/value storage persisted as one JSON object on disk.
///
/// Holds the summary list under `bestie.conversations` and one full record per
/// conversation under `bestie.conversation.<id>`. The whole map is rewritten
/// through a temporary file on every mutation.
#[derive(Debug)]
pub struct LocalFallbackStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Value>>,
}

impl LocalFallbackStore {
    /// Opens the store at `path`. A missing file starts empty; an unreadable
    /// or corrupt file is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match read_entries(&path) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "local fallback store is unreadable; starting empty"
                );
                BTreeMap::new()
            }
        };

        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached summaries, newest first.
    pub fn summaries(&self) -> StorageResult<Vec<TranscriptSummary>> {
        let entries = self.lock("local-summaries")?;
        let mut summaries = decode_entry::<Vec<TranscriptSummary>>(&entries, &summaries_key())?
            .unwrap_or_default();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    /// Replaces the cached summary list for `owner_id` with `summaries`,
    /// keeping other owners' rows and any fallback-only rows.
    pub fn replace_summaries(
        &self,
        owner_id: &str,
        summaries: &[TranscriptSummary],
    ) -> StorageResult<()> {
        let mut entries = self.lock("local-replace-summaries")?;
        let mut merged = decode_entry::<Vec<TranscriptSummary>>(&entries, &summaries_key())?
            .unwrap_or_default()
            .into_iter()
            .filter(|summary| summary.owner_id != owner_id || summary.fallback_only)
            .filter(|summary| summaries.iter().all(|incoming| incoming.id != summary.id))
            .collect::<Vec<_>>();
        merged.extend(summaries.iter().cloned());
        sort_summaries(&mut merged);

        entries.insert(summaries_key(), encode_entry(&merged)?);
        self.flush(&entries)
    }

    pub fn get(&self, id: &ConversationId) -> StorageResult<Option<Transcript>> {
        let entries = self.lock("local-get")?;
        decode_entry(&entries, &record_key(id))
    }

    /// Writes the full record and upserts its summary row.
    pub fn put(&self, transcript: &Transcript) -> StorageResult<()> {
        let Some(summary) = transcript.summary() else {
            return InvariantViolationSnafu {
                stage: "local-put",
                details: "draft transcripts cannot be cached without an id".to_string(),
            }
            .fail();
        };

        let mut entries = self.lock("local-put")?;
        let mut summaries = decode_entry::<Vec<TranscriptSummary>>(&entries, &summaries_key())?
            .unwrap_or_default();
        summaries.retain(|existing| existing.id != summary.id);
        entries.insert(record_key(&summary.id), encode_entry(transcript)?);
        summaries.push(summary);
        sort_summaries(&mut summaries);
        entries.insert(summaries_key(), encode_entry(&summaries)?);
        self.flush(&entries)
    }

    /// Drops the record and its summary row; true when either existed.
    pub fn remove(&self, id: &ConversationId) -> StorageResult<bool> {
        let mut entries = self.lock("local-remove")?;
        let removed_record = entries.remove(&record_key(id)).is_some();

        let mut summaries = decode_entry::<Vec<TranscriptSummary>>(&entries, &summaries_key())?
            .unwrap_or_default();
        let before = summaries.len();
        summaries.retain(|summary| summary.id != *id);
        let removed_summary = summaries.len() != before;
        entries.insert(summaries_key(), encode_entry(&summaries)?);

        if removed_record || removed_summary {
            self.flush(&entries)?;
        }
        Ok(removed_record || removed_summary)
    }

    /// Cached transcripts the primary store is behind on: fallback-only records
    /// plus copies edited offline, oldest first.
    pub fn unsynced(&self) -> StorageResult<Vec<Transcript>> {
        let entries = self.lock("local-unsynced")?;
        let prefix = record_key_prefix();
        let mut pending = Vec::new();
        for (key, value) in entries.iter() {
            if !key.starts_with(&prefix) {
                continue;
            }
            let transcript = serde_json::from_value::<Transcript>(value.clone()).context(
                DecodeDocumentSnafu {
                    stage: "local-unsynced-decode",
                },
            )?;
            if transcript.is_fallback_only() || transcript.is_pending_update() {
                pending.push(transcript);
            }
        }
        pending.sort_by_key(Transcript::created_at);
        Ok(pending)
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, BTreeMap<String, Value>>> {
        self.entries.lock().map_err(|_| {
            InvariantViolationSnafu {
                stage,
                details: "local store mutex poisoned".to_string(),
            }
            .build()
        })
    }

    fn flush(&self, entries: &BTreeMap<String, Value>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateLocalStoreDirectorySnafu {
                stage: "local-create-directory",
                path: parent.display().to_string(),
            })?;
        }

        let serialized = serde_json::to_string_pretty(entries).context(EncodeDocumentSnafu {
            stage: "local-serialize",
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, serialized).context(WriteLocalStoreSnafu {
            stage: "local-write-temporary",
            path: temp_path.display().to_string(),
        })?;
        std::fs::rename(&temp_path, &self.path).context(ReplaceLocalStoreSnafu {
            stage: "local-rename-temporary",
            path: self.path.display().to_string(),
        })
    }
}

fn summaries_key() -> String {
    format!("{LOCAL_STORE_NAMESPACE}.conversations")
}

fn record_key_prefix() -> String {
    format!("{LOCAL_STORE_NAMESPACE}.conversation.")
}

fn record_key(id: &ConversationId) -> String {
    format!("{}{id}", record_key_prefix())
}

fn read_entries(path: &Path) -> StorageResult<BTreeMap<String, Value>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
            return Ok(BTreeMap::new());
        }
        Err(source) => {
            return Err(source).context(ReadLocalStoreSnafu {
                stage: "local-read",
                path: path.display().to_string(),
            });
        }
    };

    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    serde_json::from_str(&text).context(DecodeDocumentSnafu {
        stage: "local-parse",
    })
}

fn decode_entry<T: DeserializeOwned>(
    entries: &BTreeMap<String, Value>,
    key: &str,
) -> StorageResult<Option<T>> {
    entries
        .get(key)
        .map(|value| {
            serde_json::from_value(value.clone()).context(DecodeDocumentSnafu {
                stage: "local-decode-entry",
            })
        })
        .transpose()
}

fn encode_entry<T: Serialize + ?Sized>(value: &T) -> StorageResult<Value> {
    serde_json::to_value(value).context(EncodeDocumentSnafu {
        stage: "local-encode-entry",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn cached(prompt: &str) -> Transcript {
        let mut draft = Transcript::draft("anonymous");
        draft.append(Message::user(prompt).unwrap());
        draft.into_fallback(ConversationId::new_local())
    }

    #[test]
    fn put_survives_reopen_under_namespaced_keys() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("fallback.json");
        let transcript = cached("remember me");
        let id = transcript.id().cloned().unwrap();

        LocalFallbackStore::open(&path).put(&transcript).unwrap();

        let raw: BTreeMap<String, Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.contains_key("bestie.conversations"));
        assert!(raw.contains_key(&format!("bestie.conversation.{id}")));

        let reopened = LocalFallbackStore::open(&path);
        assert_eq!(reopened.get(&id).unwrap(), Some(transcript));
        assert_eq!(reopened.summaries().unwrap().len(), 1);
        assert_eq!(reopened.unsynced().unwrap().len(), 1);
    }

    #[test]
    fn unsynced_includes_offline_edits_of_primary_records() {
        let temp = tempfile::tempdir().unwrap();
        let store = LocalFallbackStore::open(temp.path().join("fallback.json"));

        let mut synced = Transcript::draft("anonymous");
        synced.append(Message::user("already upstream").unwrap());
        let mut synced = synced.into_fallback(ConversationId::new_local());
        synced.mark_synced(ConversationId::new_v7());
        store.put(&synced).unwrap();
        assert!(store.unsynced().unwrap().is_empty());

        synced.mark_pending_update();
        store.put(&synced).unwrap();
        let queued = store.unsynced().unwrap();
        assert_eq!(queued.len(), 1);
        assert!(queued[0].is_pending_update());
        assert!(!queued[0].is_fallback_only());
    }

    #[test]
    fn remove_drops_record_and_summary() {
        let temp = tempfile::tempdir().unwrap();
        let store = LocalFallbackStore::open(temp.path().join("fallback.json"));
        let transcript = cached("short lived");
        let id = transcript.id().cloned().unwrap();
        store.put(&transcript).unwrap();

        assert!(store.remove(&id).unwrap());
        assert!(!store.remove(&id).unwrap());
        assert_eq!(store.get(&id).unwrap(), None);
        assert!(store.summaries().unwrap().is_empty());
    }

    #[test]
    fn replacing_summaries_keeps_unsynced_rows() {
        let temp = tempfile::tempdir().unwrap();
        let store = LocalFallbackStore::open(temp.path().join("fallback.json"));
        let local = cached("offline draft");
        store.put(&local).unwrap();

        let primary = Transcript::draft("anonymous")
            .into_fallback(ConversationId::new_v7())
            .summary()
            .map(|mut summary| {
                summary.fallback_only = false;
                summary
            })
            .unwrap();
        store
            .replace_summaries("anonymous", std::slice::from_ref(&primary))
            .unwrap();

        let summaries = store.summaries().unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().any(|summary| summary.id == primary.id));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("fallback.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = LocalFallbackStore::open(&path);
        assert!(store.summaries().unwrap().is_empty());
    }
}
