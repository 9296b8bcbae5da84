use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use snafu::ensure;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

/// Prefix carried by ids minted locally while the primary store was unreachable.
pub const LOCAL_ID_PREFIX: &str = "local-";

const MAX_ID_LEN: usize = 128;

/// Opaque conversation identifier.
///
/// Primary stores hand out UUID v7 strings; the fallback store mints
/// `local-<unix millis>-<8 hex>` ids. Only `[A-Za-z0-9_-]` is accepted so an id
/// can be placed in a URL path segment or a storage key as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(String);

impl ConversationId {
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_ID_LEN
            && raw
                .chars()
                .all(|character| character.is_ascii_alphanumeric() || matches!(character, '-' | '_'));
        ensure!(
            valid,
            InvalidIdSnafu {
                stage: "parse-conversation-id",
                raw: raw.to_string(),
            }
        );
        Ok(Self(raw.to_string()))
    }

    pub fn new_v7() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Time-ordered id for transcripts that only exist in the fallback store.
    pub fn new_local() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_millis());
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{LOCAL_ID_PREFIX}{millis}-{}", &suffix[..8]))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for ConversationId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = StorageError;

    fn try_from(raw: String) -> StorageResult<Self> {
        Self::parse(&raw)
    }
}

impl From<ConversationId> for String {
    fn from(value: ConversationId) -> Self {
        value.0
    }
}
