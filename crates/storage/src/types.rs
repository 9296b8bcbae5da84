use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::error::{StorageError, StorageResult, ValidationSnafu};
use super::ids::ConversationId;

/// Title used when a transcript has no message to derive one from.
pub const DEFAULT_TRANSCRIPT_TITLE: &str = "New Conversation";
/// Owner recorded when the caller does not name one.
pub const DEFAULT_OWNER_ID: &str = "anonymous";
pub const TITLE_PREFIX_CHARS: usize = 30;
pub const TITLE_TRUNCATION_MARKER: &str = "...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        match raw {
            "user" => Ok(Self::User),
            "model" => Ok(Self::Model),
            other => ValidationSnafu {
                stage: "parse-message-role",
                details: format!("unknown message role '{other}'"),
            }
            .fail(),
        }
    }
}

/// One turn of a transcript. Immutable once created.
///
/// On the wire a message is a document `{ role, parts: [{ text }] }`; parts are
/// joined in order when read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MessageDocument", into = "MessageDocument")]
pub struct Message {
    role: Role,
    text: String,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>) -> StorageResult<Self> {
        let text = text.into();
        ensure!(
            !text.trim().is_empty(),
            ValidationSnafu {
                stage: "new-message",
                details: format!("{role} message text must not be blank"),
            }
        );
        Ok(Self { role, text })
    }

    pub fn user(text: impl Into<String>) -> StorageResult<Self> {
        Self::new(Role::User, text)
    }

    pub fn model(text: impl Into<String>) -> StorageResult<Self> {
        Self::new(Role::Model, text)
    }

    /// Synthetic model turn recording a failed reply, so the transcript keeps
    /// showing exactly what the user saw.
    pub fn error_reply(details: impl fmt::Display) -> Self {
        Self {
            role: Role::Model,
            text: format!("Error: {details}"),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageDocument {
    role: String,
    parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TextPart {
    text: String,
}

impl TryFrom<MessageDocument> for Message {
    type Error = StorageError;

    fn try_from(document: MessageDocument) -> StorageResult<Self> {
        let role = document.role.parse::<Role>()?;
        let text = document
            .parts
            .into_iter()
            .map(|part| part.text)
            .collect::<String>();
        Self::new(role, text)
    }
}

impl From<Message> for MessageDocument {
    fn from(message: Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            parts: vec![TextPart { text: message.text }],
        }
    }
}

/// Derives a list title from the first user message (first message when no
/// user turn exists): the first [`TITLE_PREFIX_CHARS`] characters plus
/// [`TITLE_TRUNCATION_MARKER`].
pub fn derive_title(messages: &[Message]) -> String {
    let source = messages
        .iter()
        .find(|message| message.role == Role::User)
        .or_else(|| messages.first());

    let Some(source) = source else {
        return DEFAULT_TRANSCRIPT_TITLE.to_string();
    };

    let mut title = source
        .text
        .trim()
        .chars()
        .take(TITLE_PREFIX_CHARS)
        .collect::<String>();
    title.push_str(TITLE_TRUNCATION_MARKER);
    title
}

/// One conversation, persisted or draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    id: Option<ConversationId>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(rename = "userId", default = "default_owner_id")]
    owner_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    // Only the local fallback cache ever records this flag.
    #[serde(default, skip_serializing_if = "is_false")]
    fallback_only: bool,
    // Cached copy changed while the primary store was unreachable.
    #[serde(default, skip_serializing_if = "is_false")]
    pending_update: bool,
}

impl Transcript {
    /// Empty in-memory transcript without an id.
    pub fn draft(owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            title: String::new(),
            messages: Vec::new(),
            owner_id: normalize_owner(owner_id.into()),
            created_at: now,
            updated_at: now,
            fallback_only: false,
            pending_update: false,
        }
    }

    pub(crate) fn from_parts(
        id: ConversationId,
        title: String,
        messages: Vec<Message>,
        owner_id: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Some(id),
            title,
            messages,
            owner_id,
            created_at,
            updated_at,
            fallback_only: false,
            pending_update: false,
        }
    }

    pub fn id(&self) -> Option<&ConversationId> {
        self.id.as_ref()
    }

    pub fn is_draft(&self) -> bool {
        self.id.is_none()
    }

    /// True when the id was minted locally and the primary store has never seen it.
    pub fn is_fallback_only(&self) -> bool {
        self.fallback_only
    }

    /// True when the cached copy holds edits the primary store has not seen.
    pub fn is_pending_update(&self) -> bool {
        self.pending_update
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    /// Sets the title from the messages unless one is already set.
    pub fn derive_title(&mut self) -> &str {
        if self.title.trim().is_empty() {
            self.title = derive_title(&self.messages);
            self.touch();
        }
        &self.title
    }

    /// Overwrites only the supplied fields and refreshes `updated_at`.
    pub fn apply_patch(&mut self, patch: TranscriptPatch) {
        if let Some(title) = patch.title
            && !title.trim().is_empty()
        {
            self.title = title;
        }
        if let Some(messages) = patch.messages {
            self.messages = messages;
        }
        self.touch();
    }

    /// Binds the id handed out by the primary store once a fallback-only
    /// transcript has been synced.
    pub fn mark_synced(&mut self, primary_id: ConversationId) {
        self.id = Some(primary_id);
        self.fallback_only = false;
        self.pending_update = false;
    }

    pub(crate) fn mark_pending_update(&mut self) {
        if !self.fallback_only {
            self.pending_update = true;
        }
    }

    pub(crate) fn into_fallback(mut self, local_id: ConversationId) -> Self {
        self.id = Some(local_id);
        self.fallback_only = true;
        self.title = if self.title.trim().is_empty() {
            derive_title(&self.messages)
        } else {
            self.title
        };
        self.touch();
        self
    }

    pub fn summary(&self) -> Option<TranscriptSummary> {
        let id = self.id.clone()?;
        Some(TranscriptSummary {
            id,
            title: self.title.clone(),
            owner_id: self.owner_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            fallback_only: self.fallback_only,
        })
    }

    pub fn to_new_transcript(&self) -> NewTranscript {
        NewTranscript {
            title: self.title.clone(),
            messages: self.messages.clone(),
            owner_id: Some(self.owner_id.clone()),
        }
    }

    /// `updated_at` never moves backwards, even when the wall clock does.
    fn touch(&mut self) {
        self.updated_at = self.updated_at.max(Utc::now());
    }
}

/// Row shown in the conversation picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptSummary {
    #[serde(rename = "_id")]
    pub id: ConversationId,
    pub title: String,
    #[serde(rename = "userId", default = "default_owner_id")]
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub fallback_only: bool,
}

/// Most recently updated first; ties broken by id so the order is stable.
pub fn sort_summaries(summaries: &mut [TranscriptSummary]) {
    summaries.sort_by(|left, right| {
        right
            .updated_at
            .cmp(&left.updated_at)
            .then_with(|| right.id.cmp(&left.id))
    });
}

/// Body of a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTranscript {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl NewTranscript {
    /// Title to store: the supplied one, or one derived from the messages.
    pub fn resolved_title(&self) -> String {
        if self.title.trim().is_empty() {
            derive_title(&self.messages)
        } else {
            self.title.clone()
        }
    }

    pub fn resolved_owner(&self) -> String {
        normalize_owner(self.owner_id.clone().unwrap_or_default())
    }
}

/// Partial update; absent (or blank title) fields keep their stored value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
}

impl TranscriptPatch {
    pub fn messages(messages: Vec<Message>) -> Self {
        Self {
            title: None,
            messages: Some(messages),
        }
    }

    pub fn full(transcript: &Transcript) -> Self {
        Self {
            title: Some(transcript.title.clone()),
            messages: Some(transcript.messages.clone()),
        }
    }
}

fn default_owner_id() -> String {
    DEFAULT_OWNER_ID.to_string()
}

fn normalize_owner(owner_id: String) -> String {
    let trimmed = owner_id.trim();
    if trimmed.is_empty() {
        default_owner_id()
    } else {
        trimmed.to_string()
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> Message {
        Message::user(text).unwrap()
    }

    fn model(text: &str) -> Message {
        Message::model(text).unwrap()
    }

    #[test]
    fn short_first_prompt_keeps_whole_text_plus_marker() {
        assert_eq!(derive_title(&[user("Hello"), model("Hi there")]), "Hello...");
    }

    #[test]
    fn long_first_prompt_is_cut_at_thirty_characters() {
        let prompt = "Explain the borrow checker to me like I am five years old";
        let title = derive_title(&[user(prompt)]);
        assert_eq!(title, "Explain the borrow checker to ...");
        assert_eq!(title.chars().count(), TITLE_PREFIX_CHARS + 3);
    }

    #[test]
    fn title_counts_characters_not_bytes() {
        let prompt = "ñ".repeat(40);
        let title = derive_title(&[user(&prompt)]);
        assert_eq!(title, format!("{}...", "ñ".repeat(30)));
    }

    #[test]
    fn title_prefers_first_user_turn_and_falls_back_to_default() {
        assert_eq!(derive_title(&[model("greeting"), user("question")]), "question...");
        assert_eq!(derive_title(&[]), DEFAULT_TRANSCRIPT_TITLE);
    }

    #[test]
    fn derived_title_is_never_recomputed() {
        let mut transcript = Transcript::draft("anonymous");
        transcript.append(user("first prompt"));
        assert_eq!(transcript.derive_title(), "first prompt...");

        transcript.append(user("another prompt"));
        assert_eq!(transcript.derive_title(), "first prompt...");
    }

    #[test]
    fn blank_text_and_unknown_roles_are_rejected() {
        assert!(Message::user("   ").unwrap_err().is_validation());

        let document = serde_json::json!({ "role": "assistant", "parts": [{ "text": "hi" }] });
        assert!(serde_json::from_value::<Message>(document).is_err());
    }

    #[test]
    fn message_uses_the_parts_document_shape() {
        let encoded = serde_json::to_value(user("Hello")).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({ "role": "user", "parts": [{ "text": "Hello" }] })
        );

        let split = serde_json::json!({ "role": "model", "parts": [{ "text": "Hi " }, { "text": "there" }] });
        let decoded: Message = serde_json::from_value(split).unwrap();
        assert_eq!(decoded.text(), "Hi there");
    }

    #[test]
    fn patch_overwrites_only_supplied_fields() {
        let mut transcript = Transcript::draft("");
        assert_eq!(transcript.owner_id(), DEFAULT_OWNER_ID);
        transcript.append(user("one"));
        transcript.derive_title();
        let before = transcript.updated_at();

        transcript.apply_patch(TranscriptPatch {
            title: Some("  ".to_string()),
            messages: Some(vec![user("one"), model("two")]),
        });

        assert_eq!(transcript.title(), "one...");
        assert_eq!(transcript.messages().len(), 2);
        assert!(transcript.updated_at() >= before);
    }

    #[test]
    fn summaries_sort_newest_first() {
        let mut older = Transcript::draft("anonymous")
            .into_fallback(ConversationId::parse("a").unwrap())
            .summary()
            .unwrap();
        let newer = Transcript::draft("anonymous")
            .into_fallback(ConversationId::parse("b").unwrap())
            .summary()
            .unwrap();
        older.updated_at = newer.updated_at - chrono::TimeDelta::seconds(5);

        let mut summaries = vec![older.clone(), newer.clone()];
        sort_summaries(&mut summaries);
        assert_eq!(summaries, vec![newer, older]);
    }
}
