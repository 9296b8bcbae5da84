use std::sync::Arc;

use bestie_llm::{BoxFuture, ChatSession, ChatTurn, ProviderResult};
use bestie_storage::{
    ConversationId, Listing, Message, PersistenceGateway, ReconcileReport, Role, StorageError,
    StorageResult, Transcript, TranscriptPatch, TranscriptSummary,
};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// Draft with no messages.
    Empty,
    Active,
    /// The previous transcript is being persisted; a fresh draft is already active.
    Finalizing,
}

/// Identity of an in-flight reply. `epoch` changes whenever the active
/// transcript is replaced, so replies for an abandoned transcript are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTarget {
    pub epoch: u64,
    pub session: u64,
}

/// A chat request that has been issued but not yet applied.
pub struct PendingReply {
    target: ReplyTarget,
    request: BoxFuture<'static, ProviderResult<String>>,
}

impl PendingReply {
    pub fn target(&self) -> ReplyTarget {
        self.target
    }

    pub async fn resolve(self) -> ReplyOutcome {
        ReplyOutcome {
            target: self.target,
            result: self.request.await,
        }
    }
}

#[derive(Debug)]
pub struct ReplyOutcome {
    pub target: ReplyTarget,
    pub result: ProviderResult<String>,
}

/// A transcript taken out of the manager for persistence.
pub struct PendingFinalize {
    gateway: Arc<PersistenceGateway>,
    transcript: Transcript,
}

impl PendingFinalize {
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub async fn persist(self) -> FinalizeOutcome {
        let result = match self.transcript.id() {
            Some(id) => {
                self.gateway
                    .update(id, TranscriptPatch::full(&self.transcript))
                    .await
            }
            None => self.gateway.create(&self.transcript).await,
        };
        FinalizeOutcome {
            transcript: self.transcript,
            result,
        }
    }
}

#[derive(Debug)]
pub struct FinalizeOutcome {
    pub transcript: Transcript,
    pub result: StorageResult<Transcript>,
}

/// Result of one background write-through.
#[derive(Debug)]
pub struct WriteOutcome {
    pub id: ConversationId,
    pub message_count: usize,
    pub result: StorageResult<()>,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ManagerError {
    #[snafu(display("a reply is still being generated"))]
    Busy { stage: &'static str },
    #[snafu(display("reply for {target:?} no longer belongs to the active conversation"))]
    StaleReply {
        stage: &'static str,
        target: ReplyTarget,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

impl ManagerError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage { source, .. } if source.is_not_found())
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;

/// Owns the active transcript and drives it through prompt, reply and
/// persistence.
pub struct ConversationManager {
    gateway: Arc<PersistenceGateway>,
    chat: Arc<dyn ChatSession>,
    owner_id: String,
    active: Transcript,
    state: ConversationState,
    generating: Option<ReplyTarget>,
    epoch: u64,
    next_session: u64,
    write_tx: mpsc::UnboundedSender<WriteOutcome>,
}

impl ConversationManager {
    /// Returns the manager and the receiver for background write outcomes.
    pub fn new(
        gateway: Arc<PersistenceGateway>,
        chat: Arc<dyn ChatSession>,
        owner_id: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<WriteOutcome>) {
        let owner_id = owner_id.into();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let manager = Self {
            gateway,
            chat,
            active: Transcript::draft(owner_id.clone()),
            owner_id,
            state: ConversationState::Empty,
            generating: None,
            epoch: 0,
            next_session: 0,
            write_tx,
        };
        (manager, write_rx)
    }

    pub fn active(&self) -> &Transcript {
        &self.active
    }

    pub fn state(&self) -> ConversationState {
        self.state
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn is_generating(&self) -> bool {
        self.generating.is_some()
    }

    pub fn is_degraded(&self) -> bool {
        self.gateway.is_degraded()
    }

    /// Appends the user message and issues the chat request. The reply is
    /// applied later with [`apply_reply`](Self::apply_reply).
    pub fn begin_prompt(&mut self, text: &str) -> ManagerResult<PendingReply> {
        ensure!(
            self.generating.is_none(),
            BusySnafu {
                stage: "begin-prompt",
            }
        );

        // Blank-only input is rejected; anything else is kept exactly as typed.
        let prompt = text.to_string();
        let message = Message::user(prompt.clone()).context(StorageSnafu {
            stage: "begin-prompt-validate",
        })?;
        let history = self
            .active
            .messages()
            .iter()
            .map(to_chat_turn)
            .collect::<Vec<_>>();

        self.active.append(message);
        self.spawn_write_through();

        self.next_session += 1;
        let target = ReplyTarget {
            epoch: self.epoch,
            session: self.next_session,
        };
        self.generating = Some(target);
        tracing::debug!(
            epoch = target.epoch,
            session = target.session,
            history_len = history.len(),
            "chat request issued"
        );

        Ok(PendingReply {
            target,
            request: self.chat.send(prompt, history),
        })
    }

    /// Appends the reply, or an `Error: ...` model message when the request
    /// failed. Returns `None` and changes nothing when the reply is stale.
    pub fn apply_reply(&mut self, outcome: ReplyOutcome) -> Option<Message> {
        if self.generating != Some(outcome.target) {
            tracing::debug!(
                reply = ?outcome.target,
                current = ?self.generating,
                "dropping stale chat reply"
            );
            return None;
        }
        self.generating = None;

        let message = match outcome.result {
            Ok(text) => Message::model(text).unwrap_or_else(|error| {
                tracing::warn!(error = %error, "chat reply rejected");
                Message::error_reply(error)
            }),
            Err(error) => {
                tracing::warn!(
                    stage = error.stage(),
                    error = %error,
                    "chat request failed"
                );
                Message::error_reply(error)
            }
        };

        self.active.append(message.clone());
        if self.state == ConversationState::Empty {
            self.state = ConversationState::Active;
        }
        self.spawn_write_through();
        Some(message)
    }

    /// Prompt and reply in one call.
    pub async fn send_prompt(&mut self, text: &str) -> ManagerResult<Message> {
        let pending = self.begin_prompt(text)?;
        let target = pending.target();
        let outcome = pending.resolve().await;
        self.apply_reply(outcome).context(StaleReplySnafu {
            stage: "send-prompt-apply",
            target,
        })
    }

    /// Swaps the active transcript for a fresh draft and hands the old one
    /// out for persistence. `None` when there is nothing to save.
    pub fn begin_finalize(&mut self) -> Option<PendingFinalize> {
        if self.active.messages().is_empty() {
            return None;
        }

        let mut transcript = std::mem::replace(
            &mut self.active,
            Transcript::draft(self.owner_id.clone()),
        );
        transcript.derive_title();
        self.advance_epoch();
        self.state = ConversationState::Finalizing;

        Some(PendingFinalize {
            gateway: self.gateway.clone(),
            transcript,
        })
    }

    /// Settles the state after persistence. On failure the transcript is put
    /// back when nothing new was typed in the meantime.
    pub fn complete_finalize(
        &mut self,
        outcome: FinalizeOutcome,
    ) -> ManagerResult<Option<TranscriptSummary>> {
        match outcome.result {
            Ok(saved) => {
                self.state = self.resting_state();
                tracing::info!(
                    id = %saved.id().map(ToString::to_string).unwrap_or_default(),
                    title = saved.title(),
                    fallback_only = saved.is_fallback_only(),
                    "conversation finalized"
                );
                Ok(saved.summary())
            }
            Err(source) => {
                if self.active.messages().is_empty() && self.generating.is_none() {
                    self.active = outcome.transcript;
                    self.advance_epoch();
                }
                self.state = self.resting_state();
                Err(ManagerError::Storage {
                    stage: "complete-finalize",
                    source,
                })
            }
        }
    }

    pub async fn finalize_conversation(&mut self) -> ManagerResult<Option<TranscriptSummary>> {
        let Some(pending) = self.begin_finalize() else {
            return Ok(None);
        };
        let outcome = pending.persist().await;
        self.complete_finalize(outcome)
    }

    /// Replaces the active transcript wholesale.
    pub async fn load_conversation(&mut self, id: &ConversationId) -> ManagerResult<Transcript> {
        let transcript = self.gateway.get(id).await.context(StorageSnafu {
            stage: "load-conversation",
        })?;

        self.active = transcript.clone();
        self.advance_epoch();
        self.state = self.resting_state();
        Ok(transcript)
    }

    pub async fn delete_conversation(&mut self, id: &ConversationId) -> ManagerResult<bool> {
        let removed = self.gateway.delete(id).await.context(StorageSnafu {
            stage: "delete-conversation",
        })?;

        if self.active.id() == Some(id) {
            self.new_conversation();
        }
        Ok(removed)
    }

    /// Abandons the active transcript; an in-flight reply becomes stale.
    pub fn new_conversation(&mut self) {
        self.active = Transcript::draft(self.owner_id.clone());
        self.advance_epoch();
        self.state = ConversationState::Empty;
    }

    pub async fn list_conversations(&self) -> Listing {
        self.gateway.list(&self.owner_id).await
    }

    /// Pushes locally cached transcripts upstream and rebinds the active one
    /// if it was among them.
    pub async fn reconcile(&mut self) -> ManagerResult<ReconcileReport> {
        let report = self.gateway.reconcile().await.context(StorageSnafu {
            stage: "reconcile",
        })?;

        if let Some(active_id) = self.active.id().cloned()
            && let Some(synced) = report
                .synced
                .iter()
                .find(|synced| synced.local_id == active_id)
        {
            self.active.mark_synced(synced.primary_id.clone());
        }
        Ok(report)
    }

    fn advance_epoch(&mut self) {
        self.epoch += 1;
        self.generating = None;
    }

    fn resting_state(&self) -> ConversationState {
        if self.active.messages().is_empty() {
            ConversationState::Empty
        } else {
            ConversationState::Active
        }
    }

    /// Fire-and-forget update carrying the full message list. Failures are
    /// logged and reported on the outcome channel, never rolled back.
    fn spawn_write_through(&self) {
        let Some(id) = self.active.id().cloned() else {
            return;
        };

        let gateway = self.gateway.clone();
        let write_tx = self.write_tx.clone();
        let messages = self.active.messages().to_vec();
        let message_count = messages.len();

        tokio::spawn(async move {
            let result = gateway
                .update(&id, TranscriptPatch::messages(messages))
                .await
                .map(|_| ());
            if let Err(error) = &result {
                tracing::warn!(
                    id = %id,
                    message_count,
                    error = %error,
                    "background conversation write failed"
                );
            }
            let _ = write_tx.send(WriteOutcome {
                id,
                message_count,
                result,
            });
        });
    }
}

fn to_chat_turn(message: &Message) -> ChatTurn {
    match message.role() {
        Role::User => ChatTurn::user(message.text()),
        Role::Model => ChatTurn::model(message.text()),
    }
}
