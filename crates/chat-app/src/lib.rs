pub mod app;
pub mod manager;
pub mod settings;
pub mod shell;

pub use manager::{
    ConversationManager, ConversationState, FinalizeOutcome, ManagerError, ManagerResult,
    PendingFinalize, PendingReply, ReplyOutcome, ReplyTarget, WriteOutcome,
};
pub use settings::{AppSettings, ProviderSettings, SettingsError, SettingsStore};
pub use shell::{Shell, ShellError};
