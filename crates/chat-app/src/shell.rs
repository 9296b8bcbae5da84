use bestie_storage::{ConversationId, ListingSource, TranscriptSummary};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use super::manager::{ConversationManager, WriteOutcome};

const HELP: &str = "\
Type a message to chat. Commands:
  /new            start a new conversation (the current one is discarded)
  /end            save the current conversation and start a new one
  /list           show saved conversations
  /load <n|id>    open a conversation from the list
  /delete <n|id>  delete a conversation
  /sync           push conversations saved while offline
  /help           show this help
  /quit           save and exit
";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ShellError {
    #[snafu(display("terminal io failed on `{stage}`: {source}"))]
    Io {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type ShellResult<T> = Result<T, ShellError>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Prompt(String),
    New,
    End,
    List,
    Load(String),
    Delete(String),
    Sync,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Self::Prompt(line.to_string()));
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim().to_string()),
            None => (command, String::new()),
        };
        Some(match name {
            "new" => Self::New,
            "end" => Self::End,
            "list" | "ls" => Self::List,
            "load" | "open" => Self::Load(argument),
            "delete" | "rm" => Self::Delete(argument),
            "sync" => Self::Sync,
            "help" | "?" => Self::Help,
            "quit" | "exit" | "q" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        })
    }
}

/// Line-oriented front end over a [`ConversationManager`].
pub struct Shell<R, W> {
    manager: ConversationManager,
    writes: mpsc::UnboundedReceiver<WriteOutcome>,
    input: R,
    output: W,
    last_listing: Vec<TranscriptSummary>,
    announced_degraded: bool,
}

impl<R, W> Shell<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        manager: ConversationManager,
        writes: mpsc::UnboundedReceiver<WriteOutcome>,
        input: R,
        output: W,
    ) -> Self {
        Self {
            manager,
            writes,
            input,
            output,
            last_listing: Vec::new(),
            announced_degraded: false,
        }
    }

    pub fn manager(&self) -> &ConversationManager {
        &self.manager
    }

    pub fn output(&self) -> &W {
        &self.output
    }

    /// Reads commands until `/quit` or end of input. The active conversation
    /// is saved on the way out.
    pub async fn run(&mut self) -> ShellResult<()> {
        self.write("bestie: your AI mate. /help lists commands.\n")
            .await?;

        let mut line = String::new();
        loop {
            self.write("you> ").await?;
            line.clear();
            let read = self
                .input
                .read_line(&mut line)
                .await
                .context(IoSnafu { stage: "read-line" })?;
            if read == 0 {
                self.write("\n").await?;
                break;
            }

            let Some(command) = Command::parse(&line) else {
                continue;
            };
            if command == Command::Quit {
                break;
            }
            self.execute(command).await?;
            self.drain_write_outcomes();
            self.announce_degraded().await?;
        }

        self.end_conversation().await?;
        self.drain_write_outcomes();
        self.write("bye\n").await
    }

    async fn execute(&mut self, command: Command) -> ShellResult<()> {
        match command {
            Command::Prompt(text) => match self.manager.send_prompt(&text).await {
                Ok(reply) => self.write(&format!("bestie> {}\n", reply.text())).await,
                Err(error) => self.write(&format!("error: {error}\n")).await,
            },
            Command::New => {
                self.manager.new_conversation();
                self.write("started a new conversation\n").await
            }
            Command::End => self.end_conversation().await,
            Command::List => self.list().await,
            Command::Load(argument) => {
                let Some(id) = self.resolve_id(&argument).await? else {
                    return Ok(());
                };
                match self.manager.load_conversation(&id).await {
                    Ok(transcript) => {
                        let mut rendered = format!("-- {} --\n", transcript.title());
                        for message in transcript.messages() {
                            rendered.push_str(&format!("{}> {}\n", message.role(), message.text()));
                        }
                        self.write(&rendered).await
                    }
                    Err(error) => self.write(&format!("error: {error}\n")).await,
                }
            }
            Command::Delete(argument) => {
                let Some(id) = self.resolve_id(&argument).await? else {
                    return Ok(());
                };
                match self.manager.delete_conversation(&id).await {
                    Ok(true) => {
                        self.last_listing.retain(|summary| summary.id != id);
                        self.write(&format!("deleted {id}\n")).await
                    }
                    Ok(false) => self.write(&format!("no conversation {id}\n")).await,
                    Err(error) => self.write(&format!("error: {error}\n")).await,
                }
            }
            Command::Sync => match self.manager.reconcile().await {
                Ok(report) => {
                    let mut rendered = format!("synced {} conversation(s)", report.synced.len());
                    if !report.updated.is_empty() {
                        rendered.push_str(&format!(", {} updated", report.updated.len()));
                    }
                    if report.pending > 0 {
                        rendered.push_str(&format!(", {} still waiting", report.pending));
                    }
                    if !report.failed.is_empty() {
                        rendered.push_str(&format!(", {} rejected", report.failed.len()));
                    }
                    rendered.push('\n');
                    if report.pending == 0 {
                        self.announced_degraded = false;
                    }
                    self.write(&rendered).await
                }
                Err(error) => self.write(&format!("error: {error}\n")).await,
            },
            Command::Help => self.write(HELP).await,
            Command::Unknown(name) => {
                self.write(&format!("unknown command /{name}; try /help\n"))
                    .await
            }
            Command::Quit => Ok(()),
        }
    }

    async fn end_conversation(&mut self) -> ShellResult<()> {
        match self.manager.finalize_conversation().await {
            Ok(Some(summary)) => {
                let note = if summary.fallback_only {
                    " (kept locally)"
                } else {
                    ""
                };
                self.write(&format!(
                    "saved \"{}\" as {}{note}\n",
                    summary.title, summary.id
                ))
                .await
            }
            Ok(None) => Ok(()),
            Err(error) => self.write(&format!("error: {error}\n")).await,
        }
    }

    async fn list(&mut self) -> ShellResult<()> {
        let listing = self.manager.list_conversations().await;
        let mut rendered = String::new();
        if listing.source == ListingSource::FallbackCache
            && let Some(warning) = &listing.warning
        {
            rendered.push_str(&format!("({warning})\n"));
        }
        if listing.summaries.is_empty() {
            rendered.push_str("no saved conversations\n");
        }
        for (index, summary) in listing.summaries.iter().enumerate() {
            rendered.push_str(&format!(
                "{:>3}. {}  [{}]  {}\n",
                index + 1,
                summary.title,
                summary.id,
                summary.updated_at.format("%Y-%m-%d %H:%M")
            ));
        }
        self.last_listing = listing.summaries;
        self.write(&rendered).await
    }

    /// Accepts a 1-based index into the last `/list` output or a raw id.
    async fn resolve_id(&mut self, argument: &str) -> ShellResult<Option<ConversationId>> {
        if argument.is_empty() {
            self.write("missing conversation number or id\n").await?;
            return Ok(None);
        }
        if let Ok(index) = argument.parse::<usize>()
            && let Some(summary) = index
                .checked_sub(1)
                .and_then(|index| self.last_listing.get(index))
        {
            return Ok(Some(summary.id.clone()));
        }
        match ConversationId::parse(argument) {
            Ok(id) => Ok(Some(id)),
            Err(error) => {
                self.write(&format!("error: {error}\n")).await?;
                Ok(None)
            }
        }
    }

    async fn announce_degraded(&mut self) -> ShellResult<()> {
        if self.manager.is_degraded() && !self.announced_degraded {
            self.announced_degraded = true;
            self.write("(offline: conversations are kept locally until /sync succeeds)\n")
                .await?;
        }
        Ok(())
    }

    fn drain_write_outcomes(&mut self) {
        while let Ok(outcome) = self.writes.try_recv() {
            tracing::debug!(
                id = %outcome.id,
                message_count = outcome.message_count,
                ok = outcome.result.is_ok(),
                "write-through settled"
            );
        }
    }

    async fn write(&mut self, text: &str) -> ShellResult<()> {
        self.output
            .write_all(text.as_bytes())
            .await
            .context(IoSnafu { stage: "write" })?;
        self.output.flush().await.context(IoSnafu { stage: "flush" })
    }
}
