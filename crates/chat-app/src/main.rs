use std::path::PathBuf;
use std::sync::Arc;

use bestie::app;
use bestie::manager::ConversationManager;
use bestie::settings::{AppSettings, SettingsStore};
use bestie::shell::Shell;
use bestie_storage::SqliteDocumentStore;
use clap::{Parser, Subcommand};
use snafu::{Report, ResultExt, Whatever};
use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "BESTIE_LOG";

#[derive(Debug, Parser)]
#[command(name = "bestie", version, about = "Chat with your AI mate and keep the conversations")]
struct Cli {
    /// Settings file (defaults to the platform config directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat in the terminal (default).
    Chat,
    /// Serve the conversation REST API backed by SQLite.
    Serve {
        /// Address to listen on, e.g. 127.0.0.1:5000.
        #[arg(long)]
        listen: Option<String>,
        /// SQLite database file or `sqlite:` URL.
        #[arg(long)]
        database: Option<String>,
    },
    /// Write the effective settings to the settings file.
    Init,
}

fn main() -> Report<Whatever> {
    Report::capture(|| {
        let cli = Cli::parse();
        init_tracing(matches!(cli.command, Some(Command::Serve { .. })));

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .whatever_context("failed to start the async runtime")?;
        runtime.block_on(run(cli))
    })
}

fn init_tracing(serving: bool) {
    // The chat shell shares the terminal with log output, so it stays quiet by default.
    let default_directive = if serving { "info" } else { "warn" };
    let env_filter = match EnvFilter::try_from_env(LOG_ENV_VAR) {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(default_directive),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), Whatever> {
    let store = match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };
    let settings = store.settings();
    tracing::debug!(path = %store.config_path().display(), "settings loaded");

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(&settings).await,
        Command::Serve { listen, database } => run_server(&settings, listen, database).await,
        Command::Init => {
            store
                .update((*settings).clone())
                .whatever_context("failed to write settings")?;
            println!("settings written to {}", store.config_path().display());
            Ok(())
        }
    }
}

async fn run_chat(settings: &AppSettings) -> Result<(), Whatever> {
    let chat = app::chat_session(settings).whatever_context(
        "chat provider unavailable; set provider.api_key in the settings file or BESTIE_PROVIDER__API_KEY",
    )?;
    let gateway = app::gateway(settings).whatever_context("failed to open conversation storage")?;

    let (manager, writes) = ConversationManager::new(gateway, chat, settings.owner_id.clone());
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let mut shell = Shell::new(manager, writes, input, tokio::io::stdout());
    shell.run().await.whatever_context("terminal session failed")
}

async fn run_server(
    settings: &AppSettings,
    listen: Option<String>,
    database: Option<String>,
) -> Result<(), Whatever> {
    let listen = listen.unwrap_or_else(|| settings.listen_addr.clone());
    let database =
        database.unwrap_or_else(|| settings.database_path().display().to_string());

    let store = SqliteDocumentStore::open(&database)
        .await
        .with_whatever_context(|_| format!("failed to open database {database}"))?;
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_whatever_context(|_| format!("failed to bind {listen}"))?;

    let served = bestie_server::serve(listener, Arc::new(store.clone()), shutdown_signal()).await;
    store.close().await;
    served.whatever_context("conversation api stopped with an error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %error, "failed to install CTRL+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => tracing::warn!(error = %error, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
