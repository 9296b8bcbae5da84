use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("storage entity '{entity}' with id '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("{store} store is unreachable on `{stage}`: {details}"))]
    StoreUnreachable {
        stage: &'static str,
        store: String,
        details: String,
    },
    #[snafu(display("invalid conversation data on `{stage}`: {details}"))]
    Validation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("conversation id '{raw}' is invalid"))]
    InvalidId { stage: &'static str, raw: String },
    #[snafu(display("storage invariant violation: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to create sqlite directory at {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse sqlite connection URL '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to connect sqlite database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("failed to run sqlite migrations"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("sqlite query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("failed to encode conversation document on `{stage}`: {source}"))]
    EncodeDocument {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode conversation document on `{stage}`: {source}"))]
    DecodeDocument {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to build http client for {base_url}"))]
    BuildHttpClient {
        stage: &'static str,
        base_url: String,
        source: reqwest::Error,
    },
    #[snafu(display("failed to create local store directory at {path}"))]
    CreateLocalStoreDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to read local store from {path}"))]
    ReadLocalStore {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write local store to {path}"))]
    WriteLocalStore {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to replace local store {path}"))]
    ReplaceLocalStore {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::NotFound { stage, .. }
            | Self::StoreUnreachable { stage, .. }
            | Self::Validation { stage, .. }
            | Self::InvalidId { stage, .. }
            | Self::InvariantViolation { stage, .. }
            | Self::CreateSqliteDirectory { stage, .. }
            | Self::SqliteConnectOptions { stage, .. }
            | Self::SqliteConnect { stage, .. }
            | Self::SqliteMigrate { stage, .. }
            | Self::SqliteQuery { stage, .. }
            | Self::EncodeDocument { stage, .. }
            | Self::DecodeDocument { stage, .. }
            | Self::BuildHttpClient { stage, .. }
            | Self::CreateLocalStoreDirectory { stage, .. }
            | Self::ReadLocalStore { stage, .. }
            | Self::WriteLocalStore { stage, .. }
            | Self::ReplaceLocalStore { stage, .. } => stage,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Caller-side mistakes that no other store can fix.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::InvalidId { .. })
    }

    /// True for failures of the backing store itself (connection, timeout, IO),
    /// which the gateway answers from the local fallback instead of surfacing.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::StoreUnreachable { .. } | Self::SqliteConnect { .. } => true,
            Self::SqliteQuery { source, .. } => matches!(
                source,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}
