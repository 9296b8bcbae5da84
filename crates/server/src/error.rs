use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bestie_storage::StorageError;
use snafu::Snafu;

use super::envelope::Envelope;

pub type ServerResult<T> = Result<T, ServerError>;

/// Handler failures. Storage internals are logged and answered with a
/// generic message so paths and SQL never reach the client.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ServerError {
    #[snafu(display("conversation '{id}' was not found"))]
    NotFound { stage: &'static str, id: String },
    #[snafu(display("{details}"))]
    BadRequest {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("http server failed: {source}"))]
    Serve {
        stage: &'static str,
        source: std::io::Error,
    },
}

impl ServerError {
    /// Sorts a store failure into the status family it belongs to.
    pub(crate) fn from_storage(stage: &'static str, error: StorageError) -> Self {
        match error {
            StorageError::NotFound { id, .. } => Self::NotFound { stage, id },
            error if error.is_validation() => Self::BadRequest {
                stage,
                details: error.to_string(),
            },
            source => Self::Storage { stage, source },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Storage { .. } | Self::Serve { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::NotFound { .. } => "Conversation not found".to_string(),
            Self::BadRequest { details, .. } => details.clone(),
            Self::Storage { stage, source } => {
                tracing::error!(stage, error = %source, "conversation store failure");
                "Internal server error".to_string()
            }
            Self::Serve { stage, source } => {
                tracing::error!(stage, error = %source, "http server failure");
                "Internal server error".to_string()
            }
        };
        (status, Json(Envelope::<()>::failure(message))).into_response()
    }
}
