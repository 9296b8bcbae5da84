use std::future::Future;

use snafu::ResultExt;
use tokio::net::TcpListener;

mod envelope;
pub mod error;
mod routes;

pub use envelope::Envelope;
pub use error::{ServerError, ServerResult};
pub use routes::{SharedStore, router};

use error::ServeSnafu;

/// Serves the conversation REST API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, store: SharedStore, shutdown: F) -> ServerResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr().context(ServeSnafu {
        stage: "serve-local-addr",
    })?;
    tracing::info!(
        addr = %local_addr,
        store = store.name(),
        "conversation api listening"
    );

    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await
        .context(ServeSnafu {
            stage: "serve-run",
        })?;

    tracing::info!("conversation api stopped");
    Ok(())
}
