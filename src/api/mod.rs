mod app;
mod app_state;
mod error;

use std::net::SocketAddr;

use color_eyre::eyre::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

pub use self::app::app;
pub use self::app_state::AppState;
use crate::config::HttpConfig;

/// Serves the ops endpoints until cancelled
#[instrument(name = "api", skip(state, token), fields(port = config.port))]
pub async fn start(state: AppState, config: HttpConfig, token: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    info!("closing");
    Ok(())
}
