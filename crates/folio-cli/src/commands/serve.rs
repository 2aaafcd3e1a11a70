//! `folio serve`: run the replenishment worker and validity watcher until Ctrl-C.

use anyhow::{Context, Result};
use tracing::info;

use super::{CmdContext, EXIT_SUCCESS};

pub async fn cmd_serve(ctx: &CmdContext) -> Result<i32> {
    let engine = ctx.open_engine()?;
    let handle = engine.start()?;
    info!(
        database = %ctx.config.database_path.display(),
        "serving; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown requested");
    handle.shutdown().await;
    Ok(EXIT_SUCCESS)
}
