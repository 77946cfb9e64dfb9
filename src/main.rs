// Copyright 2024. The Tari Project

use anyhow::Result;
use teamup_realtime::{config::RealtimeConfig, logging, realtime};

const LOG_TARGET: &str = "teamup::realtime::main";

#[tokio::main]
async fn main() -> Result<()> {
    let config = RealtimeConfig::load().await?;
    logging::init_logging(&config.log_level, config.log_file.as_deref())?;

    log::info!(target: LOG_TARGET, "Starting TeamUp realtime server v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = realtime::serve(&config).await {
        log::error!(target: LOG_TARGET, "Realtime server exited with error: {}", e);
        return Err(e);
    }

    log::info!(target: LOG_TARGET, "Realtime server shut down");
    Ok(())
}
