// Copyright 2024. The Tari Project

//! Connects to a realtime server and logs every notification it receives.
//!
//! Reads `TEAMUP_STREAM_URL`, `TEAMUP_ACCESS_TOKEN` and optionally
//! `TEAMUP_RECONNECT_POLICY` (JSON) from the environment.

use anyhow::Result;
use std::sync::Arc;
use teamup_realtime::{
    config::ConsumerConfig,
    consumer::{ConsumerState, EventConsumer, EventHandlers, HttpEventSource},
    logging,
};

const LOG_TARGET: &str = "teamup::realtime::listen";

#[tokio::main]
async fn main() -> Result<()> {
    let level = std::env::var("TEAMUP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    logging::init_logging(&level, None)?;

    let config = ConsumerConfig::from_env()?;
    let mut source = HttpEventSource::new(config.stream_url.clone());
    match config.access_token {
        Some(token) => source = source.with_access_token(token),
        None => log::warn!(target: LOG_TARGET, "TEAMUP_ACCESS_TOKEN not set, the server will refuse the stream"),
    }

    let handlers = EventHandlers::new()
        .on_new_message(|message| {
            log::info!(target: LOG_TARGET, "New message: {}", message);
        })
        .on_conversation_update(|| {
            log::info!(target: LOG_TARGET, "Conversations changed");
        });

    let mut consumer = EventConsumer::new(Arc::new(source), handlers, config.reconnect);
    let mut state = consumer.subscribe_state();
    consumer.connect().await;
    log::info!(target: LOG_TARGET, "Listening on {}", config.stream_url);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                log::debug!(target: LOG_TARGET, "Consumer state: {:?}", current);
                if current == ConsumerState::Exhausted {
                    log::error!(target: LOG_TARGET, "Server unreachable, giving up");
                    break;
                }
            }
        }
    }

    consumer.disconnect().await;
    Ok(())
}
