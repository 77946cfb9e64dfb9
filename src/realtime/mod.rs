// Copyright 2024. The Tari Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Server half of the realtime channel
//!
//! Authenticated clients hold one server-sent event stream each. The rest of
//! the application pushes chat notifications to a user through the
//! [`RealtimePublisher`] handed out at start-up.

pub mod connection;
pub mod frame;
pub mod registry;
pub mod sse_server;


pub use connection::{ConnectionId, ConnectionStats, PushFailure, PushOutcome};
pub use frame::{EventFrame, FrameError};
pub use registry::{BroadcastRegistry, RegistrySettings};
pub use sse_server::{build_router, AppState, RealtimeServer};

use crate::{config::RealtimeConfig, session::JwtSessionVerifier};
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

const LOG_TARGET: &str = "teamup::realtime";

/// Push entry points used by message and conversation handlers
pub trait RealtimePublisher: Send + Sync {
    /// Notify `user_id` that a message was written for them
    fn push_message(&self, user_id: &str, message: Value) -> PushOutcome;

    /// Tell `user_id` to refetch their conversation list
    fn push_conversation_update(&self, user_id: &str) -> PushOutcome;
}

/// Build the registry and session verifier from `config` and start serving.
///
/// The returned server keeps running until [`RealtimeServer::stop`] is called.
pub async fn start_realtime_server(config: &RealtimeConfig) -> Result<RealtimeServer> {
    config.validate()?;

    let registry = BroadcastRegistry::new(config.registry_settings());
    let verifier = Arc::new(JwtSessionVerifier::new(
        config.jwt_secret.as_bytes(),
        config.jwt_audience.as_deref(),
    ));

    let mut server = RealtimeServer::new(AppState::new(registry, verifier), config.bind_address.clone());
    server.start().await?;

    log::info!(target: LOG_TARGET, "Realtime server started successfully");
    Ok(server)
}

/// Serve until Ctrl-C, then close every stream and shut down gracefully
pub async fn serve(config: &RealtimeConfig) -> Result<()> {
    let mut server = start_realtime_server(config).await?;

    tokio::signal::ctrl_c().await?;
    log::info!(target: LOG_TARGET, "Shutdown requested");

    server.stop().await
}
