// Copyright 2024. The Tari Project

use super::{
    connection::{write_frame, ConnectionEntry, ConnectionId, ConnectionStats, PushFailure, PushOutcome},
    frame::EventFrame,
    RealtimePublisher,
};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "teamup::realtime::registry";

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Time between heartbeat frames on every open stream
    pub heartbeat_interval: Duration,
    /// Frames buffered per stream before the client counts as stalled
    pub stream_buffer: usize,
    /// Close the previous stream of a user who opens a second one. Off by
    /// default: the displaced stream stays open until its client goes away.
    pub close_displaced_streams: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stream_buffer: DEFAULT_STREAM_BUFFER,
            close_displaced_streams: false,
        }
    }
}

struct RegistryInner {
    connections: Mutex<HashMap<String, ConnectionEntry>>,
    settings: RegistrySettings,
    /// Parent of every heartbeat token, including those of displaced streams
    shutdown: CancellationToken,
}

/// Maps each connected user to their one open event stream.
///
/// Built once at server start and handed to every handler that needs to push.
/// Cloning is cheap and all clones share the same map. The map lives in this
/// process only; pushes never reach users connected to another instance.
#[derive(Clone)]
pub struct BroadcastRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}

impl BroadcastRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: Mutex::new(HashMap::new()),
                settings,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.inner.settings
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<String, ConnectionEntry>> {
        // Entries stay consistent even if a holder panicked: every critical
        // section is a single map operation.
        self.inner.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the channel for a new stream, queue the `connected` frame on it
    /// and register it for `user_id`. `None` once the registry is shut down.
    pub fn open_stream(&self, user_id: &str) -> Option<(ConnectionId, mpsc::Receiver<EventFrame>)> {
        let (sender, receiver) = mpsc::channel(self.inner.settings.stream_buffer.max(1));
        // Fresh channel with room for at least one frame, cannot fail
        let _ = write_frame(&sender, EventFrame::connected(user_id));
        let connection_id = self.register(user_id, sender)?;
        Some((connection_id, receiver))
    }

    /// Store `sender` as the stream of `user_id`, replacing any previous one,
    /// and start its heartbeat.
    ///
    /// After [`shutdown`](Self::shutdown) nothing is stored: `sender` is
    /// dropped, which ends its stream, and `None` is returned.
    pub fn register(&self, user_id: &str, sender: mpsc::Sender<EventFrame>) -> Option<ConnectionId> {
        let heartbeat_cancel = self.inner.shutdown.child_token();
        let heartbeat_sender = sender.clone();
        let (connection_id, entry) = ConnectionEntry::new(sender, heartbeat_cancel.clone());

        let displaced = {
            let mut connections = self.connections();
            // shutdown() cancels while holding the map lock
            if self.inner.shutdown.is_cancelled() {
                log::debug!(target: LOG_TARGET, "Refused stream for user {}, registry is shut down", user_id);
                return None;
            }
            connections.insert(user_id.to_string(), entry)
        };
        if let Some(displaced) = displaced {
            if self.inner.settings.close_displaced_streams {
                log::info!(target: LOG_TARGET, "Closing displaced stream {} of user {}", displaced.id(), user_id);
                displaced.close();
            } else {
                log::warn!(
                    target: LOG_TARGET,
                    "User {} opened a second stream, previous stream {} is no longer tracked but stays open",
                    user_id,
                    displaced.id()
                );
            }
        }

        self.spawn_heartbeat(user_id.to_string(), connection_id, heartbeat_sender, heartbeat_cancel);
        log::info!(target: LOG_TARGET, "Registered stream {} for user {}", connection_id, user_id);
        Some(connection_id)
    }

    /// Remove the stream of `user_id` if there is one. Idempotent.
    pub fn unregister(&self, user_id: &str) {
        let removed = self.connections().remove(user_id);
        if let Some(entry) = removed {
            entry.close();
            log::info!(target: LOG_TARGET, "Unregistered stream {} for user {}", entry.id(), user_id);
        }
    }

    /// Remove the stream of `user_id` only if it is still `connection_id`.
    ///
    /// A connection that has been replaced must not evict its replacement when
    /// it goes away.
    pub fn release(&self, user_id: &str, connection_id: ConnectionId) -> bool {
        let mut connections = self.connections();
        let is_current = connections
            .get(user_id)
            .map_or(false, |entry| entry.id() == connection_id);
        if !is_current {
            return false;
        }

        if let Some(entry) = connections.remove(user_id) {
            entry.close();
        }
        drop(connections);
        log::info!(target: LOG_TARGET, "Released stream {} for user {}", connection_id, user_id);
        true
    }

    /// Close every stream, displaced ones included. Terminal: later
    /// registrations are refused.
    pub fn shutdown(&self) {
        let mut connections = self.connections();
        self.inner.shutdown.cancel();
        let drained: Vec<_> = connections.drain().collect();
        drop(connections);
        for (user_id, entry) in &drained {
            entry.close();
            log::debug!(target: LOG_TARGET, "Closed stream {} of user {} on shutdown", entry.id(), user_id);
        }
        log::info!(target: LOG_TARGET, "Registry shut down, {} streams closed", drained.len());
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Push a `new_message` frame carrying `message` to `user_id`
    pub fn push_message(&self, user_id: &str, message: Value) -> PushOutcome {
        self.push(user_id, EventFrame::new_message(message))
    }

    /// Push a `conversation_update` frame to `user_id`
    pub fn push_conversation_update(&self, user_id: &str) -> PushOutcome {
        self.push(user_id, EventFrame::ConversationUpdate)
    }

    fn push(&self, user_id: &str, frame: EventFrame) -> PushOutcome {
        let event_type = frame.event_type();
        let mut connections = self.connections();
        let Some(entry) = connections.get_mut(user_id) else {
            log::trace!(target: LOG_TARGET, "No stream for user {}, dropping {}", user_id, event_type);
            return PushOutcome::NoTarget;
        };

        match entry.write(frame) {
            Ok(()) => {
                log::debug!(target: LOG_TARGET, "Pushed {} to user {}", event_type, user_id);
                PushOutcome::Delivered
            }
            Err(failure) => {
                if let Some(entry) = connections.remove(user_id) {
                    entry.close();
                }
                drop(connections);
                log::warn!(
                    target: LOG_TARGET,
                    "Failed to push {} to user {} ({}), stream removed",
                    event_type,
                    user_id,
                    failure
                );
                PushOutcome::Failed(failure)
            }
        }
    }

    /// Write `frame` through the registered entry when `connection_id` is
    /// still the current stream of `user_id`. `None` when it is not.
    fn write_if_current(
        &self,
        user_id: &str,
        connection_id: ConnectionId,
        frame: EventFrame,
    ) -> Option<Result<(), PushFailure>> {
        let mut connections = self.connections();
        let entry = connections.get_mut(user_id).filter(|entry| entry.id() == connection_id)?;
        Some(entry.write(frame))
    }

    fn spawn_heartbeat(
        &self,
        user_id: String,
        connection_id: ConnectionId,
        sender: mpsc::Sender<EventFrame>,
        cancel: CancellationToken,
    ) {
        let registry = self.clone();
        let period = self.inner.settings.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let result = registry
                            .write_if_current(&user_id, connection_id, EventFrame::Heartbeat)
                            .unwrap_or_else(|| write_frame(&sender, EventFrame::Heartbeat));

                        if let Err(failure) = result {
                            log::debug!(
                                target: LOG_TARGET,
                                "Heartbeat failed on stream {} of user {}: {}",
                                connection_id,
                                user_id,
                                failure
                            );
                            cancel.cancel();
                            registry.release(&user_id, connection_id);
                            break;
                        }
                    }
                }
            }

            log::trace!(target: LOG_TARGET, "Heartbeat stopped for stream {}", connection_id);
        });
    }

    /// Get the number of users with an open stream
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connections().contains_key(user_id)
    }

    /// Current stream id of `user_id`
    pub fn connection_id(&self, user_id: &str) -> Option<ConnectionId> {
        self.connections().get(user_id).map(ConnectionEntry::id)
    }

    /// List all connected user ids
    pub fn connected_users(&self) -> Vec<String> {
        self.connections().keys().cloned().collect()
    }

    pub fn connection_stats(&self, user_id: &str) -> Option<ConnectionStats> {
        self.connections().get(user_id).map(|entry| entry.stats().clone())
    }
}

impl RealtimePublisher for BroadcastRegistry {
    fn push_message(&self, user_id: &str, message: Value) -> PushOutcome {
        BroadcastRegistry::push_message(self, user_id, message)
    }

    fn push_conversation_update(&self, user_id: &str) -> PushOutcome {
        BroadcastRegistry::push_conversation_update(self, user_id)
    }
}
