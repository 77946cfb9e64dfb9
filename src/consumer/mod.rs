// Copyright 2024. The Tari Project

//! Reconnecting event stream consumer
//!
//! Keeps one live event stream open against the server, hands typed frames to
//! caller callbacks and reconnects on its own after transport failures. A
//! consumer owns at most one stream and at most one pending retry at a time:
//! both live inside a single driver task, and a new driver is only started
//! after the previous one has finished.

pub mod http_source;
pub mod reconnect;
pub mod session_binding;
pub mod sse_codec;

pub use http_source::HttpEventSource;
pub use reconnect::{BackoffStrategy, ReconnectPolicy};
pub use session_binding::SessionBoundConsumer;
pub use sse_codec::{SseCodec, SseMessage};

use crate::realtime::EventFrame;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "teamup::realtime::consumer";

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(reqwest::StatusCode),
    #[error("unexpected content type {0:?}")]
    ContentType(Option<String>),
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// `data` text of each message on an open event stream
pub type FrameStream = BoxStream<'static, Result<String, ConsumerError>>;

/// Opens event streams. Dropping the returned stream closes it.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn open(&self) -> Result<FrameStream, ConsumerError>;
}

type MessageCallback = Arc<dyn Fn(Value) + Send + Sync>;
type UpdateCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks invoked for frames received on the stream
#[derive(Clone, Default)]
pub struct EventHandlers {
    on_new_message: Option<MessageCallback>,
    on_conversation_update: Option<UpdateCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_new_message", &self.on_new_message.is_some())
            .field("on_conversation_update", &self.on_conversation_update.is_some())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_new_message(mut self, callback: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_new_message = Some(Arc::new(callback));
        self
    }

    pub fn on_conversation_update(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_conversation_update = Some(Arc::new(callback));
        self
    }

    /// Parse one frame and run the matching callback. Malformed frames are
    /// logged and dropped.
    pub fn dispatch(&self, data: &str) {
        let frame = match EventFrame::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Dropping frame: {}", e);
                return;
            }
        };

        match frame {
            EventFrame::Connected { user_id } => {
                log::debug!(target: LOG_TARGET, "Stream acknowledged for user {:?}", user_id);
            }
            EventFrame::Heartbeat => {}
            EventFrame::NewMessage { message } => {
                if let (Some(callback), Some(message)) = (&self.on_new_message, message) {
                    run_callback("new_message", || callback(message));
                }
            }
            EventFrame::ConversationUpdate => {
                if let Some(callback) = &self.on_conversation_update {
                    run_callback("conversation_update", || callback());
                }
            }
        }
    }
}

/// A panicking callback loses its frame, not the stream
fn run_callback(event_type: &str, callback: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|reason| reason.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        log::error!(target: LOG_TARGET, "Callback for {} panicked: {}", event_type, reason);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not connected and not trying to be
    Idle,
    Connecting,
    Open,
    /// Stream lost, next attempt scheduled after `delay`
    Reconnecting { attempt: u32, delay: Duration },
    /// The reconnect policy ran out of attempts
    Exhausted,
}

struct Driver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Keeps one event stream open and dispatches its frames.
///
/// Dropping the consumer closes the stream and cancels any pending retry.
pub struct EventConsumer {
    source: Arc<dyn EventSource>,
    handlers: Arc<EventHandlers>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConsumerState>>,
    driver: Option<Driver>,
}

impl EventConsumer {
    pub fn new(source: Arc<dyn EventSource>, handlers: EventHandlers, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            source,
            handlers: Arc::new(handlers),
            policy,
            state: Arc::new(state),
            driver: None,
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.driver.as_ref().is_some_and(|driver| !driver.task.is_finished())
    }

    /// Close the current stream and pending retry if any, then open a new stream.
    pub async fn connect(&mut self) {
        self.stop_driver().await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(drive(
            self.source.clone(),
            self.handlers.clone(),
            self.policy.clone(),
            self.state.clone(),
            cancel.clone(),
        ));
        self.driver = Some(Driver { cancel, task });
    }

    /// Close the current stream and cancel any pending retry. Idempotent.
    pub async fn disconnect(&mut self) {
        if self.stop_driver().await {
            log::info!(target: LOG_TARGET, "Event stream disconnected");
        }
        self.state.send_replace(ConsumerState::Idle);
    }

    async fn stop_driver(&mut self) -> bool {
        let Some(driver) = self.driver.take() else {
            return false;
        };
        driver.cancel.cancel();
        if let Err(e) = driver.task.await {
            if e.is_panic() {
                log::error!(target: LOG_TARGET, "Event stream driver panicked: {}", e);
            }
        }
        true
    }
}

impl Drop for EventConsumer {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.cancel.cancel();
            driver.task.abort();
        }
    }
}

async fn drive(
    source: Arc<dyn EventSource>,
    handlers: Arc<EventHandlers>,
    policy: ReconnectPolicy,
    state: Arc<watch::Sender<ConsumerState>>,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        state.send_replace(ConsumerState::Connecting);
        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = source.open() => opened,
        };

        match opened {
            Ok(mut frames) => {
                log::info!(target: LOG_TARGET, "Event stream opened");
                attempt = 0;
                state.send_replace(ConsumerState::Open);

                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = frames.next() => next,
                    };
                    match next {
                        Some(Ok(data)) => handlers.dispatch(&data),
                        Some(Err(e)) => {
                            log::warn!(target: LOG_TARGET, "Event stream failed: {}", e);
                            break;
                        }
                        None => {
                            log::info!(target: LOG_TARGET, "Event stream closed by server");
                            break;
                        }
                    }
                }
                // `frames` is dropped here, before any retry is scheduled
            }
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Failed to open event stream: {}", e);
            }
        }

        attempt = attempt.saturating_add(1);
        let Some(delay) = policy.delay_for(attempt) else {
            log::error!(target: LOG_TARGET, "Giving up on event stream after {} attempts", attempt - 1);
            state.send_replace(ConsumerState::Exhausted);
            return;
        };

        log::debug!(target: LOG_TARGET, "Reconnecting in {:?} (attempt {})", delay, attempt);
        state.send_replace(ConsumerState::Reconnecting { attempt, delay });
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
