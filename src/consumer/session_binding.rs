// Copyright 2024. The Tari Project

use super::{EventConsumer, EventHandlers, EventSource, ReconnectPolicy};
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

const LOG_TARGET: &str = "teamup::realtime::session_binding";

/// Runs an [`EventConsumer`] for as long as a session exists.
///
/// Follows a session channel: a session appearing opens the stream, a
/// different session reopens it with the new credentials, the session going
/// away (or its sender being dropped) closes it. Dropping the guard closes
/// the stream as well.
pub struct SessionBoundConsumer {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionBoundConsumer {
    pub fn spawn<S, F>(
        session: watch::Receiver<Option<S>>,
        make_source: F,
        handlers: EventHandlers,
        policy: ReconnectPolicy,
    ) -> Self
    where
        S: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&S) -> Arc<dyn EventSource> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(follow_session(
            session,
            make_source,
            handlers,
            policy,
            cancel.clone(),
        ));

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Close the stream and wait until it is released
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionBoundConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn follow_session<S, F>(
    mut session: watch::Receiver<Option<S>>,
    make_source: F,
    handlers: EventHandlers,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) where
    S: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&S) -> Arc<dyn EventSource> + Send + 'static,
{
    let mut active: Option<(S, EventConsumer)> = None;

    loop {
        let current = session.borrow_and_update().clone();
        let unchanged = match (&active, &current) {
            (Some((active_session, _)), Some(current)) => active_session == current,
            (None, None) => true,
            _ => false,
        };

        if !unchanged {
            if let Some((_, mut consumer)) = active.take() {
                consumer.disconnect().await;
            }
            if let Some(current) = current {
                log::info!(target: LOG_TARGET, "Session available, opening event stream");
                let mut consumer = EventConsumer::new(make_source(&current), handlers.clone(), policy.clone());
                consumer.connect().await;
                active = Some((current, consumer));
            } else {
                log::info!(target: LOG_TARGET, "Session ended, event stream closed");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = session.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    if let Some((_, mut consumer)) = active.take() {
        consumer.disconnect().await;
    }
}
