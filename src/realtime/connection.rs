// Copyright 2024. The Tari Project

use super::frame::EventFrame;
use chrono::{DateTime, Utc};
use getset::CopyGetters;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifies one stream of one user. A user reconnecting gets a new id.
pub type ConnectionId = Uuid;

/// Why a write onto a connection's stream did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushFailure {
    /// The response body was dropped, the client is gone
    Closed,
    /// The client is not reading fast enough to drain its buffer
    Full,
}

impl std::fmt::Display for PushFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushFailure::Closed => write!(f, "stream closed"),
            PushFailure::Full => write!(f, "stream buffer full"),
        }
    }
}

/// Result of pushing a frame to a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum PushOutcome {
    Delivered,
    /// Nobody is listening for this user. Not an error.
    NoTarget,
    /// A listener existed but the write failed; its entry has been removed.
    Failed(PushFailure),
}

impl PushOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PushOutcome::Delivered)
    }
}

/// Per-connection counters, reported by the registry
#[derive(Debug, Clone, Serialize, CopyGetters)]
pub struct ConnectionStats {
    #[getset(get_copy = "pub")]
    connection_id: ConnectionId,
    #[getset(get_copy = "pub")]
    connected_at: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    frames_sent: u64,
    #[getset(get_copy = "pub")]
    last_activity: DateTime<Utc>,
}

impl ConnectionStats {
    fn new(connection_id: ConnectionId) -> Self {
        let now = Utc::now();
        Self {
            connection_id,
            connected_at: now,
            frames_sent: 0,
            last_activity: now,
        }
    }

    fn record_frame_sent(&mut self) {
        self.frames_sent += 1;
        self.last_activity = Utc::now();
    }

    pub fn connection_duration(&self) -> chrono::Duration {
        Utc::now() - self.connected_at
    }
}

/// One live push channel of one user.
///
/// The sender is the write half of the channel that feeds the HTTP response
/// body. It is never replaced; a new stream means a new entry.
#[derive(Debug)]
pub(crate) struct ConnectionEntry {
    sender: mpsc::Sender<EventFrame>,
    heartbeat_cancel: CancellationToken,
    stats: ConnectionStats,
}

impl ConnectionEntry {
    pub(crate) fn new(
        sender: mpsc::Sender<EventFrame>,
        heartbeat_cancel: CancellationToken,
    ) -> (ConnectionId, Self) {
        let connection_id = Uuid::new_v4();
        let entry = Self {
            sender,
            heartbeat_cancel,
            stats: ConnectionStats::new(connection_id),
        };
        (connection_id, entry)
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.stats.connection_id
    }

    pub(crate) fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Non-blocking write of one frame
    pub(crate) fn write(&mut self, frame: EventFrame) -> Result<(), PushFailure> {
        write_frame(&self.sender, frame)?;
        self.stats.record_frame_sent();
        Ok(())
    }

    /// Stop the heartbeat. Once the heartbeat task has dropped its sender
    /// clone and this entry is dropped, the client's stream ends.
    pub(crate) fn close(&self) {
        self.heartbeat_cancel.cancel();
    }
}

pub(crate) fn write_frame(
    sender: &mpsc::Sender<EventFrame>,
    frame: EventFrame,
) -> Result<(), PushFailure> {
    sender.try_send(frame).map_err(|e| match e {
        mpsc::error::TrySendError::Closed(_) => PushFailure::Closed,
        mpsc::error::TrySendError::Full(_) => PushFailure::Full,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_records_stats() {
        let (tx, mut rx) = mpsc::channel(4);
        let (id, mut entry) = ConnectionEntry::new(tx, CancellationToken::new());

        assert_eq!(entry.id(), id);
        assert_eq!(entry.stats().frames_sent(), 0);

        entry.write(EventFrame::Heartbeat).unwrap();
        entry.write(EventFrame::ConversationUpdate).unwrap();

        assert_eq!(entry.stats().frames_sent(), 2);
        assert!(entry.stats().last_activity() >= entry.stats().connected_at());
        assert_eq!(rx.try_recv().unwrap(), EventFrame::Heartbeat);
        assert_eq!(rx.try_recv().unwrap(), EventFrame::ConversationUpdate);
    }

    #[test]
    fn test_write_reports_closed_and_full() {
        let (tx, rx) = mpsc::channel(1);
        let (_, mut entry) = ConnectionEntry::new(tx, CancellationToken::new());

        entry.write(EventFrame::Heartbeat).unwrap();
        assert_eq!(entry.write(EventFrame::Heartbeat), Err(PushFailure::Full));

        drop(rx);
        assert_eq!(entry.write(EventFrame::Heartbeat), Err(PushFailure::Closed));
        assert_eq!(entry.stats().frames_sent(), 1);
    }

    #[test]
    fn test_close_cancels_heartbeat() {
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let (_, entry) = ConnectionEntry::new(tx, token.clone());

        entry.close();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_push_outcome_serializes() {
        assert_eq!(
            serde_json::to_value(PushOutcome::Failed(PushFailure::Closed)).unwrap(),
            serde_json::json!({"outcome": "failed", "reason": "closed"})
        );
        assert_eq!(
            serde_json::to_value(PushOutcome::NoTarget).unwrap(),
            serde_json::json!({"outcome": "no_target"})
        );
    }
}
