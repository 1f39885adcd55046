//! Session records
//!
//! Participant counters kept by the external session-record store. Updates
//! are fire-and-forget: the signaling path queues a command and moves on, and
//! a background task applies it and logs failures.

use anyhow::Result;
use async_trait::async_trait;
use chorus_protocol::RoomId;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

#[async_trait]
pub trait SessionRecords: Send + Sync {
    async fn increment_participant_count(&self, room_id: &RoomId) -> Result<()>;

    async fn decrement_participant_count(&self, room_id: &RoomId) -> Result<()>;
}

#[derive(Clone)]
pub struct PgSessionRecords {
    db: PgPool,
}

impl PgSessionRecords {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionRecords for PgSessionRecords {
    async fn increment_participant_count(&self, room_id: &RoomId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tour_sessions SET participant_count = participant_count + 1 WHERE room_id = $1",
        )
        .bind(room_id.as_str())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!("No session record for room {}", room_id);
        }
        Ok(())
    }

    async fn decrement_participant_count(&self, room_id: &RoomId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tour_sessions
            SET participant_count = GREATEST(participant_count - 1, 0)
            WHERE room_id = $1
            "#,
        )
        .bind(room_id.as_str())
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

/// In-process counters, used when no database is configured
#[derive(Default)]
pub struct MemorySessionRecords {
    counts: Mutex<HashMap<RoomId, u64>>,
}

impl MemorySessionRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, room_id: &RoomId) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SessionRecords for MemorySessionRecords {
    async fn increment_participant_count(&self, room_id: &RoomId) -> Result<()> {
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(room_id.clone())
            .or_default() += 1;
        Ok(())
    }

    async fn decrement_participant_count(&self, room_id: &RoomId) -> Result<()> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get_mut(room_id) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }
}

enum Command {
    Increment(RoomId),
    Decrement(RoomId),
    Flush(oneshot::Sender<()>),
}

/// Non-blocking handle onto a [`SessionRecords`] implementation
#[derive(Clone)]
pub struct SessionRecordNotifier {
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionRecordNotifier {
    /// Start the task that applies queued updates to `records`
    pub fn spawn(records: Arc<dyn SessionRecords>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Increment(room_id) => {
                        if let Err(e) = records.increment_participant_count(&room_id).await {
                            tracing::error!(
                                "Failed to increment participant count for room {}: {}",
                                room_id,
                                e
                            );
                        }
                    }
                    Command::Decrement(room_id) => {
                        if let Err(e) = records.decrement_participant_count(&room_id).await {
                            tracing::error!(
                                "Failed to decrement participant count for room {}: {}",
                                room_id,
                                e
                            );
                        }
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx }
    }

    pub fn increment(&self, room_id: &RoomId) {
        self.queue(Command::Increment(room_id.clone()));
    }

    pub fn decrement(&self, room_id: &RoomId) {
        self.queue(Command::Decrement(room_id.clone()));
    }

    /// Wait until every update queued so far has been applied
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        self.queue(Command::Flush(done_tx));
        let _ = done_rx.await;
    }

    fn queue(&self, command: Command) {
        if self.tx.send(command).is_err() {
            tracing::warn!("Session record task has stopped; dropping update");
        }
    }
}
