//! Fan-out of commit notifications to peer sessions.
//!
//! The hub is an explicit registry object owned by the server process:
//! `board_id → session_id → sender`. Sessions register when they start
//! watching a board and are deregistered as soon as their connection ends,
//! whatever the cause — nothing is collected implicitly.
//!
//! Delivery is best-effort and never blocks: a full or closed subscriber
//! channel counts as a drop and the remaining subscribers still get the
//! event. The originating session is always excluded — its commit reply
//! already carries the new version.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::PushEvent;

/// Statistics for monitoring fanout health.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub watched_boards: usize,
}

/// Lock-free counters for the publish hot path.
struct AtomicFanoutStats {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl AtomicFanoutStats {
    fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

/// Registry of live subscriber channels, keyed by board then session.
pub struct FanoutHub {
    boards: Arc<RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::Sender<PushEvent>>>>>,
    /// Events buffered per subscriber before sends start dropping.
    capacity: usize,
    stats: AtomicFanoutStats,
}

impl FanoutHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            boards: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            stats: AtomicFanoutStats::new(),
        }
    }

    /// Register a session as a watcher of `board_id`.
    ///
    /// Returns the receiving end of the session's notification channel.
    /// Subscribing twice with the same session id replaces the previous
    /// channel (the old receiver sees its sender close).
    pub async fn subscribe(&self, board_id: Uuid, session_id: Uuid) -> mpsc::Receiver<PushEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut boards = self.boards.write().await;
        boards.entry(board_id).or_default().insert(session_id, tx);
        log::debug!("session {session_id} subscribed to board {board_id}");
        rx
    }

    /// Remove a session's registration. Returns true if it was present.
    ///
    /// Empty per-board maps are removed so the registry never leaks entries
    /// for boards nobody watches anymore.
    pub async fn unsubscribe(&self, board_id: Uuid, session_id: Uuid) -> bool {
        let mut boards = self.boards.write().await;
        let Some(sessions) = boards.get_mut(&board_id) else {
            return false;
        };
        let removed = sessions.remove(&session_id).is_some();
        if sessions.is_empty() {
            boards.remove(&board_id);
        }
        if removed {
            log::debug!("session {session_id} unsubscribed from board {board_id}");
        }
        removed
    }

    /// Deliver `event` to every watcher of `board_id` except the origin.
    ///
    /// Returns the number of subscribers actually reached. Slow or dead
    /// subscribers are skipped, never awaited.
    pub async fn publish(&self, board_id: Uuid, origin_session: Uuid, event: PushEvent) -> usize {
        self.stats.published.fetch_add(1, Ordering::Relaxed);

        let boards = self.boards.read().await;
        let Some(sessions) = boards.get(&board_id) else {
            return 0;
        };

        let mut reached = 0;
        for (session_id, tx) in sessions {
            if *session_id == origin_session {
                continue;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    reached += 1;
                }
                Err(e) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "dropping event for session {session_id} on board {board_id}: {e}"
                    );
                }
            }
        }
        reached
    }

    /// Watchers currently registered for a board.
    pub async fn subscriber_count(&self, board_id: Uuid) -> usize {
        self.boards
            .read()
            .await
            .get(&board_id)
            .map_or(0, HashMap::len)
    }

    /// Boards with at least one watcher.
    pub async fn board_count(&self) -> usize {
        self.boards.read().await.len()
    }

    /// Snapshot of the hub's counters.
    pub async fn stats(&self) -> FanoutStats {
        let boards = self.boards.read().await;
        FanoutStats {
            events_published: self.stats.published.load(Ordering::Relaxed),
            events_delivered: self.stats.delivered.load(Ordering::Relaxed),
            events_dropped: self.stats.dropped.load(Ordering::Relaxed),
            watched_boards: boards.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_unsubscribe_lifecycle() {
        let hub = FanoutHub::new(8);
        let board = Uuid::new_v4();
        let session = Uuid::new_v4();

        let _rx = hub.subscribe(board, session).await;
        assert_eq!(hub.subscriber_count(board).await, 1);
        assert_eq!(hub.board_count().await, 1);

        assert!(hub.unsubscribe(board, session).await);
        assert_eq!(hub.subscriber_count(board).await, 0);
        // Empty board entry is gone, not lingering.
        assert_eq!(hub.board_count().await, 0);

        assert!(!hub.unsubscribe(board, session).await);
    }

    #[tokio::test]
    async fn test_publish_excludes_origin() {
        let hub = FanoutHub::new(8);
        let board = Uuid::new_v4();
        let origin = Uuid::new_v4();
        let peer = Uuid::new_v4();

        let mut origin_rx = hub.subscribe(board, origin).await;
        let mut peer_rx = hub.subscribe(board, peer).await;

        let reached = hub
            .publish(board, origin, PushEvent::DocumentUpdated { version: 1 })
            .await;
        assert_eq!(reached, 1);

        assert_eq!(
            peer_rx.recv().await,
            Some(PushEvent::DocumentUpdated { version: 1 })
        );
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_to_unwatched_board() {
        let hub = FanoutHub::new(8);
        let reached = hub
            .publish(
                Uuid::new_v4(),
                Uuid::new_v4(),
                PushEvent::DocumentUpdated { version: 1 },
            )
            .await;
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn test_dead_subscriber_does_not_block_others() {
        let hub = FanoutHub::new(8);
        let board = Uuid::new_v4();
        let dead = Uuid::new_v4();
        let alive = Uuid::new_v4();

        let dead_rx = hub.subscribe(board, dead).await;
        drop(dead_rx);
        let mut alive_rx = hub.subscribe(board, alive).await;

        let reached = hub
            .publish(board, Uuid::new_v4(), PushEvent::DocumentUpdated { version: 3 })
            .await;
        assert_eq!(reached, 1);
        assert_eq!(
            alive_rx.recv().await,
            Some(PushEvent::DocumentUpdated { version: 3 })
        );

        let stats = hub.stats().await;
        assert_eq!(stats.events_published, 1);
        assert_eq!(stats.events_delivered, 1);
        assert_eq!(stats.events_dropped, 1);
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_instead_of_blocking() {
        let hub = FanoutHub::new(1);
        let board = Uuid::new_v4();
        let slow = Uuid::new_v4();

        let _rx = hub.subscribe(board, slow).await;
        let origin = Uuid::new_v4();

        // First event fills the buffer, second is dropped.
        assert_eq!(
            hub.publish(board, origin, PushEvent::DocumentUpdated { version: 1 })
                .await,
            1
        );
        assert_eq!(
            hub.publish(board, origin, PushEvent::DocumentUpdated { version: 2 })
                .await,
            0
        );

        let stats = hub.stats().await;
        assert_eq!(stats.events_dropped, 1);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_channel() {
        let hub = FanoutHub::new(8);
        let board = Uuid::new_v4();
        let session = Uuid::new_v4();

        let _old_rx = hub.subscribe(board, session).await;
        let mut new_rx = hub.subscribe(board, session).await;
        assert_eq!(hub.subscriber_count(board).await, 1);

        hub.publish(board, Uuid::new_v4(), PushEvent::Connected).await;
        assert_eq!(new_rx.recv().await, Some(PushEvent::Connected));
    }

    #[tokio::test]
    async fn test_boards_are_isolated() {
        let hub = FanoutHub::new(8);
        let board_a = Uuid::new_v4();
        let board_b = Uuid::new_v4();

        let mut rx_a = hub.subscribe(board_a, Uuid::new_v4()).await;
        let _rx_b = hub.subscribe(board_b, Uuid::new_v4()).await;

        hub.publish(board_b, Uuid::new_v4(), PushEvent::DocumentUpdated { version: 9 })
            .await;
        assert!(rx_a.try_recv().is_err());
    }
}
