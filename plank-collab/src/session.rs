//! Session-scoped editing state: the local board copy, the pending change
//! queue, and the rollback snapshot.
//!
//! One `EditorSession` belongs to exactly one open board view and is touched
//! only by the edit API and the batch scheduler, never concurrently. All
//! methods are synchronous and side-effect-free outside the session itself,
//! so the whole commit/rollback protocol is unit-testable without a server.
//!
//! Protocol:
//! - `enqueue` applies the change optimistically and appends it. The first
//!   entry into an idle queue captures the rollback snapshot.
//! - `take_batch` marks the current entries as in flight. At most one batch
//!   is outstanding; entries enqueued afterwards ride along in the queue and
//!   wait for the next batch.
//! - `batch_committed` removes exactly the in-flight entries and adopts the
//!   server's version. The snapshot is discarded only once the queue drains.
//! - `batch_rejected` discards the whole queue (in-flight and later entries
//!   alike) and restores the snapshot, bit-for-bit.

use std::collections::VecDeque;

use plank_core::{apply_change, Board, Change, ChangeError};
use uuid::Uuid;

/// Client-side state for one open board view.
#[derive(Debug)]
pub struct EditorSession {
    session_id: Uuid,
    board: Board,
    queue: VecDeque<Change>,
    /// Entries at the queue front currently submitted; 0 = none in flight.
    in_flight: usize,
    snapshot: Option<Board>,
    expected_version: u64,
}

impl EditorSession {
    /// Start a session over a freshly fetched board.
    pub fn new(session_id: Uuid, board: Board) -> Self {
        let expected_version = board.version;
        Self {
            session_id,
            board,
            queue: VecDeque::new(),
            in_flight: 0,
            snapshot: None,
            expected_version,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn expected_version(&self) -> u64 {
        self.expected_version
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight > 0
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Record a user intent: apply it to the local board immediately and
    /// queue it for the next batch.
    ///
    /// A reducer failure means the caller produced a change that does not
    /// fit the board it is looking at — a programming error, surfaced
    /// eagerly and leaving the session untouched.
    pub fn enqueue(&mut self, change: Change) -> Result<(), ChangeError> {
        if self.queue.is_empty() {
            self.snapshot = Some(self.board.clone());
        }
        if let Err(e) = apply_change(&mut self.board, &change) {
            if self.queue.is_empty() {
                self.snapshot = None;
            }
            return Err(e);
        }
        self.queue.push_back(change);
        Ok(())
    }

    /// Mark the current queue contents as the in-flight batch and return a
    /// copy for submission. Returns `None` while a batch is already
    /// outstanding or when there is nothing to send.
    pub fn take_batch(&mut self) -> Option<Vec<Change>> {
        if self.in_flight > 0 || self.queue.is_empty() {
            return None;
        }
        self.in_flight = self.queue.len();
        Some(self.queue.iter().cloned().collect())
    }

    /// The server applied the in-flight batch. Removes exactly the submitted
    /// entries and adopts the new version. Returns true when more entries
    /// are already waiting and an immediate reschedule is wanted.
    pub fn batch_committed(&mut self, new_version: u64) -> bool {
        self.queue.drain(..self.in_flight);
        self.in_flight = 0;
        self.expected_version = new_version;
        self.board.version = new_version;
        if self.queue.is_empty() {
            self.snapshot = None;
            false
        } else {
            true
        }
    }

    /// The batch was rejected (conflict, validation, transport — all alike
    /// on this side): discard every queued entry and restore the pre-batch
    /// board. The caller must re-fetch before editing again.
    pub fn batch_rejected(&mut self) {
        self.queue.clear();
        self.in_flight = 0;
        if let Some(saved) = self.snapshot.take() {
            self.board = saved;
        }
        self.expected_version = self.board.version;
    }

    /// Replace the local board after a re-fetch; only valid while idle.
    ///
    /// Pending edits would be stranded against the old state, so the queue
    /// must have been drained or rolled back first.
    pub fn resync(&mut self, board: Board) {
        debug_assert!(self.queue.is_empty());
        self.expected_version = board.version;
        self.board = board;
        self.snapshot = None;
    }
}
