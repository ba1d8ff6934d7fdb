//! Transactional application of change batches.
//!
//! The processor is the single writer for board state. A commit runs under
//! that board's lock (different boards commit fully concurrently, there is
//! no global lock) and follows one shape:
//!
//! 1. load the board — absent → `NotFound`, wrong owner → `Forbidden`
//! 2. compare versions — mismatch → `Conflict`, nothing applied
//! 3. apply every change in submitted order via the shared reducer — any
//!    reducer error → `Validation`, nothing persisted
//! 4. bump the version by exactly 1 (per batch, not per change)
//! 5. persist board + metadata in one atomic write batch
//!
//! Because changes are applied to an in-memory copy and persisted in a
//! single write batch, a failure at any step leaves stored state and the
//! stored version untouched — partial application is never observable.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use plank_core::{apply_change, Board, BoardMeta, Change};

use crate::storage::{BoardStore, StoreError};

/// Commit failure taxonomy (see the protocol module for the wire form).
#[derive(Debug, Clone)]
pub enum CommitError {
    /// The caller's expected version is stale. Recoverable: re-fetch, redo.
    Conflict { expected: u64, actual: u64 },
    NotFound(Uuid),
    Forbidden,
    /// Malformed or inapplicable change — a client-side bug, never retried.
    Validation(String),
    Storage(StoreError),
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitError::Conflict { expected, actual } => {
                write!(f, "version conflict: expected {expected}, stored {actual}")
            }
            CommitError::NotFound(id) => write!(f, "board not found: {id}"),
            CommitError::Forbidden => write!(f, "board is not owned by the caller"),
            CommitError::Validation(msg) => write!(f, "invalid change: {msg}"),
            CommitError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for CommitError {}

impl From<StoreError> for CommitError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => CommitError::NotFound(id),
            other => CommitError::Storage(other),
        }
    }
}

/// Serializes commits per board and applies them to the store.
pub struct MutationProcessor {
    store: Arc<BoardStore>,
    /// One lock per board; the map itself is touched only briefly.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl MutationProcessor {
    pub fn new(store: Arc<BoardStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<BoardStore> {
        &self.store
    }

    async fn board_lock(&self, board_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(board_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply one batch atomically. Returns the board's new version.
    pub async fn commit(
        &self,
        board_id: Uuid,
        identity: Uuid,
        changes: &[Change],
        expected_version: u64,
    ) -> Result<u64, CommitError> {
        if changes.is_empty() {
            return Err(CommitError::Validation("empty batch".into()));
        }

        let lock = self.board_lock(board_id).await;
        let _guard = lock.lock().await;

        let mut board = self.store.load_board(board_id)?;
        if board.owner_id != identity {
            return Err(CommitError::Forbidden);
        }
        if board.version != expected_version {
            log::debug!(
                "conflict on board {board_id}: expected {expected_version}, stored {}",
                board.version
            );
            return Err(CommitError::Conflict {
                expected: expected_version,
                actual: board.version,
            });
        }

        for change in changes {
            apply_change(&mut board, change)
                .map_err(|e| CommitError::Validation(e.to_string()))?;
        }
        debug_assert!(board.has_dense_order());

        board.version += 1;
        self.store.save_board(&board)?;
        log::info!(
            "committed {} change(s) to board {board_id}, version {} -> {}",
            changes.len(),
            expected_version,
            board.version
        );
        Ok(board.version)
    }

    /// Create a board owned by `identity`. Not version-fenced.
    pub async fn create_board(
        &self,
        board_id: Uuid,
        name: &str,
        identity: Uuid,
    ) -> Result<BoardMeta, CommitError> {
        let board = Board::new(board_id, name, identity);
        match self.store.create_board(&board) {
            Ok(meta) => Ok(meta),
            Err(StoreError::AlreadyExists(id)) => {
                Err(CommitError::Validation(format!("board already exists: {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a board, enforcing ownership.
    pub async fn fetch_board(&self, board_id: Uuid, identity: Uuid) -> Result<Board, CommitError> {
        let board = self.store.load_board(board_id)?;
        if board.owner_id != identity {
            return Err(CommitError::Forbidden);
        }
        Ok(board)
    }

    /// All boards owned by `identity`, most recently updated first.
    pub async fn list_boards(&self, identity: Uuid) -> Result<Vec<BoardMeta>, CommitError> {
        Ok(self.store.list_boards(identity)?)
    }

    /// Rename a board. Owner-guarded, does not advance the version.
    pub async fn rename_board(
        &self,
        board_id: Uuid,
        name: &str,
        identity: Uuid,
    ) -> Result<(), CommitError> {
        let lock = self.board_lock(board_id).await;
        let _guard = lock.lock().await;

        let mut board = self.store.load_board(board_id)?;
        if board.owner_id != identity {
            return Err(CommitError::Forbidden);
        }
        board.name = name.to_string();
        self.store.save_board(&board)?;
        Ok(())
    }

    /// Delete a board and forget its lock entry.
    pub async fn delete_board(&self, board_id: Uuid, identity: Uuid) -> Result<(), CommitError> {
        let lock = self.board_lock(board_id).await;
        let _guard = lock.lock().await;

        let board = self.store.load_board(board_id)?;
        if board.owner_id != identity {
            return Err(CommitError::Forbidden);
        }
        self.store.delete_board(board_id)?;
        drop(_guard);

        let mut locks = self.locks.lock().await;
        locks.remove(&board_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;

    fn processor(dir: &tempfile::TempDir) -> MutationProcessor {
        let store =
            Arc::new(BoardStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        MutationProcessor::new(store)
    }

    fn add_list(title: &str) -> (Change, Uuid) {
        let list_id = Uuid::new_v4();
        (
            Change::AddList {
                list_id,
                title: title.into(),
            },
            list_id,
        )
    }

    #[tokio::test]
    async fn test_commit_applies_and_bumps_version_once() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir);
        let owner = Uuid::new_v4();
        let board_id = Uuid::new_v4();
        p.create_board(board_id, "b", owner).await.unwrap();

        let (c1, _) = add_list("todo");
        let (c2, _) = add_list("doing");
        let (c3, _) = add_list("done");

        // Three changes, one batch, one version bump.
        let v = p.commit(board_id, owner, &[c1, c2, c3], 0).await.unwrap();
        assert_eq!(v, 1);

        let board = p.fetch_board(board_id, owner).await.unwrap();
        assert_eq!(board.version, 1);
        assert_eq!(board.lists.len(), 3);
        assert!(board.has_dense_order());
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_without_applying() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir);
        let owner = Uuid::new_v4();
        let board_id = Uuid::new_v4();
        p.create_board(board_id, "b", owner).await.unwrap();

        let (c1, _) = add_list("todo");
        p.commit(board_id, owner, &[c1], 0).await.unwrap();

        let (c2, _) = add_list("late");
        let err = p.commit(board_id, owner, &[c2], 0).await.unwrap_err();
        assert!(matches!(
            err,
            CommitError::Conflict {
                expected: 0,
                actual: 1
            }
        ));

        let board = p.fetch_board(board_id, owner).await.unwrap();
        assert_eq!(board.version, 1);
        assert_eq!(board.lists.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_nth_change_aborts_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir);
        let owner = Uuid::new_v4();
        let board_id = Uuid::new_v4();
        p.create_board(board_id, "b", owner).await.unwrap();

        let (good, _) = add_list("todo");
        let bad = Change::DeleteList {
            list_id: Uuid::new_v4(),
        };

        let err = p
            .commit(board_id, owner, &[good, bad], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Validation(_)));

        // Nothing from the batch is observable; version unchanged.
        let board = p.fetch_board(board_id, owner).await.unwrap();
        assert_eq!(board.version, 0);
        assert!(board.lists.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_board_and_foreign_owner() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir);
        let owner = Uuid::new_v4();
        let board_id = Uuid::new_v4();
        let (c, _) = add_list("todo");

        let err = p
            .commit(board_id, owner, std::slice::from_ref(&c), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::NotFound(_)));

        p.create_board(board_id, "b", owner).await.unwrap();
        let err = p
            .commit(board_id, Uuid::new_v4(), &[c], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Forbidden));
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir);
        let owner = Uuid::new_v4();
        let board_id = Uuid::new_v4();
        p.create_board(board_id, "b", owner).await.unwrap();

        let err = p.commit(board_id, owner, &[], 0).await.unwrap_err();
        assert!(matches!(err, CommitError::Validation(_)));
    }

    #[tokio::test]
    async fn test_racing_commits_have_exactly_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let p = Arc::new(processor(&dir));
        let owner = Uuid::new_v4();
        let board_id = Uuid::new_v4();
        p.create_board(board_id, "b", owner).await.unwrap();

        // Both tasks race with the same expected version.
        let mut handles = Vec::new();
        for _ in 0..2 {
            let p = p.clone();
            let (c, _) = add_list("racer");
            handles.push(tokio::spawn(async move {
                p.commit(board_id, owner, &[c], 0).await
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(v) => {
                    assert_eq!(v, 1);
                    wins += 1;
                }
                Err(CommitError::Conflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);

        // Stored state reflects only the winner.
        let board = p.fetch_board(board_id, owner).await.unwrap();
        assert_eq!(board.version, 1);
        assert_eq!(board.lists.len(), 1);
    }

    #[tokio::test]
    async fn test_reorder_scenario_through_commit() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir);
        let owner = Uuid::new_v4();
        let board_id = Uuid::new_v4();
        p.create_board(board_id, "b", owner).await.unwrap();

        let (a, id_a) = add_list("A");
        let (bl, id_b) = add_list("B");
        let (c, id_c) = add_list("C");
        p.commit(board_id, owner, &[a, bl, c], 0).await.unwrap();

        p.commit(
            board_id,
            owner,
            &[Change::ReorderList {
                source_index: 0,
                destination_index: 2,
            }],
            1,
        )
        .await
        .unwrap();

        let board = p.fetch_board(board_id, owner).await.unwrap();
        let ids: Vec<Uuid> = board.lists.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![id_b, id_c, id_a]);
        assert_eq!(
            board.lists.iter().map(|l| l.order).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn test_board_crud_guards() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir);
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let board_id = Uuid::new_v4();

        p.create_board(board_id, "mine", owner).await.unwrap();
        assert!(matches!(
            p.create_board(board_id, "again", owner).await,
            Err(CommitError::Validation(_))
        ));

        assert!(matches!(
            p.rename_board(board_id, "theirs", stranger).await,
            Err(CommitError::Forbidden)
        ));
        p.rename_board(board_id, "renamed", owner).await.unwrap();
        assert_eq!(
            p.fetch_board(board_id, owner).await.unwrap().name,
            "renamed"
        );

        assert!(matches!(
            p.delete_board(board_id, stranger).await,
            Err(CommitError::Forbidden)
        ));
        p.delete_board(board_id, owner).await.unwrap();
        assert!(matches!(
            p.fetch_board(board_id, owner).await,
            Err(CommitError::NotFound(_))
        ));

        assert!(p.list_boards(owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_boards_scoped_to_owner() {
        let dir = tempfile::tempdir().unwrap();
        let p = processor(&dir);
        let owner = Uuid::new_v4();

        p.create_board(Uuid::new_v4(), "one", owner).await.unwrap();
        p.create_board(Uuid::new_v4(), "two", owner).await.unwrap();
        p.create_board(Uuid::new_v4(), "foreign", Uuid::new_v4())
            .await
            .unwrap();

        let mine = p.list_boards(owner).await.unwrap();
        assert_eq!(mine.len(), 2);
    }
}
