//! The edit vocabulary and the pure reducer that applies it.
//!
//! A [`Change`] is one atomic user intent, created once and never mutated.
//! The client enqueues changes and applies them optimistically; the server
//! replays the same changes against the authoritative board inside a
//! transaction. Matching on the enum is exhaustive, so adding a change kind
//! is a compile-time-checked change everywhere it is handled.
//!
//! Every mutating variant leaves sibling order dense (`0..count`): appends
//! land at the end, removals re-index the survivors, and moves splice the
//! sequence then re-index the affected lists.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Board;

/// One atomic edit to a board.
///
/// New-entity ids (`AddList::list_id`, `AddCard::card_id`) are chosen by the
/// originating session and become permanent on commit; there is no temporary
/// id remapping step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    AddList {
        list_id: Uuid,
        title: String,
    },
    DeleteList {
        list_id: Uuid,
    },
    UpdateListTitle {
        list_id: Uuid,
        title: String,
    },
    /// Remove the list at `source_index` and reinsert at `destination_index`.
    ReorderList {
        source_index: usize,
        destination_index: usize,
    },
    AddCard {
        list_id: Uuid,
        card_id: Uuid,
        content: String,
    },
    DeleteCard {
        list_id: Uuid,
        card_id: Uuid,
    },
    UpdateCardContent {
        list_id: Uuid,
        card_id: Uuid,
        content: String,
    },
    /// Remove the card at `source_index` of the source list and insert it at
    /// `destination_index` of the destination list (same-list moves are a
    /// reorder within one sequence).
    MoveCard {
        card_id: Uuid,
        source_list_id: Uuid,
        destination_list_id: Uuid,
        source_index: usize,
        destination_index: usize,
    },
}

impl Change {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::AddList { .. } => "AddList",
            Change::DeleteList { .. } => "DeleteList",
            Change::UpdateListTitle { .. } => "UpdateListTitle",
            Change::ReorderList { .. } => "ReorderList",
            Change::AddCard { .. } => "AddCard",
            Change::DeleteCard { .. } => "DeleteCard",
            Change::UpdateCardContent { .. } => "UpdateCardContent",
            Change::MoveCard { .. } => "MoveCard",
        }
    }
}

/// Why a change could not be applied to a board.
///
/// Any of these aborts the whole batch on the server (surfaced as a
/// validation failure, distinct from a version conflict).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeError {
    ListNotFound(Uuid),
    CardNotFound(Uuid),
    /// An index does not address a valid position in its sequence.
    IndexOutOfRange { index: usize, len: usize },
    /// The id of a new entity collides with an existing one.
    DuplicateId(Uuid),
    /// The card found at the given index is not the card named by the change.
    StaleIndex { index: usize, card_id: Uuid },
}

impl std::fmt::Display for ChangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeError::ListNotFound(id) => write!(f, "list not found: {id}"),
            ChangeError::CardNotFound(id) => write!(f, "card not found: {id}"),
            ChangeError::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for length {len}")
            }
            ChangeError::DuplicateId(id) => write!(f, "duplicate entity id: {id}"),
            ChangeError::StaleIndex { index, card_id } => {
                write!(f, "card {card_id} is not at index {index}")
            }
        }
    }
}

impl std::error::Error for ChangeError {}

/// Apply one change to a board, keeping sibling order dense.
///
/// Pure with respect to everything but `board`; does not touch
/// `board.version` (version advances only via the server's commit path).
pub fn apply_change(board: &mut Board, change: &Change) -> Result<(), ChangeError> {
    log::trace!("apply {} to board {}", change.kind(), board.id);

    match change {
        Change::AddList { list_id, title } => {
            if board.list_index(*list_id).is_some() {
                return Err(ChangeError::DuplicateId(*list_id));
            }
            let order = board.lists.len() as u32;
            board
                .lists
                .push(crate::List::new(*list_id, title.clone(), order));
            Ok(())
        }

        Change::DeleteList { list_id } => {
            let index = board
                .list_index(*list_id)
                .ok_or(ChangeError::ListNotFound(*list_id))?;
            board.lists.remove(index);
            board.reindex_lists();
            Ok(())
        }

        Change::UpdateListTitle { list_id, title } => {
            let list = board
                .find_list_mut(*list_id)
                .ok_or(ChangeError::ListNotFound(*list_id))?;
            list.title = title.clone();
            Ok(())
        }

        Change::ReorderList {
            source_index,
            destination_index,
        } => {
            let len = board.lists.len();
            if *source_index >= len {
                return Err(ChangeError::IndexOutOfRange {
                    index: *source_index,
                    len,
                });
            }
            if *destination_index >= len {
                return Err(ChangeError::IndexOutOfRange {
                    index: *destination_index,
                    len,
                });
            }
            if source_index == destination_index {
                return Ok(());
            }
            let list = board.lists.remove(*source_index);
            board.lists.insert(*destination_index, list);
            board.reindex_lists();
            Ok(())
        }

        Change::AddCard {
            list_id,
            card_id,
            content,
        } => {
            if board
                .lists
                .iter()
                .any(|l| l.card_index(*card_id).is_some())
            {
                return Err(ChangeError::DuplicateId(*card_id));
            }
            let list = board
                .find_list_mut(*list_id)
                .ok_or(ChangeError::ListNotFound(*list_id))?;
            let order = list.cards.len() as u32;
            list.cards.push(crate::Card::new(*card_id, content.clone(), order));
            Ok(())
        }

        Change::DeleteCard { list_id, card_id } => {
            let list = board
                .find_list_mut(*list_id)
                .ok_or(ChangeError::ListNotFound(*list_id))?;
            let index = list
                .card_index(*card_id)
                .ok_or(ChangeError::CardNotFound(*card_id))?;
            list.cards.remove(index);
            list.reindex_cards();
            Ok(())
        }

        Change::UpdateCardContent {
            list_id,
            card_id,
            content,
        } => {
            let list = board
                .find_list_mut(*list_id)
                .ok_or(ChangeError::ListNotFound(*list_id))?;
            let index = list
                .card_index(*card_id)
                .ok_or(ChangeError::CardNotFound(*card_id))?;
            list.cards[index].content = content.clone();
            Ok(())
        }

        Change::MoveCard {
            card_id,
            source_list_id,
            destination_list_id,
            source_index,
            destination_index,
        } => {
            let src = board
                .list_index(*source_list_id)
                .ok_or(ChangeError::ListNotFound(*source_list_id))?;
            let src_len = board.lists[src].cards.len();
            if *source_index >= src_len {
                return Err(ChangeError::IndexOutOfRange {
                    index: *source_index,
                    len: src_len,
                });
            }
            if board.lists[src].cards[*source_index].id != *card_id {
                return Err(ChangeError::StaleIndex {
                    index: *source_index,
                    card_id: *card_id,
                });
            }

            if source_list_id == destination_list_id {
                if *destination_index >= src_len {
                    return Err(ChangeError::IndexOutOfRange {
                        index: *destination_index,
                        len: src_len,
                    });
                }
                let card = board.lists[src].cards.remove(*source_index);
                board.lists[src].cards.insert(*destination_index, card);
                board.lists[src].reindex_cards();
                return Ok(());
            }

            let dst = board
                .list_index(*destination_list_id)
                .ok_or(ChangeError::ListNotFound(*destination_list_id))?;
            let dst_len = board.lists[dst].cards.len();
            if *destination_index > dst_len {
                return Err(ChangeError::IndexOutOfRange {
                    index: *destination_index,
                    len: dst_len,
                });
            }
            let card = board.lists[src].cards.remove(*source_index);
            board.lists[dst].cards.insert(*destination_index, card);
            board.lists[src].reindex_cards();
            board.lists[dst].reindex_cards();
            Ok(())
        }
    }
}
