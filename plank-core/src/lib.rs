//! # plank-core — shared board model
//!
//! The data model shared by the sync client and the sync server: a board of
//! ordered lists of ordered cards, plus the [`Change`] vocabulary describing
//! every edit a session can make.
//!
//! Both sides route edits through the same pure reducer
//! ([`change::apply_change`]): the client applies changes optimistically to
//! its local copy, the server applies the same changes to the loaded
//! authoritative state before persisting. Because new-entity ids are chosen
//! by the client and carried inside the change, the two applications produce
//! identical boards whenever the client's expected version holds.
//!
//! Sibling order is kept dense: within a board the lists' `order` values are
//! exactly `0..n`, and within each list the cards' `order` values are exactly
//! `0..m`, after every mutation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod change;

pub use change::{apply_change, Change, ChangeError};

/// A card: one unit of content inside a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: Uuid,
    pub content: String,
    /// Position among siblings, dense `0..count`.
    pub order: u32,
}

impl Card {
    pub fn new(id: Uuid, content: impl Into<String>, order: u32) -> Self {
        Self {
            id,
            content: content.into(),
            order,
        }
    }
}

/// A list: a titled, ordered column of cards owned by exactly one board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct List {
    pub id: Uuid,
    pub title: String,
    /// Position among the board's lists, dense `0..count`.
    pub order: u32,
    pub cards: Vec<Card>,
}

impl List {
    pub fn new(id: Uuid, title: impl Into<String>, order: u32) -> Self {
        Self {
            id,
            title: title.into(),
            order,
            cards: Vec::new(),
        }
    }

    /// Rewrite card orders to match sequence position.
    pub fn reindex_cards(&mut self) {
        for (i, card) in self.cards.iter_mut().enumerate() {
            card.order = i as u32;
        }
    }

    /// True if card orders are exactly `0..len`.
    pub fn has_dense_order(&self) -> bool {
        self.cards
            .iter()
            .enumerate()
            .all(|(i, c)| c.order == i as u32)
    }

    pub fn card_index(&self, card_id: Uuid) -> Option<usize> {
        self.cards.iter().position(|c| c.id == card_id)
    }
}

/// The shared document: a board of lists, fenced by a monotonic version.
///
/// `version` starts at 0 and is advanced by the server only — exactly once
/// per committed batch. Local optimistic application never touches it; the
/// session adopts the server's new version from the commit reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub version: u64,
    pub lists: Vec<List>,
}

impl Board {
    pub fn new(id: Uuid, name: impl Into<String>, owner_id: Uuid) -> Self {
        Self {
            id,
            name: name.into(),
            owner_id,
            version: 0,
            lists: Vec::new(),
        }
    }

    /// Rewrite list orders to match sequence position.
    pub fn reindex_lists(&mut self) {
        for (i, list) in self.lists.iter_mut().enumerate() {
            list.order = i as u32;
        }
    }

    /// True if list orders and every list's card orders are dense.
    pub fn has_dense_order(&self) -> bool {
        self.lists
            .iter()
            .enumerate()
            .all(|(i, l)| l.order == i as u32 && l.has_dense_order())
    }

    pub fn list_index(&self, list_id: Uuid) -> Option<usize> {
        self.lists.iter().position(|l| l.id == list_id)
    }

    pub fn find_list(&self, list_id: Uuid) -> Option<&List> {
        self.lists.iter().find(|l| l.id == list_id)
    }

    pub fn find_list_mut(&mut self, list_id: Uuid) -> Option<&mut List> {
        self.lists.iter_mut().find(|l| l.id == list_id)
    }

    /// Total card count across all lists.
    pub fn card_count(&self) -> usize {
        self.lists.iter().map(|l| l.cards.len()).sum()
    }
}

/// Board metadata as listed by the server (without the list/card tree).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardMeta {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub version: u64,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}
