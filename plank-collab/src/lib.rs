//! # plank-collab — multi-session board sync
//!
//! Keeps many concurrently-edited boards consistent across sessions that
//! mutate optimistically and a server that is the single source of truth.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   commit batch (bincode)   ┌──────────────┐
//! │ BoardClient  │ ◄────────────────────────► │  SyncServer  │
//! │ (per session)│    WebSocket req/resp      │  (central)   │
//! └──────┬───────┘                            └──────┬───────┘
//!        │                                           │
//!        ▼                                           ▼
//! ┌──────────────┐                           ┌──────────────────┐
//! │EditorSession │                           │MutationProcessor │
//! │ queue+snapshot│                          │ version guard +  │
//! └──────────────┘                           │ per-board lock   │
//!                                            └───────┬──────────┘
//!                                                    │ atomic batch
//!                                            ┌───────▼──────┐
//!                                            │  BoardStore  │
//!                                            │  (RocksDB)   │
//!                                            └───────┬──────┘
//!                                                    │ after commit
//!                                            ┌───────▼──────┐
//!                                            │  FanoutHub   │──► peer sessions
//!                                            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — wire messages (bincode requests, JSON-line push events)
//! - [`session`] — client change queue, optimistic apply, rollback snapshot
//! - [`client`] — debounced batch scheduler + WebSocket client
//! - [`mutation`] — transactional batch application and version guard
//! - [`fanout`] — registry of live sessions, commit fanout
//! - [`storage`] — RocksDB board store
//!
//! Edits render locally before the server confirms them; a rejected batch
//! (stale version, validation, transport) rolls the session back to its
//! pre-batch snapshot and the user re-syncs. Conflicts are resolved by
//! whole-batch rejection, not field-level merge.

pub mod protocol;
pub mod session;
pub mod client;
pub mod server;
pub mod mutation;
pub mod fanout;
pub mod storage;

// Re-exports for convenience
pub use protocol::{
    ClientRequest, CommitRequest, FailureKind, ProtocolError, PushEvent, ServerReply,
    WireFailure,
};
pub use session::EditorSession;
pub use client::{BoardClient, ClientConfig, ClientError, ClientEvent, DebounceTimer};
pub use mutation::{CommitError, MutationProcessor};
pub use fanout::{FanoutHub, FanoutStats};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{BoardStore, StoreConfig, StoreError};
