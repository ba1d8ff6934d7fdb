//! Persistent storage for boards.
//!
//! The only state required to survive a process restart lives here: the
//! board records (their list/card trees) and the per-board version counter.
//! Sessions, pending queues, and fanout subscriptions are process-local and
//! rebuilt from scratch.
//!
//! ```text
//! ┌──────────────┐   atomic WriteBatch    ┌──────────────┐
//! │  Mutation    │ ─────────────────────► │  BoardStore  │
//! │  Processor   │                        │  (RocksDB)   │
//! └──────────────┘                        └──────┬───────┘
//!                                                │ column families
//!                                                ▼
//!                          ┌─────────────────────────────────────┐
//!                          │ CF "boards" — LZ4 board snapshots   │
//!                          │ CF "meta"   — name/owner/version    │
//!                          └─────────────────────────────────────┘
//! ```

pub mod board_store;

pub use board_store::{BoardStore, StoreConfig, StoreError};
