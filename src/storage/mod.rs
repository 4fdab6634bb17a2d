//! Storage Engine Module
//!
//! In-memory document storage used by the standalone `MemoryBackend`: a
//! sharded, CAS-versioned store with expiry support and a background sweeper.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                StorageEngine (one per bucket)               │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...64    │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ shards  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │
//!              ┌─────────────┴─────────────┐
//!              │     ExpirySweeper         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```

pub mod engine;
pub mod expiry;

pub use engine::{Mutation, StorageEngine, StorageStats, StoreError, StoredDocument};
pub use expiry::{ExpiryConfig, ExpirySweeper};
