//! # kvbridge - A Legacy Binary-Protocol Bridge
//!
//! kvbridge accepts connections from clients that speak the legacy binary
//! key-value protocol (memcached binary with the Couchbase extensions) and
//! serves them from a modern document backend. Clients see a single-node
//! cluster: they negotiate features, authenticate with SCRAM, fetch a cluster
//! config and then run GET, SET and DELETE against it.
//!
//! ## Features
//!
//! - **Binary protocol**: classic and alternative framing, collection-id key prefixes
//! - **SCRAM authentication**: SHA-1, SHA-256 and SHA-512 server side
//! - **Cluster config**: terse bucket configs with a vBucket map
//! - **Async I/O**: one Tokio task per connection, no shared mutable state
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              kvbridge                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌───────────────────┐            │
//! │  │ TCP Server  │───>│ Connection  │───>│ CommandTranslator │            │
//! │  │ (Listener)  │    │  Handler    │    │                   │            │
//! │  └──────┬──────┘    └──────┬──────┘    └───┬──────┬────┬───┘            │
//! │         │                  │               │      │    │                │
//! │         ▼                  ▼               ▼      │    ▼                │
//! │  ┌─────────────┐    ┌─────────────┐ ┌──────────┐  │ ┌──────────────┐    │
//! │  │ Connection  │    │ PacketCodec │ │   SASL   │  │ │ConfigSynthes.│    │
//! │  │  Registry   │    └─────────────┘ │  SCRAM   │  │ └──────────────┘    │
//! │  └─────────────┘                    └──────────┘  ▼                     │
//! │                              ┌─────────────────────────────────────┐    │
//! │                              │ KvBackend (MemoryBackend in-process)│    │
//! │                              │   StorageEngine shards + sweeper    │    │
//! │                              └─────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use kvbridge::{BridgeConfig, CommandTranslator, MemoryBackend, Server};
//! use kvbridge::auth::StaticCredentials;
//! use kvbridge::cluster::{ServicePorts, StaticTopology};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let buckets = vec!["default".to_string()];
//!     let translator = CommandTranslator::new(
//!         Arc::new(MemoryBackend::new(buckets.clone())),
//!         Arc::new(StaticTopology::single_node(
//!             "127.0.0.1",
//!             ServicePorts::kv_node(8091, 11210),
//!             &buckets,
//!             1024,
//!             0,
//!         )),
//!         Arc::new(StaticCredentials::default()),
//!     );
//!
//!     let server = Server::bind(&BridgeConfig::default(), translator).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Supported Opcodes
//!
//! - `HELLO`, `GET_ERROR_MAP`, `GET_CLUSTER_CONFIG`, `SELECT_BUCKET`
//! - `SASL_LIST_MECHS`, `SASL_AUTH`, `SASL_STEP`
//! - `GET`, `SET`, `DELETE`
//!
//! Everything else is answered with `UNKNOWN_COMMAND`.
//!
//! ## Module Overview
//!
//! - [`protocol`]: packet types, codec, framing extras and status codes
//! - [`auth`]: SCRAM engine and SASL negotiation
//! - [`cluster`]: topology snapshots and cluster config synthesis
//! - [`backend`]: the backend trait and the in-memory backend
//! - [`storage`]: sharded document store with TTL support
//! - [`commands`]: request to backend translation
//! - [`connection`]: per-connection loop, state and registry
//! - [`server`]: listener and shutdown

pub mod auth;
pub mod backend;
pub mod cluster;
pub mod commands;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use backend::{KvBackend, MemoryBackend};
pub use commands::CommandTranslator;
pub use connection::{handle_connection, ConnectionRegistry, ConnectionStats};
pub use protocol::{Packet, PacketCodec, ParseError, Status};
pub use server::{BridgeConfig, Server, ServerError, DEFAULT_HOST, DEFAULT_PORT};
pub use storage::{ExpiryConfig, ExpirySweeper, StorageEngine};

/// Version of kvbridge
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
