//! # EmberKV - A Disk-Backed Key-Value Store
//!
//! EmberKV is a memcached-compatible key-value store written in Rust.
//! Unlike a pure cache, every record lives on disk: the dataset is
//! partitioned into fixed-size shards, each an append-structured file
//! with an in-memory hash index, so a restart (or crash) loses at most
//! the writes since the last periodic fsync.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                             EmberKV                                │
//! │                                                                    │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐             │
//! │  │ TCP Server  │───>│ Connection  │───>│  Command    │             │
//! │  │ (Listener)  │    │   Task      │    │  Handler    │             │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘             │
//! │                                               │                    │
//! │  ┌─────────────┐                              ▼                    │
//! │  │    Text     │    ┌──────────────────────────────────────────┐   │
//! │  │   Parser/   │    │                  Store                   │   │
//! │  │  Responder  │    │  ┌────────┐ ┌────────┐ ┌────────┐        │   │
//! │  └─────────────┘    │  │Shard 0 │ │Shard 1 │ │ ...N   │        │   │
//! │                     │  │file +  │ │file +  │ │ shards │        │   │
//! │                     │  │index   │ │index   │ │        │        │   │
//! │                     │  └────────┘ └────────┘ └────────┘        │   │
//! │                     └──────────────────────────────────────────┘   │
//! │                                               ▲                    │
//! │                     ┌─────────────────────────┴────────────────┐   │
//! │                     │            Maintenance                   │   │
//! │                     │  (expiration sweeps + periodic fsync)    │   │
//! │                     └──────────────────────────────────────────┘   │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! The text protocol implements the memcached storage and retrieval
//! commands:
//!
//! - `set key flags exptime bytes` - store unconditionally
//! - `add` / `replace` - store only when absent / present
//! - `append` / `prepend` - concatenate onto an existing value
//! - `get k1 [k2 ...]` - batch retrieval
//! - `delete key`, `touch key ttl`
//! - `noop`, `version`, `quit`
//!
//! ## Design Highlights
//!
//! ### Hash-partitioned shards
//!
//! A key's murmur3 hash picks its shard; each shard serializes access
//! with its own lock, so operations on different shards never contend.
//! The first few shards are reserved as *collision shards*: when two
//! distinct keys alias to one 32-bit hash bucket, the loser of the
//! byte-compare transparently retries there.
//!
//! ### Size-class slots
//!
//! Records occupy power-of-two-sized slots. Overwrites that stay in the
//! same size class happen in place; anything else tombstones the old
//! slot and reuses a freed slot of the right class before growing the
//! file.
//!
//! ### Lazy + active expiry
//!
//! Expired keys are removed when touched by a read, and a background
//! driver sweeps one shard per tick so untouched keys get reclaimed
//! too.
//!
//! ## Module Overview
//!
//! - [`protocol`]: memcached text protocol parser and responder
//! - [`storage`]: shards, record codec, store façade, maintenance
//! - [`commands`]: binds parsed commands to store operations
//! - [`connection`]: per-connection server loop

pub mod commands;
pub mod connection;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::CommandHandler;
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{Command, ProtocolError, ServerError, TextParser, TextResponder};
pub use storage::{Maintenance, MaintenanceConfig, Store, StoreError, StoreOptions};

/// The default port EmberKV listens on (same as memcached).
pub const DEFAULT_PORT: u16 = 11211;

/// The default host EmberKV binds to.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of EmberKV, reported by the `version` command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
