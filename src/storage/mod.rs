//! Persistence Engine
//!
//! This module implements the on-disk storage engine for EmberKV.
//! Data is partitioned across a fixed number of independent shards, each
//! backed by a single append-structured file with an in-memory hash index
//! and a free-slot remapping table.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Store                              │
//! │                                                              │
//! │   collision shards            primary shards                 │
//! │  ┌────────┐┌────────┐   ┌────────┐┌────────┐     ┌────────┐  │
//! │  │Shard 0 ││Shard 1 │ … │Shard C ││Shard C+1│ …  │Shard N │  │
//! │  │RwLock  ││RwLock  │   │RwLock  ││RwLock  │     │RwLock  │  │
//! │  │file +  ││file +  │   │file +  ││file +  │     │file +  │  │
//! │  │index   ││index   │   │index   ││index   │     │index   │  │
//! │  └────────┘└────────┘   └────────┘└────────┘     └────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys are routed to a primary shard by their murmur3 hash. When two
//! distinct keys alias to the same hash bucket, the operation retries
//! against the reserved collision shards at the front of the array.
//!
//! ## Modules
//!
//! - [`record`]: the fixed-layout record codec and packed index entries
//! - [`shard`]: one file plus its in-memory maps; all single-key operations
//! - [`store`]: the shard array, hashing, collision retry, backup streams
//! - [`expiry`]: background fsync and expiration drivers

pub mod expiry;
pub mod record;
pub mod shard;
pub mod store;

pub use expiry::{Maintenance, MaintenanceConfig};
pub use shard::Shard;
pub use store::{Store, StoreOptions};

use thiserror::Error;

/// Errors produced by the storage engine.
///
/// The display strings double as wire error text: anything the responder
/// does not map to a dedicated memcached reply is sent to the client
/// verbatim, terminated by CRLF.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lookup miss, or a precondition that required the key to exist.
    #[error("ERROR Key not found")]
    KeyNotFound,

    /// `add` precondition violated: the key is already live.
    #[error("ERROR Key already exists")]
    KeyExists,

    /// Generic storage-denied condition.
    #[error("ERROR Item not stored")]
    ItemNotStored,

    /// Two distinct keys alias to one hash bucket. Internal only: the
    /// store retries collision shards before surfacing anything.
    #[error("ERROR Hash collision")]
    Collision,

    /// The entry was found but its expiry has passed. Reported to clients
    /// as a plain miss.
    #[error("ERROR Key expired")]
    Expired,

    /// Counter operation on a value that is not exactly 8 bytes.
    #[error("ERROR Bad increment/decrement value")]
    WrongFormat,

    /// The record would exceed the maximum slot size.
    #[error("ERROR Value too big")]
    ValueTooBig,

    /// A surface the engine deliberately does not implement.
    #[error("ERROR Not supported")]
    NotSupported,

    /// A shard file carries a format version this build cannot read.
    #[error("unsupported shard version {version} in {path}")]
    UnsupportedVersion { version: u8, path: String },

    /// Invalid store configuration detected at open.
    #[error("invalid store configuration: {0}")]
    InvalidConfig(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Errors that map onto a protocol-level reply and keep the
    /// connection alive. Everything else is fatal for the connection.
    pub fn is_app_error(&self) -> bool {
        !matches!(
            self,
            StoreError::Io(_)
                | StoreError::UnsupportedVersion { .. }
                | StoreError::InvalidConfig(_)
        )
    }

    /// Errors a client observes as a plain miss.
    pub fn is_miss(&self) -> bool {
        matches!(
            self,
            StoreError::KeyNotFound
                | StoreError::KeyExists
                | StoreError::ItemNotStored
                | StoreError::Expired
        )
    }
}
