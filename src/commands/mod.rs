//! Command Handling
//!
//! The command layer sits between the protocol and the store: it takes
//! one parsed [`Command`](crate::protocol::Command), runs the matching
//! store operation, and writes the reply.
//!
//! ```text
//! Client line
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  text parser    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │  - precondition │
//! │  - store call   │
//! │  - reply        │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │     Store       │  (storage module)
//! └─────────────────┘
//! ```
//!
//! App errors (misses, violated preconditions, bad deltas) are written
//! as replies and the connection continues; everything else bubbles up
//! and closes it.

pub mod handler;

pub use handler::{CommandHandler, Flow};
