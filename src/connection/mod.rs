//! Connection Handling
//!
//! One async task per accepted socket. Each task runs the protocol
//! disambiguator once, then loops parse → dispatch → respond until the
//! client quits, disconnects, or hits a fatal error.
//!
//! ```text
//! 1. Client connects (TCP handshake)
//!        │
//!        ▼
//! 2. handle_connection task spawned
//!        │
//!        ▼
//! 3. peek first byte, pick protocol (text)
//!        │
//!        ▼
//! 4. ┌──────────────────────────────┐
//!    │ parse line → typed command   │
//!    │ dispatch against the store   │
//!    │ write reply, flush           │
//!    │ [loop]                       │
//!    └──────────────────────────────┘
//!        │
//!        ▼
//! 5. quit / disconnect / fatal error → task ends
//! ```
//!
//! App errors (misses, bad request lines) are replied and the loop
//! continues. I/O errors and unknown failures close the connection.

pub mod handler;

pub use handler::{handle_connection, ConnectionStats};
