//! Memcached Text Protocol
//!
//! This module implements the line-oriented memcached text protocol:
//! request parsing, reply rendering and the error taxonomy shared with
//! the rest of the server.
//!
//! ## Overview
//!
//! Commands arrive one per line, terminated by CRLF and tokenized on
//! spaces. Storage commands (`set`, `add`, `replace`, `append`,
//! `prepend`) are followed by a data block of the announced length plus
//! a trailing CRLF. `get` accepts multiple keys per line. Replies are
//! plain text lines per the memcached protocol description.
//!
//! ## Modules
//!
//! - [`types`]: parsed commands, request/response structs, error types
//! - [`parser`]: the incremental line parser and protocol disambiguator
//! - [`responder`]: reply rendering with flush-per-reply semantics

pub mod parser;
pub mod responder;
pub mod types;

pub use parser::{sniff_text, TextParser};
pub use responder::TextResponder;
pub use types::{
    Command, DeleteRequest, GetRequest, GetResponse, ProtocolError, ServerError, SetRequest,
    TouchRequest,
};
