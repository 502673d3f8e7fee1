//! Protocol Data Types
//!
//! Parsed commands, request/response structs, and the error types that
//! cross the parser / handler / responder boundaries.
//!
//! Requests carry `opaque` and `quiet` fields even though the text
//! protocol never sets them: the request shapes are protocol-agnostic so
//! a future binary parser can produce the same types. `opaque` is echoed
//! back unchanged; `quiet` suppresses replies where the protocol allows
//! it.

use crate::storage::StoreError;
use bytes::Bytes;
use std::io;
use thiserror::Error;

/// One fully parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set(SetRequest),
    Add(SetRequest),
    Replace(SetRequest),
    Append(SetRequest),
    Prepend(SetRequest),
    Get(GetRequest),
    Delete(DeleteRequest),
    Touch(TouchRequest),
    Noop,
    Quit,
    Version,
    /// Valid framing, unrecognized command word.
    Unknown(String),
}

/// Payload-carrying write request, shared by the five storage commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetRequest {
    pub key: Bytes,
    pub data: Bytes,
    pub flags: u32,
    /// TTL in seconds as sent by the client; 0 means never. The handler
    /// converts it to an absolute unix timestamp.
    pub exptime: u32,
    pub opaque: u32,
    pub quiet: bool,
}

/// Batch read request. Single gets and multi-gets take the same shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetRequest {
    pub keys: Vec<Bytes>,
    pub opaques: Vec<u32>,
    pub quiet: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: Bytes,
    pub opaque: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchRequest {
    pub key: Bytes,
    pub exptime: u32,
    pub opaque: u32,
}

/// One per-key result of a batch get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    pub key: Bytes,
    pub data: Bytes,
    pub flags: u32,
    pub opaque: u32,
    pub miss: bool,
    pub quiet: bool,
}

/// Parser-level errors.
///
/// The `Bad*` variants are client mistakes: they are replied with their
/// display text and the connection keeps going. Everything else ends the
/// connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("CLIENT_ERROR bad request")]
    BadRequest,

    #[error("CLIENT_ERROR length is not a valid integer")]
    BadLength,

    #[error("CLIENT_ERROR flags is not a valid integer")]
    BadFlags,

    #[error("CLIENT_ERROR exptime is not a valid integer")]
    BadExptime,

    /// The peer closed the connection between commands.
    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True for malformed-input errors that are replied to the client
    /// without dropping the connection.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadRequest
                | ProtocolError::BadLength
                | ProtocolError::BadFlags
                | ProtocolError::BadExptime
        )
    }
}

/// Unified error for the dispatch path: everything the responder may
/// have to translate into a reply, and everything that can kill a
/// connection.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("ERROR Unknown command")]
    UnknownCommand,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerError {
    /// App errors flow to the responder and the connection continues;
    /// anything else closes the connection.
    pub fn is_app_error(&self) -> bool {
        match self {
            ServerError::Store(e) => e.is_app_error(),
            ServerError::Protocol(e) => e.is_client_error(),
            ServerError::UnknownCommand => true,
            ServerError::Io(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(ProtocolError::BadRequest.is_client_error());
        assert!(ProtocolError::BadFlags.is_client_error());
        assert!(ProtocolError::BadExptime.is_client_error());
        assert!(ProtocolError::BadLength.is_client_error());
        assert!(!ProtocolError::ConnectionClosed.is_client_error());
        assert!(!ProtocolError::Io(io::Error::other("boom")).is_client_error());
    }

    #[test]
    fn test_server_error_classification() {
        assert!(ServerError::Store(StoreError::KeyNotFound).is_app_error());
        assert!(ServerError::Store(StoreError::WrongFormat).is_app_error());
        assert!(ServerError::UnknownCommand.is_app_error());
        assert!(!ServerError::Store(StoreError::Io(io::Error::other("boom"))).is_app_error());
        assert!(!ServerError::Io(io::Error::other("boom")).is_app_error());
    }

    #[test]
    fn test_error_text_matches_wire_format() {
        assert_eq!(
            ProtocolError::BadFlags.to_string(),
            "CLIENT_ERROR flags is not a valid integer"
        );
        assert_eq!(
            ServerError::Store(StoreError::KeyExists).to_string(),
            "ERROR Key already exists"
        );
    }
}
