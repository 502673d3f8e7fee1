//! Text Protocol Parser
//!
//! Reads one command per call from a buffered async reader. A command is
//! a single CRLF-terminated line tokenized on spaces; storage commands
//! are followed by a data block of the announced length plus a trailing
//! CRLF that is consumed and discarded.
//!
//! The parser distinguishes client mistakes (bad integers, wrong arity)
//! from stream problems: the former map to `Bad*` errors the caller
//! replies to, the latter terminate the connection.

use crate::protocol::types::{
    Command, DeleteRequest, GetRequest, ProtocolError, SetRequest, TouchRequest,
};
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::warn;

/// Peeks the first byte of the stream and decides whether the text
/// parser claims this connection. Text commands all start with a
/// lowercase ASCII letter.
///
/// The architecture admits additional protocols behind the same peek;
/// only text is implemented, and it doubles as the fallback.
pub async fn sniff_text<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<bool> {
    let buf = reader.fill_buf().await?;
    Ok(buf.first().is_some_and(|b| b.is_ascii_lowercase()))
}

/// Incremental parser over a buffered socket reader.
pub struct TextParser<R> {
    reader: R,
}

impl<R: AsyncBufRead + Unpin> TextParser<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads and parses the next command.
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] on a clean EOF
    /// between commands.
    pub async fn parse(&mut self) -> Result<Command, ProtocolError> {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }

        let line = String::from_utf8_lossy(&line);
        let parts: Vec<&str> = line.split_whitespace().collect();
        let op = parts.first().copied().unwrap_or("");

        match op {
            "set" | "add" | "replace" | "append" | "prepend" => {
                let req = self.parse_set(op, &parts).await?;
                Ok(match op {
                    "set" => Command::Set(req),
                    "add" => Command::Add(req),
                    "replace" => Command::Replace(req),
                    "append" => Command::Append(req),
                    _ => Command::Prepend(req),
                })
            }

            "get" => {
                if parts.len() < 2 {
                    return Err(ProtocolError::BadRequest);
                }
                let keys: Vec<Bytes> = parts[1..]
                    .iter()
                    .map(|k| Bytes::copy_from_slice(k.as_bytes()))
                    .collect();
                let opaques = vec![0; keys.len()];
                let quiet = vec![false; keys.len()];
                Ok(Command::Get(GetRequest {
                    keys,
                    opaques,
                    quiet,
                }))
            }

            "delete" => {
                if parts.len() != 2 {
                    return Err(ProtocolError::BadRequest);
                }
                Ok(Command::Delete(DeleteRequest {
                    key: Bytes::copy_from_slice(parts[1].as_bytes()),
                    opaque: 0,
                }))
            }

            "touch" => {
                if parts.len() != 3 {
                    return Err(ProtocolError::BadRequest);
                }
                let exptime = parts[2].parse::<u32>().map_err(|e| {
                    warn!(error = %e, "bad ttl in touch command");
                    ProtocolError::BadExptime
                })?;
                Ok(Command::Touch(TouchRequest {
                    key: Bytes::copy_from_slice(parts[1].as_bytes()),
                    exptime,
                    opaque: 0,
                }))
            }

            "noop" => {
                if parts.len() != 1 {
                    return Err(ProtocolError::BadRequest);
                }
                Ok(Command::Noop)
            }

            "quit" => {
                if parts.len() != 1 {
                    return Err(ProtocolError::BadRequest);
                }
                Ok(Command::Quit)
            }

            "version" => {
                if parts.len() != 1 {
                    return Err(ProtocolError::BadRequest);
                }
                Ok(Command::Version)
            }

            other => Ok(Command::Unknown(other.to_string())),
        }
    }

    /// Parses the shared `op key flags exptime bytes` form and reads the
    /// data block that follows.
    async fn parse_set(&mut self, op: &str, parts: &[&str]) -> Result<SetRequest, ProtocolError> {
        if parts.len() != 5 {
            return Err(ProtocolError::BadRequest);
        }

        let key = Bytes::copy_from_slice(parts[1].as_bytes());

        let flags = parts[2].parse::<u32>().map_err(|e| {
            warn!(op, error = %e, "bad flags in storage command");
            ProtocolError::BadFlags
        })?;
        let exptime = parts[3].parse::<u32>().map_err(|e| {
            warn!(op, error = %e, "bad exptime in storage command");
            ProtocolError::BadExptime
        })?;
        let length = parts[4].parse::<u32>().map_err(|e| {
            warn!(op, error = %e, "bad length in storage command");
            ProtocolError::BadLength
        })?;

        let mut data = vec![0u8; length as usize];
        if let Err(e) = self.reader.read_exact(&mut data).await {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Err(ProtocolError::BadLength);
            }
            return Err(ProtocolError::Io(e));
        }

        // consume the CRLF trailing the data block
        let mut trailer = Vec::new();
        self.reader.read_until(b'\n', &mut trailer).await?;

        Ok(SetRequest {
            key,
            data: Bytes::from(data),
            flags,
            exptime,
            opaque: 0,
            quiet: false,
        })
    }
}
