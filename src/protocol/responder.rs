//! Text Protocol Responder
//!
//! Renders replies for the text protocol. Every completed reply is
//! flushed so pipelined clients observe responses promptly.
//!
//! Misses in a batch get produce no line at all; the terminating `END`
//! tells the client the batch is complete.

use crate::protocol::types::{GetResponse, ProtocolError, ServerError};
use crate::storage::StoreError;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Reply writer over a buffered socket writer.
pub struct TextResponder<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> TextResponder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Reply for any successful storage command.
    pub async fn stored(&mut self) -> std::io::Result<()> {
        self.line("STORED").await
    }

    /// One `VALUE` block for a batch-get hit; nothing for a miss.
    pub async fn get(&mut self, response: &GetResponse) -> std::io::Result<()> {
        if response.miss {
            return Ok(());
        }
        let header = format!(
            "VALUE {} {} {}\r\n",
            String::from_utf8_lossy(&response.key),
            response.flags,
            response.data.len()
        );
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&response.data).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await
    }

    /// Terminates a batch get.
    pub async fn get_end(&mut self) -> std::io::Result<()> {
        self.line("END").await
    }

    pub async fn deleted(&mut self) -> std::io::Result<()> {
        self.line("DELETED").await
    }

    pub async fn touched(&mut self) -> std::io::Result<()> {
        self.line("TOUCHED").await
    }

    pub async fn noop(&mut self) -> std::io::Result<()> {
        self.line("Yep, it works.").await
    }

    pub async fn version(&mut self) -> std::io::Result<()> {
        let line = format!("VERSION {}", crate::VERSION);
        self.line(&line).await
    }

    /// Farewell reply for `quit`.
    pub async fn bye(&mut self) -> std::io::Result<()> {
        self.line("Bye").await
    }

    /// Maps an app error onto its protocol reply. Anything without a
    /// dedicated memcached reply is sent as its display text.
    pub async fn error(&mut self, err: &ServerError) -> std::io::Result<()> {
        let reply = match err {
            ServerError::Store(e) => match e {
                StoreError::KeyNotFound | StoreError::Expired => "NOT_FOUND".to_string(),
                StoreError::KeyExists | StoreError::ItemNotStored => "NOT_STORED".to_string(),
                StoreError::ValueTooBig => "CLIENT_ERROR bad command line".to_string(),
                StoreError::WrongFormat => {
                    "CLIENT_ERROR invalid numeric delta argument".to_string()
                }
                other => other.to_string(),
            },
            ServerError::Protocol(ProtocolError::BadRequest) => {
                "CLIENT_ERROR bad command line".to_string()
            }
            other => other.to_string(),
        };
        self.line(&reply).await
    }

    async fn line(&mut self, s: &str) -> std::io::Result<()> {
        self.writer.write_all(s.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn hit(key: &str, data: &str) -> GetResponse {
        GetResponse {
            key: Bytes::copy_from_slice(key.as_bytes()),
            data: Bytes::copy_from_slice(data.as_bytes()),
            flags: 0,
            opaque: 0,
            miss: false,
            quiet: false,
        }
    }

    fn miss(key: &str) -> GetResponse {
        GetResponse {
            key: Bytes::copy_from_slice(key.as_bytes()),
            data: Bytes::new(),
            flags: 0,
            opaque: 0,
            miss: true,
            quiet: false,
        }
    }

    #[tokio::test]
    async fn test_stored_reply() {
        let mut out = Vec::new();
        TextResponder::new(&mut out).stored().await.unwrap();
        assert_eq!(out, b"STORED\r\n");
    }

    #[tokio::test]
    async fn test_get_hit_and_end() {
        let mut out = Vec::new();
        let mut responder = TextResponder::new(&mut out);
        responder.get(&hit("mykey", "hello")).await.unwrap();
        responder.get_end().await.unwrap();
        assert_eq!(out, b"VALUE mykey 0 5\r\nhello\r\nEND\r\n");
    }

    #[tokio::test]
    async fn test_get_miss_writes_nothing_before_end() {
        let mut out = Vec::new();
        let mut responder = TextResponder::new(&mut out);
        responder.get(&miss("gone")).await.unwrap();
        responder.get_end().await.unwrap();
        assert_eq!(out, b"END\r\n");
    }

    #[tokio::test]
    async fn test_simple_replies() {
        let mut out = Vec::new();
        let mut responder = TextResponder::new(&mut out);
        responder.deleted().await.unwrap();
        responder.touched().await.unwrap();
        responder.noop().await.unwrap();
        responder.bye().await.unwrap();
        assert_eq!(out, b"DELETED\r\nTOUCHED\r\nYep, it works.\r\nBye\r\n");
    }

    #[tokio::test]
    async fn test_version_reply() {
        let mut out = Vec::new();
        TextResponder::new(&mut out).version().await.unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.starts_with("VERSION "));
        assert!(line.ends_with("\r\n"));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let cases: Vec<(ServerError, &[u8])> = vec![
            (StoreError::KeyNotFound.into(), b"NOT_FOUND\r\n"),
            (StoreError::Expired.into(), b"NOT_FOUND\r\n"),
            (StoreError::KeyExists.into(), b"NOT_STORED\r\n"),
            (StoreError::ItemNotStored.into(), b"NOT_STORED\r\n"),
            (
                StoreError::ValueTooBig.into(),
                b"CLIENT_ERROR bad command line\r\n",
            ),
            (
                StoreError::WrongFormat.into(),
                b"CLIENT_ERROR invalid numeric delta argument\r\n",
            ),
            (
                ProtocolError::BadRequest.into(),
                b"CLIENT_ERROR bad command line\r\n",
            ),
            (
                ProtocolError::BadFlags.into(),
                b"CLIENT_ERROR flags is not a valid integer\r\n",
            ),
            (ServerError::UnknownCommand, b"ERROR Unknown command\r\n"),
        ];
        for (err, want) in cases {
            let mut out = Vec::new();
            TextResponder::new(&mut out).error(&err).await.unwrap();
            assert_eq!(out, want, "wrong reply for {:?}", err);
        }
    }
}
