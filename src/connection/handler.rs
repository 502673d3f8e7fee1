//! Per-Connection Loop
//!
//! Wires one TCP socket to the parser, handler and responder. The
//! classification rules live here: which errors get replied, which end
//! the connection quietly, and which are worth a warning.

use crate::commands::{CommandHandler, Flow};
use crate::protocol::parser::{sniff_text, TextParser};
use crate::protocol::responder::TextResponder;
use crate::protocol::types::{ProtocolError, ServerError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Shared counters for connection handling.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted.
    pub connections_accepted: AtomicU64,
    /// Currently active connections.
    pub active_connections: AtomicU64,
    /// Total commands processed.
    pub commands_processed: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs one client connection to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    handler: CommandHandler,
    stats: Arc<ConnectionStats>,
) {
    stats.connection_opened();
    info!(client = %addr, "client connected");

    match connection_loop(stream, addr, &handler, &stats).await {
        Ok(()) => debug!(client = %addr, "client disconnected"),
        Err(ServerError::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionReset => {
            debug!(client = %addr, "connection reset by client")
        }
        Err(e) => warn!(client = %addr, error = %e, "connection closed on error"),
    }

    stats.connection_closed();
}

async fn connection_loop(
    stream: TcpStream,
    addr: SocketAddr,
    handler: &CommandHandler,
    stats: &ConnectionStats,
) -> Result<(), ServerError> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // protocol disambiguation: text claims lowercase first bytes and is
    // also the fallback, being the only protocol implemented
    if !sniff_text(&mut reader).await? {
        debug!(client = %addr, "first byte is not text protocol, falling back to text");
    }

    let mut parser = TextParser::new(reader);
    let mut responder = TextResponder::new(BufWriter::new(write_half));

    loop {
        match parser.parse().await {
            Ok(command) => {
                stats.command_processed();
                match handler.dispatch(command, &mut responder).await? {
                    Flow::Continue => {}
                    Flow::Quit => return Ok(()),
                }
            }
            Err(e) if e.is_client_error() => {
                // malformed line: reply and keep the connection
                warn!(client = %addr, error = %e, "bad request line");
                responder.error(&ServerError::Protocol(e)).await?;
            }
            Err(ProtocolError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
}
