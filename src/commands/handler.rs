//! Command Handler
//!
//! Binds parsed commands to store operations and replies.
//!
//! Semantics worth calling out:
//!
//! - A non-zero `exptime` is a TTL in seconds and becomes an absolute
//!   unix-seconds expiry here, for all write commands including
//!   append/prepend.
//! - `add` requires the key to be absent, `replace` requires it to be
//!   present; neither mutates anything when its precondition fails.
//! - `append`/`prepend` are read-modify-write against the store and miss
//!   with `NOT_FOUND` when the key is absent.
//! - Batch `get` emits one response per requested key in order, then an
//!   `END` terminator.

use crate::protocol::responder::TextResponder;
use crate::protocol::types::{
    Command, DeleteRequest, GetRequest, GetResponse, ServerError, SetRequest, TouchRequest,
};
use crate::storage::{Store, StoreError};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWrite;
use tracing::{trace, warn};

/// What the connection loop should do after a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The client asked to quit; the farewell is already written.
    Quit,
}

/// Executes commands against the shared store.
#[derive(Clone)]
pub struct CommandHandler {
    store: Arc<Store>,
}

impl CommandHandler {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Runs one command and writes its reply.
    ///
    /// App errors are replied inline and reported as success with
    /// [`Flow::Continue`]; only connection-fatal errors come back as
    /// `Err`.
    pub async fn dispatch<W: AsyncWrite + Unpin>(
        &self,
        command: Command,
        responder: &mut TextResponder<W>,
    ) -> Result<Flow, ServerError> {
        trace!(?command, "dispatching");

        let outcome = match command {
            Command::Set(req) => self.set(&req, responder).await,
            Command::Add(req) => self.add(&req, responder).await,
            Command::Replace(req) => self.replace(&req, responder).await,
            Command::Append(req) => self.concat(&req, responder, false).await,
            Command::Prepend(req) => self.concat(&req, responder, true).await,
            Command::Get(req) => self.get(&req, responder).await,
            Command::Delete(req) => self.delete(&req, responder).await,
            Command::Touch(req) => self.touch(&req, responder).await,
            Command::Noop => responder.noop().await.map_err(ServerError::from),
            Command::Version => responder.version().await.map_err(ServerError::from),
            Command::Quit => {
                responder.bye().await?;
                return Ok(Flow::Quit);
            }
            Command::Unknown(name) => {
                warn!(command = %name, "unknown command");
                Err(ServerError::UnknownCommand)
            }
        };

        match outcome {
            Ok(()) => Ok(Flow::Continue),
            Err(e) if e.is_app_error() => {
                responder.error(&e).await?;
                Ok(Flow::Continue)
            }
            Err(e) => Err(e),
        }
    }

    async fn set<W: AsyncWrite + Unpin>(
        &self,
        req: &SetRequest,
        responder: &mut TextResponder<W>,
    ) -> Result<(), ServerError> {
        self.store
            .set(&req.key, &req.data, absolute_expiry(req.exptime))?;
        responder.stored().await?;
        Ok(())
    }

    /// `add` stores only when the key is not currently live.
    async fn add<W: AsyncWrite + Unpin>(
        &self,
        req: &SetRequest,
        responder: &mut TextResponder<W>,
    ) -> Result<(), ServerError> {
        match self.store.get(&req.key) {
            Ok(_) => return Err(StoreError::KeyExists.into()),
            Err(e) if e.is_miss() => {}
            Err(e) => return Err(e.into()),
        }
        self.store
            .set(&req.key, &req.data, absolute_expiry(req.exptime))?;
        responder.stored().await?;
        Ok(())
    }

    /// `replace` stores only when the key is currently live.
    async fn replace<W: AsyncWrite + Unpin>(
        &self,
        req: &SetRequest,
        responder: &mut TextResponder<W>,
    ) -> Result<(), ServerError> {
        match self.store.get(&req.key) {
            Ok(_) => {}
            Err(e) if e.is_miss() => return Err(StoreError::KeyNotFound.into()),
            Err(e) => return Err(e.into()),
        }
        self.store
            .set(&req.key, &req.data, absolute_expiry(req.exptime))?;
        responder.stored().await?;
        Ok(())
    }

    /// Shared read-modify-write for append and prepend.
    async fn concat<W: AsyncWrite + Unpin>(
        &self,
        req: &SetRequest,
        responder: &mut TextResponder<W>,
        prepend: bool,
    ) -> Result<(), ServerError> {
        let existing = match self.store.get(&req.key) {
            Ok(value) => value,
            Err(e) if e.is_miss() => return Err(StoreError::KeyNotFound.into()),
            Err(e) => return Err(e.into()),
        };

        let mut data = Vec::with_capacity(existing.len() + req.data.len());
        if prepend {
            data.extend_from_slice(&req.data);
            data.extend_from_slice(&existing);
        } else {
            data.extend_from_slice(&existing);
            data.extend_from_slice(&req.data);
        }

        self.store
            .set(&req.key, &data, absolute_expiry(req.exptime))?;
        responder.stored().await?;
        Ok(())
    }

    async fn get<W: AsyncWrite + Unpin>(
        &self,
        req: &GetRequest,
        responder: &mut TextResponder<W>,
    ) -> Result<(), ServerError> {
        for (idx, key) in req.keys.iter().enumerate() {
            let response = match self.store.get(key) {
                Ok(value) => GetResponse {
                    key: key.clone(),
                    data: Bytes::from(value),
                    flags: 0,
                    opaque: req.opaques[idx],
                    miss: false,
                    quiet: req.quiet[idx],
                },
                Err(e) if e.is_app_error() => GetResponse {
                    key: key.clone(),
                    data: Bytes::new(),
                    flags: 0,
                    opaque: req.opaques[idx],
                    miss: true,
                    quiet: req.quiet[idx],
                },
                Err(e) => return Err(e.into()),
            };
            responder.get(&response).await?;
        }
        responder.get_end().await?;
        Ok(())
    }

    async fn delete<W: AsyncWrite + Unpin>(
        &self,
        req: &DeleteRequest,
        responder: &mut TextResponder<W>,
    ) -> Result<(), ServerError> {
        if self.store.delete(&req.key)? {
            responder.deleted().await?;
            Ok(())
        } else {
            Err(StoreError::KeyNotFound.into())
        }
    }

    async fn touch<W: AsyncWrite + Unpin>(
        &self,
        req: &TouchRequest,
        responder: &mut TextResponder<W>,
    ) -> Result<(), ServerError> {
        self.store
            .touch(&req.key, absolute_expiry(req.exptime))?;
        responder.touched().await?;
        Ok(())
    }
}

/// Converts a client TTL into the absolute unix-seconds expiry the store
/// persists. Zero stays zero ("never").
fn absolute_expiry(exptime: u32) -> u32 {
    if exptime == 0 {
        return 0;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    exptime.saturating_add(now)
}
