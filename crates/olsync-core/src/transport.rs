//! Seams to the remote service.
//!
//! Implementations:
//! - `SocketSession` (in olsync-daemon) - live socket, [`DocumentSession`]
//! - `HttpApi` (in olsync-daemon) - stateless HTTP calls, [`ProjectApi`]

use crate::collaborators::Collaborator;
use crate::entity::{EntityKind, FlatEntity, ProjectSnapshot};
use crate::ot::TextOp;
use crate::protocol::{DocSnapshot, ProtocolError};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    RequestTimeout(String),

    #[error("Connection closed")]
    Closed,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Bound `request` by `limit`, failing with [`TransportError::RequestTimeout`].
///
/// Dropping the request future on timeout is the cancellation.
pub async fn with_timeout<T, Fut>(limit: Duration, what: &str, request: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, request).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::RequestTimeout(what.to_string())),
    }
}

/// Live, per-project document session.
#[async_trait]
pub trait DocumentSession: Send + Sync {
    /// Subscribe to live updates for a document and fetch its content.
    ///
    /// Joining an already joined document returns its current content again.
    async fn join_doc(&self, doc_id: &str) -> Result<DocSnapshot>;

    async fn leave_doc(&self, doc_id: &str) -> Result<()>;

    /// Submit `ops` against document version `version`.
    async fn apply_update(&self, doc_id: &str, ops: Vec<TextOp>, version: u64) -> Result<()>;

    async fn connected_users(&self) -> Result<Vec<Collaborator>>;

    async fn update_position(&self, doc_id: &str, row: u32, column: u32) -> Result<()>;

    /// Tear the session down. Later calls fail with [`TransportError::Closed`].
    async fn close(&self);
}

/// Entity created by an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    pub id: String,
    pub kind: EntityKind,
}

/// Stateless project API, also the fallback when no session can be established.
#[async_trait]
pub trait ProjectApi: Send + Sync {
    /// Full project tree with the identities the server issued.
    async fn project_snapshot(&self) -> Result<ProjectSnapshot>;

    /// Flat `(path, type)` listing of the whole project.
    async fn list_entities(&self) -> Result<Vec<FlatEntity>>;

    async fn doc_content(&self, doc_id: &str) -> Result<Vec<u8>>;

    async fn file_content(&self, file_id: &str) -> Result<Vec<u8>>;

    /// Upload bytes as `name` into a folder, replacing any entity of that name.
    async fn upload(&self, folder_id: &str, name: &str, content: Vec<u8>) -> Result<Uploaded>;

    /// Create an empty document; returns its identity.
    async fn create_doc(&self, parent_id: &str, name: &str) -> Result<String>;

    /// Create a folder; returns its identity.
    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<String>;

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<()>;

    async fn rename_entity(&self, kind: EntityKind, id: &str, new_name: &str) -> Result<()>;

    async fn move_entity(&self, kind: EntityKind, id: &str, folder_id: &str) -> Result<()>;
}
