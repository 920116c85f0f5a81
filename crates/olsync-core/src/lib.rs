//! olsync-core: sync engine keeping a local directory and a collaborative
//! LaTeX project in two-way sync.
//!
//! This crate provides:
//! - The entity tree index mapping remote identities to local paths
//! - Local and remote change pipelines with echo suppression
//! - OT diff/apply for live document updates
//! - The pull-all reconciliation pass with conflict resolution
//! - The connection manager and the socket wire protocol
//! - FileSystem, DocumentSession and ProjectApi trait abstractions

pub mod cache;
pub mod collaborators;
pub mod config;
pub mod conflict;
pub mod connection;
pub mod engine;
pub mod entity;
pub mod fs;
pub mod ignore;
pub mod index;
pub mod lock;
pub mod ot;
pub mod protocol;
pub mod status;
pub mod transport;

pub use cache::{BaseContent, ContentHash};
pub use collaborators::Collaborator;
pub use config::SyncConfig;
pub use conflict::{
    Conflict, ConflictAnswer, ConflictResolver, LocalOnlyAction, PolicyResolver,
    RemoteDeletedAction, Resolution,
};
pub use connection::{
    ConnectError, ConnectionManager, ConnectionState, Connector, Established, ReconnectPolicy,
    Scheme,
};
pub use engine::{LocalEvent, PullReport, SyncEngine, SyncError};
pub use entity::{Entity, EntityKind, FlatEntity, ProjectSnapshot};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use ignore::{IgnorePredicate, NoIgnore};
pub use index::EntityIndex;
pub use protocol::ServerEvent;
pub use status::{StatusBus, StatusEvent, Subscription, SyncStatus};
pub use transport::{DocumentSession, ProjectApi, TransportError, Uploaded};
