//! The sync engine: one instance per attached project.
//!
//! The engine owns the entity index, the change-detection cache, the
//! last-synced snapshot, the joined-document set and the path locks. Handlers
//! for local and remote events are plain async methods; the caller spawns one
//! task per event against an `Arc<SyncEngine<_>>`.
//!
//! Shared state sits behind one `std::sync::Mutex` that is only ever locked
//! between awaits, never across one. The path locks are the only exclusion
//! between handlers.

mod local;
mod pull;
mod remote;

pub use local::LocalEvent;
pub use pull::PullReport;

use crate::cache::{BaseContent, ContentHash, FileCache};
use crate::collaborators::{Collaborator, CollaboratorTable};
use crate::config::SyncConfig;
use crate::conflict::{ConflictResolver, ConflictState};
use crate::entity::{Entity, EntityKind, ProjectSnapshot};
use crate::fs::{FileSystem, FsError};
use crate::ignore::{IgnorePredicate, NoIgnore};
use crate::index::{self, EntityIndex, IndexError, PathChange};
use crate::lock::PathLocks;
use crate::ot::{self, OtError};
use crate::protocol::DocSnapshot;
use crate::status::{StatusBus, SyncStatus};
use crate::transport::{DocumentSession, ProjectApi, TransportError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Ot(#[from] OtError),

    #[error("Not known to the remote project: {0}")]
    UnknownPath(String),

    #[error("Path is busy: {0}")]
    Busy(String),

    #[error("No server identity for {0}; the project tree was not available")]
    Unresolved(String),
}

impl SyncError {
    /// Whether this is the vanished-file race the pipelines swallow.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Fs(e) if e.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Mutable engine state, guarded as one unit.
struct EngineState {
    index: EntityIndex,
    cache: FileCache,
    base: BaseContent,
    joined: HashSet<String>,
    collaborators: CollaboratorTable,
    session: Option<Arc<dyn DocumentSession>>,
    last_synced: Option<DateTime<Utc>>,
}

pub struct SyncEngine<F: FileSystem> {
    fs: Arc<F>,
    api: Arc<dyn ProjectApi>,
    resolver: Arc<dyn ConflictResolver>,
    ignore: Arc<dyn IgnorePredicate>,
    config: SyncConfig,
    status: Arc<StatusBus>,
    locks: PathLocks,
    state: Mutex<EngineState>,
    conflict: Mutex<ConflictState>,
}

impl<F: FileSystem> SyncEngine<F> {
    pub fn new(
        fs: Arc<F>,
        api: Arc<dyn ProjectApi>,
        resolver: Arc<dyn ConflictResolver>,
        config: SyncConfig,
    ) -> Self {
        Self {
            fs,
            api,
            resolver,
            ignore: Arc::new(NoIgnore),
            state: Mutex::new(EngineState {
                index: EntityIndex::new(),
                cache: FileCache::new(config.debounce),
                base: BaseContent::new(),
                joined: HashSet::new(),
                collaborators: CollaboratorTable::new(),
                session: None,
                last_synced: None,
            }),
            config,
            status: Arc::new(StatusBus::new()),
            locks: PathLocks::new(),
            conflict: Mutex::new(ConflictState::default()),
        }
    }

    pub fn with_ignore(mut self, ignore: Arc<dyn IgnorePredicate>) -> Self {
        self.ignore = ignore;
        self
    }

    /// Seed the last-synced snapshot persisted by a previous run.
    pub fn restore(&self, base: BaseContent, last_synced: Option<DateTime<Utc>>) {
        self.with_state(|state| {
            state.base = base;
            state.last_synced = last_synced;
        });
    }

    /// Attach to a live session and rebuild the index from its snapshot.
    pub fn attach(&self, session: Arc<dyn DocumentSession>, snapshot: &ProjectSnapshot) {
        let index = EntityIndex::build(snapshot);
        info!("Attached to project {} ({} entities)", snapshot.id, index.len());
        self.with_state(|state| {
            state.index = index;
            state.session = Some(session);
            state.joined.clear();
            state.collaborators.clear();
        });
        self.status.set(SyncStatus::Idle);
    }

    /// Attach without a live session.
    ///
    /// Indexes the project tree fetched over HTTP. When only the flat listing
    /// is available, entities get synthetic identities: they are reconciled
    /// by path but never addressed on the server.
    pub async fn attach_offline(&self) -> Result<()> {
        let index = match self.api.project_snapshot().await {
            Ok(snapshot) => EntityIndex::build(&snapshot),
            Err(e) => {
                warn!("Project tree unavailable ({}), indexing the flat listing", e);
                EntityIndex::build_from_flat(&self.api.list_entities().await?)
            }
        };
        info!("Attached without live session ({} entities)", index.len());
        self.with_state(|state| {
            state.index = index;
            state.session = None;
            state.joined.clear();
            state.collaborators.clear();
        });
        self.status.set(SyncStatus::Idle);
        Ok(())
    }

    /// Leave every joined document and drop the session.
    pub async fn detach(&self) {
        let (session, joined) = self.with_state(|state| {
            state.collaborators.clear();
            (state.session.take(), std::mem::take(&mut state.joined))
        });
        if let Some(session) = session {
            for doc_id in joined {
                if let Err(e) = session.leave_doc(&doc_id).await {
                    debug!("Leaving {} on detach failed: {}", doc_id, e);
                }
            }
        }
        self.status.set(SyncStatus::Disconnected);
    }

    /// The session went away underneath us; forget live state without calls.
    pub(crate) fn session_lost(&self) {
        self.with_state(|state| {
            state.session = None;
            state.joined.clear();
            state.collaborators.clear();
        });
        self.status.set(SyncStatus::Disconnected);
    }

    pub fn status(&self) -> Arc<StatusBus> {
        Arc::clone(&self.status)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_live(&self) -> bool {
        self.with_state(|state| state.session.is_some())
    }

    pub fn is_joined(&self, doc_id: &str) -> bool {
        self.with_state(|state| state.joined.contains(doc_id))
    }

    /// Entity at a local relative path.
    pub fn lookup(&self, local: &str) -> Option<Entity> {
        self.with_state(|state| state.index.lookup_local(local).cloned())
    }

    /// Every indexed entity, sorted by path.
    pub fn entities(&self) -> Vec<Entity> {
        self.with_state(|state| state.index.entities())
    }

    pub fn base_content(&self) -> BaseContent {
        self.with_state(|state| state.base.clone())
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.with_state(|state| state.last_synced)
    }

    pub fn collaborators(&self) -> Vec<Collaborator> {
        self.with_state(|state| state.collaborators.all())
    }

    /// Fetch the connected collaborators and replace the table with them.
    pub async fn refresh_collaborators(&self) -> Result<Vec<Collaborator>> {
        let Some(session) = self.session() else {
            return Ok(Vec::new());
        };
        let users = session.connected_users().await?;
        self.with_state(|state| state.collaborators.replace(users.clone()));
        Ok(users)
    }

    /// Publish our cursor position in the document at `local`.
    pub async fn update_cursor(&self, local: &str, row: u32, column: u32) -> Result<()> {
        let Some(session) = self.session() else {
            return Ok(());
        };
        let entity = self
            .lookup(local)
            .filter(|e| e.kind == EntityKind::Doc)
            .ok_or_else(|| SyncError::UnknownPath(local.to_string()))?;
        session.update_position(&entity.id, row, column).await?;
        Ok(())
    }

    /// Rename the entity at `local` on the remote and mirror it locally.
    pub async fn rename_remote(&self, local: &str, new_name: &str) -> Result<()> {
        let _guard = self
            .locks
            .try_acquire(local)
            .ok_or_else(|| SyncError::Busy(local.to_string()))?;
        let entity = self
            .lookup(local)
            .ok_or_else(|| SyncError::UnknownPath(local.to_string()))?;

        self.api
            .rename_entity(entity.kind, remote_id(&entity)?, new_name)
            .await?;
        let changes = self.with_state(|state| state.index.rename(&entity.id, new_name))?;
        self.relocate_local(&changes).await?;
        info!("Renamed {} to {}", local, new_name);
        Ok(())
    }

    /// Move the entity at `local` into the folder at `new_parent` on the remote
    /// and mirror it locally.
    pub async fn move_remote(&self, local: &str, new_parent: &str) -> Result<()> {
        let _guard = self
            .locks
            .try_acquire(local)
            .ok_or_else(|| SyncError::Busy(local.to_string()))?;
        let (entity, folder) = self.with_state(|state| {
            (
                state.index.lookup_local(local).cloned(),
                state
                    .index
                    .lookup_by_path(&index::folder_path(new_parent))
                    .cloned(),
            )
        });
        let entity = entity.ok_or_else(|| SyncError::UnknownPath(local.to_string()))?;
        let folder = folder.ok_or_else(|| SyncError::UnknownPath(new_parent.to_string()))?;

        self.api
            .move_entity(entity.kind, remote_id(&entity)?, remote_id(&folder)?)
            .await?;
        let changes = self.with_state(|state| state.index.move_to(&entity.id, &folder.id))?;
        self.relocate_local(&changes).await?;
        info!("Moved {} into {}/", local, new_parent.trim_matches('/'));
        Ok(())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn session(&self) -> Option<Arc<dyn DocumentSession>> {
        self.with_state(|state| state.session.clone())
    }

    fn is_ignored(&self, local: &str) -> bool {
        self.ignore.should_ignore(local)
    }

    /// Record `content` as synced for `local` in both the cache and baseContent.
    fn record_synced(&self, local: &str, content: &[u8]) {
        let hash = ContentHash::of(content);
        self.with_state(|state| {
            state.cache.record(local, hash.clone(), Instant::now());
            state.base.set(local, hash);
        });
    }

    /// Forget `local` and everything below it in both caches.
    fn purge(&self, local: &str) {
        self.with_state(|state| {
            state.cache.remove_tree(local);
            state.base.remove_tree(local);
        });
    }

    /// Join a document and fetch its content.
    ///
    /// The server treats a re-join as a fresh content fetch, so this always
    /// calls `join_doc`; the joined set only tracks what to leave later.
    async fn join(&self, session: &Arc<dyn DocumentSession>, doc_id: &str) -> Result<DocSnapshot> {
        let snapshot = session.join_doc(doc_id).await?;
        self.with_state(|state| state.joined.insert(doc_id.to_string()));
        Ok(snapshot)
    }

    /// Leave a document if joined. Errors are logged, not returned.
    async fn leave(&self, doc_id: &str) {
        let session = self.with_state(|state| {
            if state.joined.remove(doc_id) {
                state.session.clone()
            } else {
                None
            }
        });
        if let Some(session) = session {
            if let Err(e) = session.leave_doc(doc_id).await {
                debug!("Leaving {} failed: {}", doc_id, e);
            }
        }
    }

    /// Push `content` for an indexed entity to the remote.
    ///
    /// Documents go through OT against the freshly fetched version when a
    /// session exists; everything else, and documents without a session, is
    /// uploaded.
    async fn push_content(&self, entity: &Entity, content: &[u8]) -> Result<()> {
        let local = index::local_path(&entity.path);
        self.status.set_with(SyncStatus::Pushing, "Pushing", Some(&local));

        let session = match entity.kind {
            EntityKind::Doc => self.session(),
            _ => None,
        };
        if let Some(session) = session {
            let remote = self.join(&session, &entity.id).await?;
            let text = String::from_utf8_lossy(content);
            let ops = ot::diff(&remote.text(), &text);
            if ops.is_empty() {
                debug!("{} already matches remote version {}", local, remote.version);
                return Ok(());
            }
            session.apply_update(&entity.id, ops, remote.version).await?;
            debug!("Submitted update for {} at version {}", local, remote.version);
            return Ok(());
        }

        let parent_id = entity
            .parent
            .clone()
            .ok_or_else(|| SyncError::UnknownPath(local.clone()))?;
        if index::is_synthetic(&parent_id) {
            return Err(SyncError::Unresolved(index::parent_path(&entity.path)));
        }
        let uploaded = self
            .api
            .upload(&parent_id, &entity.name, content.to_vec())
            .await?;
        if uploaded.id != entity.id {
            // Replacing a file gives it a new identity
            self.with_state(|state| -> Result<()> {
                state.index.remove(&entity.id);
                state
                    .index
                    .insert(&parent_id, &uploaded.id, uploaded.kind, &entity.name)?;
                Ok(())
            })?;
        }
        debug!("Uploaded {} ({} bytes)", local, content.len());
        Ok(())
    }

    /// Identity of the remote folder at local directory `dir`, creating it and
    /// any missing ancestors.
    async fn ensure_remote_folder(&self, dir: &str) -> Result<String> {
        let dir = dir.trim_matches('/');
        let mut missing = Vec::new();
        let mut parent_id = None;
        let mut cursor = dir.to_string();
        loop {
            let found = self.with_state(|state| {
                state
                    .index
                    .lookup_by_path(&index::folder_path(&cursor))
                    .map(|e| e.id.clone())
            });
            if let Some(id) = found {
                if index::is_synthetic(&id) {
                    return Err(SyncError::Unresolved(index::folder_path(&cursor)));
                }
                parent_id = Some(id);
                break;
            }
            if cursor.is_empty() {
                break;
            }
            match cursor.rsplit_once('/') {
                Some((up, name)) => {
                    missing.push(name.to_string());
                    cursor = up.to_string();
                }
                None => {
                    missing.push(std::mem::take(&mut cursor));
                }
            }
        }
        let mut parent_id = parent_id.ok_or_else(|| SyncError::UnknownPath("/".to_string()))?;

        for name in missing.into_iter().rev() {
            let id = self.api.create_folder(&parent_id, &name).await?;
            self.with_state(|state| state.index.insert(&parent_id, &id, EntityKind::Folder, &name))?;
            debug!("Created remote folder {}", name);
            parent_id = id;
        }
        Ok(parent_id)
    }

    /// Create the local file at `local` on the remote and push its content.
    async fn create_remote(&self, local: &str, content: &[u8]) -> Result<Entity> {
        let (dir, name) = match local.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", local),
        };
        let parent_id = self.ensure_remote_folder(dir).await?;

        if self.config.is_text(local) {
            let id = self.api.create_doc(&parent_id, name).await?;
            let entity =
                self.with_state(|state| state.index.insert(&parent_id, &id, EntityKind::Doc, name))?;
            if let Some(session) = self.session() {
                self.join(&session, &id).await?;
            }
            if !content.is_empty() {
                self.push_content(&entity, content).await?;
            }
            info!("Created document {}", local);
            Ok(entity)
        } else {
            let uploaded = self.api.upload(&parent_id, name, content.to_vec()).await?;
            let entity = self.with_state(|state| {
                state
                    .index
                    .insert(&parent_id, &uploaded.id, uploaded.kind, name)
            })?;
            info!("Uploaded new file {}", local);
            Ok(entity)
        }
    }

    /// Apply index path changes to the local tree and re-key the caches.
    async fn relocate_local(&self, changes: &[PathChange]) -> Result<()> {
        let Some(first) = changes.first() else {
            return Ok(());
        };
        let from = index::local_path(&first.old_path);
        let to = index::local_path(&first.new_path);
        match self.fs.rename(&from, &to).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("{} not present locally, nothing to rename", from),
            Err(e) => return Err(e.into()),
        }
        self.with_state(|state| {
            state.cache.migrate(&from, &to);
            state.base.migrate(&from, &to);
        });
        Ok(())
    }

    /// Write `content` to `local` unless it already holds exactly those bytes.
    ///
    /// Returns whether a write happened.
    async fn write_if_changed(&self, local: &str, content: &[u8]) -> Result<bool> {
        match self.fs.read(local).await {
            Ok(existing) if existing == content => return Ok(false),
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.fs.write(local, content).await?;
        Ok(true)
    }

    /// Report a handler failure through the status stream.
    fn report(&self, local: &str, error: &SyncError) {
        warn!("Sync of {} failed: {}", local, error);
        self.status
            .set_with(SyncStatus::Error, error.to_string(), Some(local));
    }
}

/// The server identity of `entity`, refusing path-derived ones.
fn remote_id(entity: &Entity) -> Result<&str> {
    if index::is_synthetic(&entity.id) {
        return Err(SyncError::Unresolved(entity.path.clone()));
    }
    Ok(&entity.id)
}
