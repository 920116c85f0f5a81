//! Local change pipeline: filesystem events pushed to the remote.

use super::{Result, SyncEngine, SyncError};
use crate::cache::{ContentHash, Observation};
use crate::fs::FileSystem;
use crate::index;
use crate::status::SyncStatus;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A filesystem change at a path relative to the sync root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Created(String),
    Modified(String),
    Deleted(String),
}

impl LocalEvent {
    pub fn path(&self) -> &str {
        match self {
            LocalEvent::Created(path) | LocalEvent::Modified(path) | LocalEvent::Deleted(path) => path,
        }
    }
}

impl<F: FileSystem> SyncEngine<F> {
    /// Handle one local event. Never fails; errors land in the status stream.
    pub async fn handle_local(&self, event: LocalEvent) {
        match event {
            LocalEvent::Created(path) => self.on_created(&path).await,
            LocalEvent::Modified(path) => self.on_modified(&path).await,
            LocalEvent::Deleted(path) => self.on_deleted(&path).await,
        }
    }

    pub async fn on_created(&self, local: &str) {
        if self.is_ignored(local) {
            return;
        }
        let Some(_guard) = self.locks.try_acquire(local) else {
            debug!("{} already in flight, dropping create", local);
            return;
        };
        let result = self.push_created(local).await;
        self.finish(local, result);
    }

    pub async fn on_modified(&self, local: &str) {
        if self.is_ignored(local) {
            return;
        }
        let Some(_guard) = self.locks.try_acquire(local) else {
            debug!("{} already in flight, dropping change", local);
            return;
        };
        let result = self.push_modified(local).await;
        self.finish(local, result);
    }

    pub async fn on_deleted(&self, local: &str) {
        if self.is_ignored(local) {
            return;
        }
        let Some(_guard) = self.locks.try_acquire(local) else {
            debug!("{} already in flight, dropping delete", local);
            return;
        };
        let result = self.push_deleted(local).await;
        self.finish(local, result);
    }

    fn finish(&self, local: &str, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("{} vanished while handling it", local),
            Err(e) => self.report(local, &e),
        }
    }

    async fn push_created(&self, local: &str) -> Result<()> {
        let stat = self.fs.stat(local).await?;
        let known = self.lookup(local);

        if stat.is_dir {
            if known.is_some() {
                debug!("{} is a known folder, nothing to create", local);
                return Ok(());
            }
            self.ensure_remote_folder(local).await?;
            info!("Created remote folder {}", local);
            return Ok(());
        }

        if known.is_some() {
            // Our own materialization, or a re-created path the remote already has
            return self.push_modified(local).await;
        }

        let content = self.fs.read(local).await?;
        self.status.set_with(SyncStatus::Pushing, "Creating", Some(local));
        self.create_remote(local, &content).await?;
        self.record_synced(local, &content);
        self.status.set(SyncStatus::Idle);
        Ok(())
    }

    async fn push_modified(&self, local: &str) -> Result<()> {
        let known = self.lookup(local);
        if known.as_ref().is_some_and(|e| e.kind.is_folder()) || self.fs.stat(local).await?.is_dir {
            return Ok(());
        }

        let content = self.fs.read(local).await?;
        let hash = ContentHash::of(&content);

        let observation = self.with_state(|state| state.cache.observe(local, &hash, Instant::now()));
        match observation {
            Observation::Unchanged => {
                debug!("{} unchanged, suppressing", local);
                return Ok(());
            }
            Observation::Debounced => {
                debug!("{} changed within debounce window, suppressing", local);
                return Ok(());
            }
            Observation::Changed => {}
        }

        let Some(entity) = known else {
            warn!("{} is not on the remote yet, not pushing", local);
            self.status.set_with(
                SyncStatus::Idle,
                "Not on the remote yet, create it first",
                Some(local),
            );
            return Ok(());
        };

        self.push_content(&entity, &content).await?;
        self.record_synced(local, &content);
        self.status.set(SyncStatus::Idle);
        Ok(())
    }

    async fn push_deleted(&self, local: &str) -> Result<()> {
        let Some(entity) = self.lookup(local) else {
            debug!("{} not indexed, nothing to delete remotely", local);
            return Ok(());
        };
        if entity.parent.is_none() {
            return Err(SyncError::UnknownPath(local.to_string()));
        }

        self.status.set_with(SyncStatus::Pushing, "Deleting", Some(local));
        self.api
            .delete_entity(entity.kind, super::remote_id(&entity)?)
            .await?;

        let removed = self.with_state(|state| state.index.remove(&entity.id));
        for gone in &removed {
            self.leave(&gone.id).await;
        }
        self.purge(&index::local_path(&entity.path));
        info!("Deleted {} remotely", local);
        self.status.set(SyncStatus::Idle);
        Ok(())
    }
}
