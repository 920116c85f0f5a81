//! Remote event pipeline: server notifications applied to the local tree.

use super::{Result, SyncEngine};
use crate::entity::{EntityKind, EntityRef};
use crate::fs::FileSystem;
use crate::index;
use crate::ot;
use crate::protocol::{OtUpdate, ServerEvent};
use crate::status::SyncStatus;
use tracing::{debug, info, warn};

impl<F: FileSystem> SyncEngine<F> {
    /// Handle one server event. Never fails; errors land in the status stream.
    pub async fn handle_remote(&self, event: ServerEvent) {
        match event {
            ServerEvent::EntityCreated {
                parent_id,
                kind,
                entity,
            } => self.on_remote_created(&parent_id, kind, &entity).await,
            ServerEvent::EntityRenamed { id, name } => self.on_remote_renamed(&id, &name).await,
            ServerEvent::EntityRemoved { id } => self.on_remote_removed(&id).await,
            ServerEvent::EntityMoved { id, new_parent_id } => {
                self.on_remote_moved(&id, &new_parent_id).await
            }
            ServerEvent::OtUpdateApplied(update) => {
                if update.is_ack() {
                    debug!("Update for {} acknowledged at version {}", update.doc, update.v);
                } else {
                    self.on_remote_update(&update).await;
                }
            }
            ServerEvent::OtUpdateError { doc_id, message } => {
                let path = doc_id
                    .and_then(|id| self.with_state(|state| state.index.lookup_by_id(&id).cloned()))
                    .map(|entity| index::local_path(&entity.path));
                warn!("Server rejected update: {}", message);
                self.status
                    .set_with(SyncStatus::Error, message, path.as_deref());
            }
            ServerEvent::CollaboratorUpdated(collaborator) => {
                self.with_state(|state| state.collaborators.upsert(collaborator));
            }
            ServerEvent::CollaboratorDisconnected { client_id } => {
                self.with_state(|state| state.collaborators.remove(&client_id));
            }
            ServerEvent::ForceDisconnect { reason } => {
                warn!("Server forced disconnect: {}", reason);
                self.session_lost();
            }
            ServerEvent::Closed => {
                info!("Connection closed");
                self.session_lost();
            }
            ServerEvent::ConnectionAccepted { .. }
            | ServerEvent::ConnectionRejected { .. }
            | ServerEvent::JoinProjectResponse(_) => {
                debug!("Ignoring handshake event outside of a handshake");
            }
            ServerEvent::Unknown { name, .. } => debug!("Ignoring unknown event {}", name),
        }
    }

    async fn on_remote_created(&self, parent_id: &str, kind: EntityKind, entity: &EntityRef) {
        let resolved = self.with_state(|state| {
            let parent = state.index.lookup_by_id(parent_id)?;
            let path = index::child_path(&parent.path, &entity.name, kind);
            let known = state
                .index
                .lookup_by_id(&entity.id)
                .is_some_and(|existing| existing.path == path);
            Some((path, known))
        });
        let Some((path, known)) = resolved else {
            warn!("Parent {} of new {} {} is unknown, dropping", parent_id, kind, entity.name);
            return;
        };
        if known {
            debug!("{} already indexed, echo of our own create", path);
            return;
        }
        let local = index::local_path(&path);
        if self.is_ignored(&local) {
            return;
        }
        let Some(_guard) = self.locks.try_acquire(&local) else {
            debug!("{} busy, deferring remote create", local);
            return;
        };
        let result = self.materialize(parent_id, kind, entity, &local).await;
        self.finish_remote(&local, result);
    }

    async fn materialize(
        &self,
        parent_id: &str,
        kind: EntityKind,
        entity: &EntityRef,
        local: &str,
    ) -> Result<()> {
        self.with_state(|state| state.index.insert(parent_id, &entity.id, kind, &entity.name))?;

        match kind {
            EntityKind::Folder => {
                self.fs.mkdir(local).await?;
            }
            EntityKind::Doc => {
                let content = match self.session() {
                    Some(session) => self.join(&session, &entity.id).await?.text().into_bytes(),
                    None => self.api.doc_content(&entity.id).await?,
                };
                self.write_if_changed(local, &content).await?;
                self.record_synced(local, &content);
            }
            EntityKind::File => {
                let content = self.api.file_content(&entity.id).await?;
                self.write_if_changed(local, &content).await?;
                self.record_synced(local, &content);
            }
        }
        info!("Remote created {}", local);
        Ok(())
    }

    async fn on_remote_renamed(&self, id: &str, new_name: &str) {
        let Some(entity) = self.with_state(|state| state.index.lookup_by_id(id).cloned()) else {
            warn!("Rename of unknown entity {}, dropping", id);
            return;
        };
        let local = index::local_path(&entity.path);
        let Some(_guard) = self.locks.try_acquire(&local) else {
            debug!("{} busy, deferring remote rename", local);
            return;
        };
        let result = self.apply_remote_rename(id, new_name).await;
        self.finish_remote(&local, result);
    }

    async fn apply_remote_rename(&self, id: &str, new_name: &str) -> Result<()> {
        let changes = self.with_state(|state| state.index.rename(id, new_name))?;
        self.relocate_local(&changes).await?;
        if let Some(change) = changes.first() {
            info!("Remote renamed {} to {}", change.old_path, change.new_path);
        }
        Ok(())
    }

    async fn on_remote_moved(&self, id: &str, new_parent_id: &str) {
        let Some(entity) = self.with_state(|state| state.index.lookup_by_id(id).cloned()) else {
            warn!("Move of unknown entity {}, dropping", id);
            return;
        };
        let local = index::local_path(&entity.path);
        let Some(_guard) = self.locks.try_acquire(&local) else {
            debug!("{} busy, deferring remote move", local);
            return;
        };
        let result = self.apply_remote_move(id, new_parent_id).await;
        self.finish_remote(&local, result);
    }

    async fn apply_remote_move(&self, id: &str, new_parent_id: &str) -> Result<()> {
        let changes = self.with_state(|state| state.index.move_to(id, new_parent_id))?;
        self.relocate_local(&changes).await?;
        if let Some(change) = changes.first() {
            info!("Remote moved {} to {}", change.old_path, change.new_path);
        }
        Ok(())
    }

    async fn on_remote_removed(&self, id: &str) {
        let Some(entity) = self.with_state(|state| state.index.lookup_by_id(id).cloned()) else {
            debug!("Removal of unknown entity {}, dropping", id);
            return;
        };
        let local = index::local_path(&entity.path);
        let Some(_guard) = self.locks.try_acquire(&local) else {
            debug!("{} busy, deferring remote removal", local);
            return;
        };
        let result = self.apply_remote_removal(id, &local).await;
        self.finish_remote(&local, result);
    }

    async fn apply_remote_removal(&self, id: &str, local: &str) -> Result<()> {
        let removed = self.with_state(|state| state.index.remove(id));
        for gone in &removed {
            self.leave(&gone.id).await;
        }
        match self.fs.remove_all(local).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.purge(local);
        info!("Remote removed {}", local);
        Ok(())
    }

    async fn on_remote_update(&self, update: &OtUpdate) {
        let Some(entity) = self.with_state(|state| state.index.lookup_by_id(&update.doc).cloned())
        else {
            warn!("Update for unknown document {}, dropping", update.doc);
            return;
        };
        let local = index::local_path(&entity.path);
        let Some(_guard) = self.locks.try_acquire(&local) else {
            debug!("{} busy, deferring remote update", local);
            return;
        };
        let result = self.apply_remote_update(&local, update).await;
        self.finish_remote(&local, result);
    }

    async fn apply_remote_update(&self, local: &str, update: &OtUpdate) -> Result<()> {
        let current = match self.fs.read(local).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8_lossy(&current);
        let ops = update.op.as_deref().unwrap_or_default();
        let updated = ot::apply(&text, ops)?;

        if updated.as_bytes() == current.as_slice() {
            debug!("Update v{} leaves {} unchanged", update.v, local);
        } else {
            self.fs.write(local, updated.as_bytes()).await?;
            debug!("Applied update v{} to {}", update.v, local);
        }
        self.record_synced(local, updated.as_bytes());
        Ok(())
    }

    fn finish_remote(&self, local: &str, result: Result<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!("{} vanished while applying remote change", local),
            Err(e) => self.report(local, &e),
        }
    }
}
