//! Reconciliation: the full pull-all pass.

use super::{Result, SyncEngine};
use crate::cache::ContentHash;
use crate::conflict::{self, Conflict, LocalOnlyAction, RemoteDeletedAction, Resolution};
use crate::entity::{Entity, EntityKind};
use crate::fs::{self, FileSystem};
use crate::index;
use crate::status::SyncStatus;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Counts from one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PullReport {
    /// Local files written with remote content
    pub downloaded: usize,
    /// Local content pushed to the remote
    pub uploaded: usize,
    /// Conflicts left alone
    pub skipped: usize,
    /// Paths where local and remote content differed
    pub conflicted: usize,
    /// Paths already identical on both sides
    pub unchanged: usize,
    /// Previously synced files no longer on the remote
    pub remote_deleted: usize,
    /// Local files never synced and absent remotely
    pub local_only: usize,
}

impl PullReport {
    /// Whether the pass touched either side.
    pub fn is_noop(&self) -> bool {
        self.downloaded == 0 && self.uploaded == 0
    }
}

impl std::fmt::Display for PullReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} downloaded, {} uploaded, {} unchanged, {} conflicted, {} skipped, {} remote-deleted, {} local-only",
            self.downloaded,
            self.uploaded,
            self.unchanged,
            self.conflicted,
            self.skipped,
            self.remote_deleted,
            self.local_only
        )
    }
}

impl<F: FileSystem> SyncEngine<F> {
    /// Compare every indexed entity with the local tree and settle differences.
    ///
    /// Errors propagate to the caller and leave the status at `error`.
    pub async fn pull_all(&self) -> Result<PullReport> {
        self.conflict
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
        self.status.set_with(SyncStatus::Pulling, "Pulling all files", None);

        match self.reconcile().await {
            Ok(report) => {
                self.with_state(|state| state.last_synced = Some(Utc::now()));
                info!("Pull complete: {}", report);
                self.status.set_with(SyncStatus::Idle, report.to_string(), None);
                Ok(report)
            }
            Err(e) => {
                warn!("Pull failed: {}", e);
                self.status.set_with(SyncStatus::Error, e.to_string(), None);
                Err(e)
            }
        }
    }

    async fn reconcile(&self) -> Result<PullReport> {
        let mut report = PullReport::default();
        let entities = self.entities();
        let remote_files: HashSet<String> = entities
            .iter()
            .filter(|e| !e.kind.is_folder())
            .map(|e| index::local_path(&e.path))
            .collect();

        for entity in &entities {
            if entity.parent.is_none() {
                continue;
            }
            let local = index::local_path(&entity.path);
            if self.is_ignored(&local) {
                continue;
            }
            if entity.kind.is_folder() {
                if !self.fs.exists(&local).await? {
                    self.fs.mkdir(&local).await?;
                }
                continue;
            }
            if index::is_synthetic(&entity.id) {
                debug!("{} has no server identity, skipping in this pass", local);
                report.skipped += 1;
                continue;
            }
            let Some(_guard) = self.locks.try_acquire(&local) else {
                debug!("{} busy, skipping in this pass", local);
                report.skipped += 1;
                continue;
            };
            self.reconcile_file(entity, &local, &mut report).await?;
        }

        self.classify_remote_deleted(&remote_files, &mut report).await?;
        self.classify_local_only(&remote_files, &mut report).await?;
        Ok(report)
    }

    async fn reconcile_file(&self, entity: &Entity, local: &str, report: &mut PullReport) -> Result<()> {
        let remote = self.fetch_remote(entity).await?;
        let existing = match self.fs.read(local).await {
            Ok(bytes) => Some(bytes),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        let Some(existing) = existing else {
            self.fs.write(local, &remote).await?;
            self.record_synced(local, &remote);
            report.downloaded += 1;
            debug!("Downloaded {}", local);
            return Ok(());
        };

        if existing == remote {
            self.record_synced(local, &remote);
            report.unchanged += 1;
            return Ok(());
        }

        report.conflicted += 1;
        let question = Conflict {
            path: local,
            local: &existing,
            remote: &remote,
        };
        match conflict::resolve(&self.conflict, &*self.resolver, &question).await {
            Resolution::UseRemote => {
                self.fs.write(local, &remote).await?;
                self.record_synced(local, &remote);
                report.downloaded += 1;
                info!("Conflict on {} resolved with remote content", local);
            }
            Resolution::UseLocal => {
                self.push_content(entity, &existing).await?;
                self.record_synced(local, &existing);
                report.uploaded += 1;
                info!("Conflict on {} resolved with local content", local);
            }
            Resolution::Skip => {
                report.skipped += 1;
                info!("Conflict on {} skipped", local);
            }
        }
        Ok(())
    }

    /// Current remote bytes of a document or file.
    ///
    /// Documents are read through the live session when there is one, leaving
    /// them again unless they were already joined.
    async fn fetch_remote(&self, entity: &Entity) -> Result<Vec<u8>> {
        match entity.kind {
            EntityKind::Doc => match self.session() {
                Some(session) => {
                    let was_joined = self.is_joined(&entity.id);
                    let snapshot = self.join(&session, &entity.id).await?;
                    if !was_joined {
                        self.leave(&entity.id).await;
                    }
                    Ok(snapshot.text().into_bytes())
                }
                None => Ok(self.api.doc_content(&entity.id).await?),
            },
            EntityKind::File => Ok(self.api.file_content(&entity.id).await?),
            EntityKind::Folder => Ok(Vec::new()),
        }
    }

    /// Tracked paths the remote no longer has.
    async fn classify_remote_deleted(
        &self,
        remote_files: &HashSet<String>,
        report: &mut PullReport,
    ) -> Result<()> {
        let tracked = self.with_state(|state| state.base.paths());
        for local in tracked {
            if remote_files.contains(&local) || self.is_ignored(&local) {
                continue;
            }
            let Some(_guard) = self.locks.try_acquire(&local) else {
                debug!("{} busy, skipping in this pass", local);
                report.skipped += 1;
                continue;
            };
            report.remote_deleted += 1;

            match self.resolver.remote_deleted(&local).await {
                RemoteDeletedAction::DeleteLocal => {
                    match self.fs.delete(&local).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e.into()),
                    }
                    self.purge(&local);
                    info!("Deleted {} locally, it was removed remotely", local);
                }
                RemoteDeletedAction::Keep => match self.fs.read(&local).await {
                    Ok(content) => {
                        let hash = ContentHash::of(&content);
                        self.with_state(|state| state.base.set(&local, hash));
                        info!("Keeping {} although it was removed remotely", local);
                    }
                    Err(e) if e.is_not_found() => self.purge(&local),
                    Err(e) => return Err(e.into()),
                },
                RemoteDeletedAction::Reupload => match self.fs.read(&local).await {
                    Ok(content) => {
                        self.create_remote(&local, &content).await?;
                        self.record_synced(&local, &content);
                        report.uploaded += 1;
                    }
                    Err(e) if e.is_not_found() => self.purge(&local),
                    Err(e) => return Err(e.into()),
                },
            }
        }
        Ok(())
    }

    /// Local files that were never synced and are absent remotely.
    async fn classify_local_only(
        &self,
        remote_files: &HashSet<String>,
        report: &mut PullReport,
    ) -> Result<()> {
        for local in fs::list_files_recursive(self.fs.as_ref(), "").await? {
            let tracked = self.with_state(|state| state.base.contains(&local));
            if tracked || remote_files.contains(&local) || self.is_ignored(&local) {
                continue;
            }
            if self.lookup(&local).is_some() {
                continue;
            }
            report.local_only += 1;

            match self.resolver.local_only(&local).await {
                LocalOnlyAction::Upload => {
                    let Some(_guard) = self.locks.try_acquire(&local) else {
                        continue;
                    };
                    let content = match self.fs.read(&local).await {
                        Ok(content) => content,
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e.into()),
                    };
                    self.create_remote(&local, &content).await?;
                    self.record_synced(&local, &content);
                    report.uploaded += 1;
                }
                LocalOnlyAction::Ignore => debug!("Leaving local-only {} alone", local),
            }
        }
        Ok(())
    }
}
