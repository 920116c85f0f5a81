//! Entity tree index: identity ↔ path maps over the remote project tree.
//!
//! Paths are absolute and normalized. The root folder is `/`, every other folder
//! is `parent + name + "/"`, and documents/files are `parent + name`. Local
//! relative paths (`chapters/intro.tex`) are converted with [`local_path`],
//! [`file_path`] and [`folder_path`].
//!
//! Every mutator updates both maps before returning, so at rest each identity
//! has exactly one path and each path exactly one identity.

use crate::entity::{Entity, EntityKind, FlatEntity, FolderNode, ProjectSnapshot};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

/// Prefix of identities synthesized from paths (flat listing fallback).
///
/// The server never issues these; they must not leave the process.
pub const SYNTHETIC_ID_PREFIX: &str = "path:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Unknown parent folder: {0}")]
    UnknownParent(String),

    #[error("Not a folder: {0}")]
    NotAFolder(String),

    #[error("Path already taken by another entity: {0}")]
    PathOccupied(String),

    #[error("The root folder cannot be renamed, moved or removed")]
    RootImmutable,
}

pub type Result<T> = std::result::Result<T, IndexError>;

/// A path rewrite caused by a rename or move, one per affected entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    pub id: String,
    pub kind: EntityKind,
    pub old_path: String,
    pub new_path: String,
}

/// Convert an index path to a path relative to the sync root.
pub fn local_path(index_path: &str) -> String {
    index_path.trim_matches('/').to_string()
}

/// Index path of a document or file at a local relative path.
pub fn file_path(local: &str) -> String {
    format!("/{}", local.trim_matches('/'))
}

/// Index path of a folder at a local relative path.
pub fn folder_path(local: &str) -> String {
    let trimmed = local.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", trimmed)
    }
}

/// Index path of a child named `name` inside the folder at `parent_path`.
pub fn child_path(parent_path: &str, name: &str, kind: EntityKind) -> String {
    let mut path = String::with_capacity(parent_path.len() + name.len() + 1);
    path.push_str(parent_path);
    if !path.ends_with('/') {
        path.push('/');
    }
    path.push_str(name);
    if kind.is_folder() {
        path.push('/');
    }
    path
}

/// Index path of the folder containing `path`.
pub fn parent_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) => trimmed[..=pos].to_string(),
        None => "/".to_string(),
    }
}

/// Deterministic identity for an entity known only by its path.
pub fn synthetic_id(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    format!("{}{}", SYNTHETIC_ID_PREFIX, &hex::encode(digest)[..24])
}

pub fn is_synthetic(id: &str) -> bool {
    id.starts_with(SYNTHETIC_ID_PREFIX)
}

/// Bidirectional identity/path index.
#[derive(Debug, Default, Clone)]
pub struct EntityIndex {
    by_id: HashMap<String, Entity>,
    by_path: HashMap<String, String>,
    root_id: Option<String>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from a full project snapshot.
    pub fn build(snapshot: &ProjectSnapshot) -> Self {
        let mut index = Self::new();
        if let Some(root) = snapshot.root() {
            index.root_id = Some(root.id.clone());
            index.put(Entity {
                id: root.id.clone(),
                kind: EntityKind::Folder,
                name: root.name.clone(),
                parent: None,
                path: "/".to_string(),
            });
            index.add_folder_children(root, "/");
        }
        index
    }

    fn add_folder_children(&mut self, folder: &FolderNode, folder_path: &str) {
        let children = folder
            .docs
            .iter()
            .map(|r| (r, EntityKind::Doc))
            .chain(folder.file_refs.iter().map(|r| (r, EntityKind::File)));
        for (child, kind) in children {
            self.put(Entity {
                id: child.id.clone(),
                kind,
                name: child.name.clone(),
                parent: Some(folder.id.clone()),
                path: child_path(folder_path, &child.name, kind),
            });
        }
        for sub in &folder.folders {
            let sub_path = child_path(folder_path, &sub.name, EntityKind::Folder);
            self.put(Entity {
                id: sub.id.clone(),
                kind: EntityKind::Folder,
                name: sub.name.clone(),
                parent: Some(folder.id.clone()),
                path: sub_path.clone(),
            });
            self.add_folder_children(sub, &sub_path);
        }
    }

    /// Build an index from a flat `(path, type)` listing.
    ///
    /// Identities are derived from paths, so repeated builds of the same
    /// listing produce the same identities. Missing intermediate folders are
    /// synthesized.
    pub fn build_from_flat(entities: &[FlatEntity]) -> Self {
        let mut index = Self::new();
        let root_id = synthetic_id("/");
        index.root_id = Some(root_id.clone());
        index.put(Entity {
            id: root_id,
            kind: EntityKind::Folder,
            name: String::new(),
            parent: None,
            path: "/".to_string(),
        });

        for flat in entities {
            let kind = flat.entity_kind();
            let local = local_path(&flat.path);
            if local.is_empty() {
                continue;
            }
            let path = if kind.is_folder() {
                folder_path(&local)
            } else {
                file_path(&local)
            };
            let parent_id = index.ensure_synthetic_folders(&parent_path(&path));
            let name = local.rsplit('/').next().unwrap_or(&local).to_string();
            if index.by_path.contains_key(&path) {
                continue;
            }
            index.put(Entity {
                id: synthetic_id(&path),
                kind,
                name,
                parent: Some(parent_id),
                path,
            });
        }
        index
    }

    fn ensure_synthetic_folders(&mut self, folder: &str) -> String {
        if let Some(id) = self.by_path.get(folder) {
            return id.clone();
        }
        let parent = parent_path(folder);
        let parent_id = self.ensure_synthetic_folders(&parent);
        let id = synthetic_id(folder);
        let name = local_path(folder)
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        self.put(Entity {
            id: id.clone(),
            kind: EntityKind::Folder,
            name,
            parent: Some(parent_id),
            path: folder.to_string(),
        });
        id
    }

    fn put(&mut self, entity: Entity) {
        self.by_path.insert(entity.path.clone(), entity.id.clone());
        self.by_id.insert(entity.id.clone(), entity);
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn lookup_by_id(&self, id: &str) -> Option<&Entity> {
        self.by_id.get(id)
    }

    pub fn lookup_by_path(&self, path: &str) -> Option<&Entity> {
        self.by_path.get(path).and_then(|id| self.by_id.get(id))
    }

    /// Resolve a local relative path, trying the file form before the folder form.
    pub fn lookup_local(&self, local: &str) -> Option<&Entity> {
        self.lookup_by_path(&file_path(local))
            .or_else(|| self.lookup_by_path(&folder_path(local)))
    }

    /// All entities ordered by path, so folders precede their contents.
    pub fn entities(&self) -> Vec<Entity> {
        let mut all: Vec<Entity> = self.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        all
    }

    /// Register a new entity under `parent_id`.
    ///
    /// Re-inserting an identity already present at the same path is a no-op.
    pub fn insert(
        &mut self,
        parent_id: &str,
        id: &str,
        kind: EntityKind,
        name: &str,
    ) -> Result<Entity> {
        let parent = self
            .by_id
            .get(parent_id)
            .ok_or_else(|| IndexError::UnknownParent(parent_id.to_string()))?;
        if !parent.kind.is_folder() {
            return Err(IndexError::NotAFolder(parent_id.to_string()));
        }
        let path = child_path(&parent.path, name, kind);

        if let Some(existing) = self.by_id.get(id) {
            if existing.path == path {
                return Ok(existing.clone());
            }
            return Err(IndexError::PathOccupied(existing.path.clone()));
        }
        if self.by_path.contains_key(&path) {
            return Err(IndexError::PathOccupied(path));
        }

        let entity = Entity {
            id: id.to_string(),
            kind,
            name: name.to_string(),
            parent: Some(parent_id.to_string()),
            path,
        };
        self.put(entity.clone());
        Ok(entity)
    }

    /// Give an entity a new name within its current folder.
    ///
    /// Returns one [`PathChange`] per affected entity (the entity itself first,
    /// then any descendants). Renaming to the current name returns no changes.
    pub fn rename(&mut self, id: &str, new_name: &str) -> Result<Vec<PathChange>> {
        let entity = self
            .by_id
            .get(id)
            .ok_or_else(|| IndexError::UnknownEntity(id.to_string()))?;
        if entity.parent.is_none() {
            return Err(IndexError::RootImmutable);
        }
        let new_path = child_path(&parent_path(&entity.path), new_name, entity.kind);
        self.relocate(id, None, new_name, new_path)
    }

    /// Move an entity into another folder, keeping its name.
    pub fn move_to(&mut self, id: &str, new_parent_id: &str) -> Result<Vec<PathChange>> {
        let entity = self
            .by_id
            .get(id)
            .ok_or_else(|| IndexError::UnknownEntity(id.to_string()))?;
        if entity.parent.is_none() {
            return Err(IndexError::RootImmutable);
        }
        let parent = self
            .by_id
            .get(new_parent_id)
            .ok_or_else(|| IndexError::UnknownParent(new_parent_id.to_string()))?;
        if !parent.kind.is_folder() {
            return Err(IndexError::NotAFolder(new_parent_id.to_string()));
        }
        if entity.kind.is_folder() && parent.path.starts_with(&entity.path) {
            return Err(IndexError::PathOccupied(parent.path.clone()));
        }
        let new_path = child_path(&parent.path, &entity.name, entity.kind);
        let name = entity.name.clone();
        self.relocate(id, Some(new_parent_id.to_string()), &name, new_path)
    }

    fn relocate(
        &mut self,
        id: &str,
        new_parent: Option<String>,
        new_name: &str,
        new_path: String,
    ) -> Result<Vec<PathChange>> {
        let (old_path, kind) = match self.by_id.get(id) {
            Some(e) => (e.path.clone(), e.kind),
            None => return Err(IndexError::UnknownEntity(id.to_string())),
        };
        if old_path == new_path {
            return Ok(Vec::new());
        }
        if self.by_path.contains_key(&new_path) {
            return Err(IndexError::PathOccupied(new_path));
        }

        let mut affected = vec![id.to_string()];
        if kind.is_folder() {
            affected.extend(
                self.by_id
                    .values()
                    .filter(|e| e.id != id && e.path.starts_with(&old_path))
                    .map(|e| e.id.clone()),
            );
        }

        let mut changes = Vec::with_capacity(affected.len());
        for entity_id in affected {
            let Some(entity) = self.by_id.get_mut(&entity_id) else {
                continue;
            };
            let rewritten = format!("{}{}", new_path, &entity.path[old_path.len()..]);
            self.by_path.remove(&entity.path);
            changes.push(PathChange {
                id: entity.id.clone(),
                kind: entity.kind,
                old_path: std::mem::replace(&mut entity.path, rewritten.clone()),
                new_path: rewritten.clone(),
            });
            if entity.id == id {
                entity.name = new_name.to_string();
                if let Some(parent) = &new_parent {
                    entity.parent = Some(parent.clone());
                }
            }
        }
        for change in &changes {
            self.by_path.insert(change.new_path.clone(), change.id.clone());
        }
        Ok(changes)
    }

    /// Remove an entity and, for folders, everything below it.
    ///
    /// Returns the removed entities; removing an unknown identity returns an
    /// empty list.
    pub fn remove(&mut self, id: &str) -> Vec<Entity> {
        let Some(entity) = self.by_id.get(id) else {
            return Vec::new();
        };
        if entity.parent.is_none() {
            return Vec::new();
        }
        let prefix = entity.path.clone();
        let ids: Vec<String> = if entity.kind.is_folder() {
            self.by_id
                .values()
                .filter(|e| e.path.starts_with(&prefix))
                .map(|e| e.id.clone())
                .collect()
        } else {
            vec![id.to_string()]
        };

        let mut removed = Vec::with_capacity(ids.len());
        for entity_id in ids {
            if let Some(entity) = self.by_id.remove(&entity_id) {
                self.by_path.remove(&entity.path);
                removed.push(entity);
            }
        }
        removed.sort_by(|a, b| a.path.cmp(&b.path));
        removed
    }

    /// Check that both maps describe the same set of entities.
    pub fn is_consistent(&self) -> bool {
        self.by_id.len() == self.by_path.len()
            && self
                .by_id
                .values()
                .all(|e| self.by_path.get(&e.path) == Some(&e.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;

    fn snapshot() -> ProjectSnapshot {
        ProjectSnapshot {
            id: "p".into(),
            name: "Paper".into(),
            root_doc_id: Some("main".into()),
            root_folder: vec![FolderNode {
                id: "root".into(),
                name: "rootFolder".into(),
                docs: vec![EntityRef { id: "main".into(), name: "main.tex".into() }],
                file_refs: vec![EntityRef { id: "logo".into(), name: "logo.png".into() }],
                folders: vec![FolderNode {
                    id: "ch".into(),
                    name: "chapters".into(),
                    docs: vec![EntityRef { id: "intro".into(), name: "intro.tex".into() }],
                    file_refs: vec![],
                    folders: vec![],
                }],
            }],
        }
    }

    #[test]
    fn test_build_computes_paths() {
        let index = EntityIndex::build(&snapshot());

        assert_eq!(index.lookup_by_id("root").unwrap().path, "/");
        assert_eq!(index.lookup_by_id("main").unwrap().path, "/main.tex");
        assert_eq!(index.lookup_by_id("ch").unwrap().path, "/chapters/");
        assert_eq!(index.lookup_by_id("intro").unwrap().path, "/chapters/intro.tex");
        assert_eq!(index.lookup_local("chapters").unwrap().id, "ch");
        assert_eq!(index.lookup_local("logo.png").unwrap().kind, EntityKind::File);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(local_path("/chapters/intro.tex"), "chapters/intro.tex");
        assert_eq!(local_path("/chapters/"), "chapters");
        assert_eq!(parent_path("/chapters/intro.tex"), "/chapters/");
        assert_eq!(parent_path("/chapters/"), "/");
        assert_eq!(parent_path("/main.tex"), "/");
        assert_eq!(child_path("/", "figs", EntityKind::Folder), "/figs/");
        assert_eq!(folder_path(""), "/");
    }

    #[test]
    fn test_insert_is_idempotent_and_rejects_collisions() {
        let mut index = EntityIndex::build(&snapshot());

        let first = index.insert("ch", "outro", EntityKind::Doc, "outro.tex").unwrap();
        let again = index.insert("ch", "outro", EntityKind::Doc, "outro.tex").unwrap();
        assert_eq!(first, again);
        assert_eq!(first.path, "/chapters/outro.tex");

        let clash = index.insert("ch", "other", EntityKind::Doc, "outro.tex");
        assert_eq!(clash, Err(IndexError::PathOccupied("/chapters/outro.tex".into())));
        assert!(matches!(
            index.insert("main", "x", EntityKind::Doc, "x.tex"),
            Err(IndexError::NotAFolder(_))
        ));
        assert!(index.is_consistent());
    }

    #[test]
    fn test_rename_folder_rewrites_descendants() {
        let mut index = EntityIndex::build(&snapshot());

        let changes = index.rename("ch", "parts").unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].old_path, "/chapters/");
        assert_eq!(changes[0].new_path, "/parts/");
        assert_eq!(index.lookup_by_id("intro").unwrap().path, "/parts/intro.tex");
        assert!(index.lookup_by_path("/chapters/intro.tex").is_none());
        assert_eq!(index.lookup_by_id("ch").unwrap().name, "parts");

        // Applying the same rename again changes nothing
        assert!(index.rename("ch", "parts").unwrap().is_empty());
        assert!(index.is_consistent());
    }

    #[test]
    fn test_move_and_remove() {
        let mut index = EntityIndex::build(&snapshot());

        let changes = index.move_to("logo", "ch").unwrap();
        assert_eq!(changes[0].new_path, "/chapters/logo.png");
        assert_eq!(index.lookup_by_id("logo").unwrap().parent.as_deref(), Some("ch"));
        assert!(index.move_to("logo", "ch").unwrap().is_empty());

        // A folder cannot move into itself
        assert!(index.move_to("ch", "ch").is_err());

        let removed = index.remove("ch");
        assert_eq!(removed.len(), 3);
        assert!(index.lookup_by_id("intro").is_none());
        assert!(index.lookup_by_id("logo").is_none());
        assert!(index.remove("ch").is_empty());
        assert!(index.remove("root").is_empty());
        assert!(index.is_consistent());
    }

    #[test]
    fn test_mutation_sequence_keeps_maps_in_step() {
        let mut index = EntityIndex::build(&snapshot());
        index.insert("root", "figs", EntityKind::Folder, "figs").unwrap();
        index.insert("figs", "plot", EntityKind::File, "plot.pdf").unwrap();
        index.move_to("figs", "ch").unwrap();
        index.rename("plot", "plot-v2.pdf").unwrap();
        index.move_to("intro", "figs").unwrap();
        index.rename("ch", "body").unwrap();
        index.remove("main");

        assert!(index.is_consistent());
        assert_eq!(index.lookup_by_id("plot").unwrap().path, "/body/figs/plot-v2.pdf");
        assert_eq!(index.lookup_by_id("intro").unwrap().path, "/body/figs/intro.tex");
        assert_eq!(index.len(), 6);
    }

    #[test]
    fn test_build_from_flat_is_stable() {
        let listing = vec![
            FlatEntity { path: "/main.tex".into(), kind: Some("doc".into()) },
            FlatEntity { path: "/figs/plot.pdf".into(), kind: None },
        ];

        let first = EntityIndex::build_from_flat(&listing);
        let second = EntityIndex::build_from_flat(&listing);

        let main = first.lookup_by_path("/main.tex").unwrap();
        assert_eq!(main.kind, EntityKind::Doc);
        assert_eq!(main.id, second.lookup_by_path("/main.tex").unwrap().id);
        assert!(is_synthetic(&main.id));
        assert!(!is_synthetic("5f0c1a2b3c4d5e6f7a8b9c0d"));

        let figs = first.lookup_by_path("/figs/").unwrap();
        assert_eq!(figs.kind, EntityKind::Folder);
        let plot = first.lookup_by_path("/figs/plot.pdf").unwrap();
        assert_eq!(plot.kind, EntityKind::File);
        assert_eq!(plot.parent.as_deref(), Some(figs.id.as_str()));
        assert!(first.is_consistent());
    }
}
