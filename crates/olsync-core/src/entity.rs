//! Remote project entities and the snapshot shapes they arrive in.

use serde::{Deserialize, Serialize};

/// Kind of a node in the remote project tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Text document, edited through OT
    Doc,
    /// Binary file reference, replaced wholesale
    File,
    /// Folder
    Folder,
}

impl EntityKind {
    /// Name used by the remote API in URLs (`/project/:id/<kind>/:entity`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Doc => "doc",
            EntityKind::File => "file",
            EntityKind::Folder => "folder",
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, EntityKind::Folder)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single addressable node with its resolved path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// Stable remote identity
    pub id: String,
    pub kind: EntityKind,
    /// Display name (last path segment)
    pub name: String,
    /// Parent folder identity, `None` for the root folder
    pub parent: Option<String>,
    /// Absolute index path (`/`, `/chapters/`, `/chapters/intro.tex`)
    pub path: String,
}

/// A bare `{ _id, name }` reference inside a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

/// A folder node in the project snapshot tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FolderNode {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub docs: Vec<EntityRef>,
    #[serde(default, rename = "fileRefs")]
    pub file_refs: Vec<EntityRef>,
    #[serde(default)]
    pub folders: Vec<FolderNode>,
}

/// Full project structure as handed over by the join handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Single-element list holding the root folder
    #[serde(rename = "rootFolder")]
    pub root_folder: Vec<FolderNode>,
    /// Identity of the main document, when the project declares one
    #[serde(default, rename = "rootDoc_id", skip_serializing_if = "Option::is_none")]
    pub root_doc_id: Option<String>,
}

impl ProjectSnapshot {
    pub fn root(&self) -> Option<&FolderNode> {
        self.root_folder.first()
    }
}

/// One row of the flat entity listing served by the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatEntity {
    /// Absolute path (`/chapters/intro.tex`)
    pub path: String,
    /// `doc`, `file` or `folder`; anything else is treated as a binary file
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl FlatEntity {
    pub fn entity_kind(&self) -> EntityKind {
        match self.kind.as_deref() {
            Some("doc") => EntityKind::Doc,
            Some("folder") => EntityKind::Folder,
            _ => EntityKind::File,
        }
    }
}
