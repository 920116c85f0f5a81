//! Table of collaborators connected to the project.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Cursor position inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub row: u32,
    pub column: u32,
}

/// One connected collaborator as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    #[serde(alias = "id")]
    pub client_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub doc_id: Option<String>,
    #[serde(flatten)]
    pub cursor: Option<CursorPosition>,
}

/// client id → collaborator.
#[derive(Debug, Default, Clone)]
pub struct CollaboratorTable {
    entries: BTreeMap<String, Collaborator>,
}

impl CollaboratorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the table with a fresh listing.
    pub fn replace(&mut self, collaborators: Vec<Collaborator>) {
        self.entries = collaborators
            .into_iter()
            .map(|c| (c.client_id.clone(), c))
            .collect();
    }

    /// Insert or update a collaborator's details and cursor.
    ///
    /// Fields missing from the update keep their previous value.
    pub fn upsert(&mut self, update: Collaborator) {
        match self.entries.get_mut(&update.client_id) {
            Some(existing) => {
                if !update.name.is_empty() {
                    existing.name = update.name;
                }
                if update.email.is_some() {
                    existing.email = update.email;
                }
                if update.doc_id.is_some() {
                    existing.doc_id = update.doc_id;
                }
                if update.cursor.is_some() {
                    existing.cursor = update.cursor;
                }
            }
            None => {
                self.entries.insert(update.client_id.clone(), update);
            }
        }
    }

    pub fn remove(&mut self, client_id: &str) -> Option<Collaborator> {
        self.entries.remove(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<&Collaborator> {
        self.entries.get(client_id)
    }

    /// Collaborators whose cursor is in `doc_id`.
    pub fn in_document(&self, doc_id: &str) -> Vec<&Collaborator> {
        self.entries
            .values()
            .filter(|c| c.doc_id.as_deref() == Some(doc_id))
            .collect()
    }

    pub fn all(&self) -> Vec<Collaborator> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
