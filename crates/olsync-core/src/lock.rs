//! Per-path in-flight set.
//!
//! Acquisition is a synchronous test-and-set: a second handler for a path that
//! is already being processed gets `None` and drops its event. The returned
//! guard releases the path when dropped, on every exit path of the handler.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default, Clone)]
pub struct PathLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim `path`. Returns `None` if a handler already holds it.
    pub fn try_acquire(&self, path: &str) -> Option<PathGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.insert(path.to_string()) {
            Some(PathGuard {
                locks: Arc::clone(&self.held),
                path: path.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, path: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(path)
    }
}

/// Claim on one path, released on drop.
#[derive(Debug)]
pub struct PathGuard {
    locks: Arc<Mutex<HashSet<String>>>,
    path: String,
}

impl PathGuard {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.path);
    }
}
