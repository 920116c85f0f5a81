//! Content digests, the change-detection cache and the last-synced snapshot.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// SHA-256 digest of file content, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Compute hash from content bytes.
    pub fn of(content: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(content)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outcome of comparing freshly read content against the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Content differs from the last observation and is outside the debounce window
    Changed,
    /// Same content as last observed (echo of our own write, or a touch)
    Unchanged,
    /// Content differs but arrived within the debounce window
    Debounced,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    hash: ContentHash,
    seen_at: Instant,
}

/// path → (content hash, last observation time).
///
/// Every write the engine performs and every change it pushes is recorded
/// here, so the watcher notification that follows it compares equal.
#[derive(Debug)]
pub struct FileCache {
    entries: HashMap<String, CacheEntry>,
    debounce: Duration,
}

impl FileCache {
    pub fn new(debounce: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            debounce,
        }
    }

    /// Classify `hash` for `path` at time `now`.
    ///
    /// Suppressed observations only refresh the timestamp; the stored hash is
    /// kept so the next event outside the window is still seen as a change.
    pub fn observe(&mut self, path: &str, hash: &ContentHash, now: Instant) -> Observation {
        match self.entries.get_mut(path) {
            None => Observation::Changed,
            Some(entry) if &entry.hash == hash => {
                entry.seen_at = now;
                Observation::Unchanged
            }
            Some(entry) if now.saturating_duration_since(entry.seen_at) < self.debounce => {
                entry.seen_at = now;
                Observation::Debounced
            }
            Some(_) => Observation::Changed,
        }
    }

    /// Record `hash` as the current content of `path`.
    pub fn record(&mut self, path: &str, hash: ContentHash, now: Instant) {
        self.entries.insert(
            path.to_string(),
            CacheEntry {
                hash,
                seen_at: now,
            },
        );
    }

    pub fn hash(&self, path: &str) -> Option<&ContentHash> {
        self.entries.get(path).map(|e| &e.hash)
    }

    pub fn remove(&mut self, path: &str) {
        self.entries.remove(path);
    }

    /// Drop `path` and every entry below it.
    pub fn remove_tree(&mut self, path: &str) {
        self.entries.retain(|key, _| !is_same_or_below(key, path));
    }

    /// Re-key `from` (and everything below it) to `to`.
    pub fn migrate(&mut self, from: &str, to: &str) {
        let moved: Vec<String> = self
            .entries
            .keys()
            .filter(|key| is_same_or_below(key, from))
            .cloned()
            .collect();
        for key in moved {
            if let Some(entry) = self.entries.remove(&key) {
                self.entries.insert(rebase(&key, from, to), entry);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Last known-synced content per local path, stored as digests.
///
/// A path present here existed on both sides at the last successful sync; a
/// path absent here has never been synced.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaseContent {
    entries: BTreeMap<String, ContentHash>,
}

impl BaseContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: &str, hash: ContentHash) {
        self.entries.insert(path.to_string(), hash);
    }

    pub fn get(&self, path: &str) -> Option<&ContentHash> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn remove_tree(&mut self, path: &str) {
        self.entries.retain(|key, _| !is_same_or_below(key, path));
    }

    pub fn migrate(&mut self, from: &str, to: &str) {
        let moved: Vec<String> = self
            .entries
            .keys()
            .filter(|key| is_same_or_below(key, from))
            .cloned()
            .collect();
        for key in moved {
            if let Some(hash) = self.entries.remove(&key) {
                self.entries.insert(rebase(&key, from, to), hash);
            }
        }
    }

    /// Every tracked path, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_same_or_below(key: &str, path: &str) -> bool {
    key == path || (key.starts_with(path) && key.as_bytes().get(path.len()) == Some(&b'/'))
}

fn rebase(key: &str, from: &str, to: &str) -> String {
    format!("{}{}", to, &key[from.len()..])
}
