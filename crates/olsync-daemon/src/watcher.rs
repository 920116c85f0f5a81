//! File watcher with debouncing for the sync root.
//!
//! Uses notify-debouncer-mini for efficient file change detection. The
//! debouncer reports "something happened at this path"; the watcher turns
//! that into create, modify or delete by checking the path and remembering
//! which paths it has already seen.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, new_debouncer};
use olsync_core::LocalEvent;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Debounce period for raw filesystem notifications.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Last seen mtime per relative path, `None` for directories.
///
/// Filters spurious events whose mtime did not move, and tells creates
/// apart from modifications.
type SeenCache = Arc<Mutex<HashMap<PathBuf, Option<SystemTime>>>>;

/// File watcher that monitors the sync root.
pub struct FileWatcher {
    /// Sync root
    root: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    /// Receiver for file events
    event_rx: mpsc::UnboundedReceiver<LocalEvent>,
}

impl FileWatcher {
    /// Create a new file watcher for the sync root.
    pub fn new(root: PathBuf) -> Result<Self> {
        // Canonicalize the path to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let root = root.canonicalize().unwrap_or(root);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root_clone = root.clone();

        let seen: SeenCache = Arc::new(Mutex::new(Self::scan(&root)));
        let seen_clone = Arc::clone(&seen);

        let mut debouncer = new_debouncer(
            WATCH_DEBOUNCE,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(local_event) =
                            Self::process_event(&event.path, &root_clone, &seen_clone)
                        {
                            if event_tx.send(local_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer.watcher().watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            root,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Record everything already present so it is not reported as created.
    fn scan(root: &Path) -> HashMap<PathBuf, Option<SystemTime>> {
        let mut seen = HashMap::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Ok(relative) = path.strip_prefix(root) else {
                    continue;
                };
                if is_hidden(relative) {
                    continue;
                }
                let Ok(metadata) = entry.metadata() else {
                    continue;
                };
                if metadata.is_dir() {
                    seen.insert(relative.to_path_buf(), None);
                    pending.push(path);
                } else {
                    seen.insert(relative.to_path_buf(), metadata.modified().ok());
                }
            }
        }
        seen
    }

    /// Process a single debounced event, returning a local event if relevant.
    fn process_event(path: &Path, root: &Path, seen: &SeenCache) -> Option<LocalEvent> {
        let relative = path.strip_prefix(root).ok()?;
        if relative.as_os_str().is_empty() || is_hidden(relative) {
            return None;
        }
        let relative_str = to_slash_path(relative)?;

        let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
        let event = match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_dir() => {
                if seen.insert(relative.to_path_buf(), None).is_some() {
                    // Directory contents changed; the children report themselves
                    return None;
                }
                LocalEvent::Created(relative_str)
            }
            Ok(metadata) => {
                let mtime = metadata.modified().ok();
                match seen.insert(relative.to_path_buf(), mtime) {
                    None => LocalEvent::Created(relative_str),
                    Some(last) if last.is_some() && last == mtime => {
                        // Mtime unchanged - spurious event, skip it
                        return None;
                    }
                    Some(_) => LocalEvent::Modified(relative_str),
                }
            }
            Err(_) => {
                let was_known = seen.remove(relative).is_some();
                seen.retain(|known, _| !known.starts_with(relative));
                if !was_known {
                    return None;
                }
                LocalEvent::Deleted(relative_str)
            }
        };

        debug!("File event: {:?}", event);
        Some(event)
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<LocalEvent> {
        &mut self.event_rx
    }

    /// Get the watched root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Whether any component of `relative` is a dot-file or dot-directory.
fn is_hidden(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(name) => name.to_string_lossy().starts_with('.'),
        _ => false,
    })
}

/// Relative path with `/` separators on every platform.
fn to_slash_path(relative: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = relative
        .components()
        .map(|component| match component {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .collect();
    Some(parts?.join("/"))
}
