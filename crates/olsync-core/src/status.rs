//! Sync status and the notification stream presentation layers subscribe to.
//!
//! `StatusBus` keeps the current status and fans every transition out to
//! subscribers. Subscriptions follow the disposer pattern: hold the returned
//! [`Subscription`] to keep receiving events, drop it to unsubscribe.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Engine-wide sync status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Pulling,
    Pushing,
    Error,
    Disconnected,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Pulling => "pulling",
            SyncStatus::Pushing => "pushing",
            SyncStatus::Error => "error",
            SyncStatus::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// One status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

type Callback = Arc<dyn Fn(&StatusEvent) + Send + Sync>;

/// Subscription handle that unsubscribes automatically when dropped.
pub struct Subscription {
    bus: Weak<StatusBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

/// Current status plus subscriber fan-out.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct StatusBus {
    current: RwLock<StatusEvent>,
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for StatusBus {
    fn default() -> Self {
        Self {
            current: RwLock::new(StatusEvent {
                status: SyncStatus::Disconnected,
                message: None,
                path: None,
            }),
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl StatusBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> SyncStatus {
        self.current.read().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn last_event(&self) -> StatusEvent {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Subscribe to status events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&StatusEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write avoids a deadlock if Drop runs while `set` holds the read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn set(&self, status: SyncStatus) {
        self.emit(StatusEvent {
            status,
            message: None,
            path: None,
        });
    }

    pub fn set_with(&self, status: SyncStatus, message: impl Into<String>, path: Option<&str>) {
        self.emit(StatusEvent {
            status,
            message: Some(message.into()),
            path: path.map(str::to_string),
        });
    }

    fn emit(&self, event: StatusEvent) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = event.clone();

        // Clone the callback list so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_set_updates_current_and_notifies() {
        let bus = Arc::new(StatusBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

        assert_eq!(bus.current(), SyncStatus::Disconnected);
        bus.set(SyncStatus::Pulling);
        bus.set_with(SyncStatus::Error, "Request timed out", Some("main.tex"));

        assert_eq!(bus.current(), SyncStatus::Error);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].path.as_deref(), Some("main.tex"));
        assert_eq!(seen[1].message.as_deref(), Some("Request timed out"));
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(StatusBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            bus.set(SyncStatus::Idle);
        }
        bus.set(SyncStatus::Syncing);

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_status_event_serialization() {
        let event = StatusEvent {
            status: SyncStatus::Pushing,
            message: None,
            path: Some("main.tex".into()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"status":"pushing","path":"main.tex"}"#);
    }
}
