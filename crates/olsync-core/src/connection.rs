//! Connection manager: scheme negotiation, lifecycle and reconnection.
//!
//! The server speaks two handshake schemes:
//! - [`Scheme::A`] passes the project id as a connection query parameter and
//!   receives the snapshot through a `joinProjectResponse` event
//! - [`Scheme::B`] connects without it and sends an explicit `joinProject`
//!   call, raced against a `connectionRejected` event
//!
//! `connect` tries A, and on a handshake timeout or rejection tears the attempt
//! down and tries B exactly once:
//!
//! ```text
//! Disconnected -> HandshakingA -> Connected
//!                              -> HandshakingB -> Connected
//!                                              -> Failed
//! Connected -> Disconnected (disconnect, forceDisconnect, socket close)
//! Failed -> HandshakingA (next connect)
//! ```
//!
//! Server events are forwarded into a broadcast channel owned by the manager,
//! so receivers obtained before a reconnect keep working after it.

use crate::entity::ProjectSnapshot;
use crate::protocol::ServerEvent;
use crate::transport::{DocumentSession, TransportError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the broadcast channel subscribers read server events from.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Project id in the connection query, snapshot via `joinProjectResponse`
    A,
    /// Explicit `joinProject` call
    B,
}

impl Scheme {
    pub fn other(self) -> Self {
        match self {
            Scheme::A => Scheme::B,
            Scheme::B => Scheme::A,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    HandshakingA,
    HandshakingB,
    Connected,
    Failed,
}

impl ConnectionState {
    fn handshaking(scheme: Scheme) -> Self {
        match scheme {
            Scheme::A => ConnectionState::HandshakingA,
            Scheme::B => ConnectionState::HandshakingB,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ConnectError {
    /// Whether a failure with one scheme warrants trying the other.
    pub fn allows_fallback(&self) -> bool {
        matches!(self, ConnectError::HandshakeTimeout | ConnectError::Rejected(_))
    }
}

/// A completed handshake.
pub struct Established {
    pub session: Arc<dyn DocumentSession>,
    pub snapshot: ProjectSnapshot,
    /// Server events from this socket; ends when the socket closes
    pub events: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Performs one handshake attempt with a given scheme.
///
/// Dropping the returned future must tear down anything it opened.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn handshake(&self, scheme: Scheme) -> Result<Established, ConnectError>;
}

/// Pacing of [`ConnectionManager::reconnect_with_backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait after the first failed reconnect; doubles with every further failure
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Failed reconnects before giving up, `None` to keep trying
    pub attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Give up after `attempts` failed reconnects.
    pub fn limited(attempts: u32) -> Self {
        Self {
            attempts: Some(attempts),
            ..Self::default()
        }
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.attempts.is_some_and(|max| failures >= max)
    }

    /// Wait before the next reconnect after `failures` failed ones.
    ///
    /// A handshake timeout already kept the caller waiting for `spent`,
    /// which counts towards the delay.
    pub fn delay(&self, failures: u32, error: &ConnectError, spent: Duration) -> Duration {
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        match error {
            ConnectError::HandshakeTimeout => delay.saturating_sub(spent),
            _ => delay,
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    handshake_timeout: Duration,
    reconnect: ReconnectPolicy,
    state: Arc<Mutex<ConnectionState>>,
    session: Mutex<Option<Arc<dyn DocumentSession>>>,
    events: broadcast::Sender<ServerEvent>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, handshake_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connector,
            handshake_timeout,
            reconnect: ReconnectPolicy::default(),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            session: Mutex::new(None),
            events,
            forwarder: Mutex::new(None),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current session, if connected.
    pub fn session(&self) -> Option<Arc<dyn DocumentSession>> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Receive server events, across reconnects.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Establish a session, falling back to the other scheme once.
    pub async fn connect(&self) -> Result<ProjectSnapshot, ConnectError> {
        self.teardown().await;

        let first = Scheme::A;
        let established = match self.attempt(first).await {
            Ok(established) => established,
            Err(e) if e.allows_fallback() => {
                warn!("Scheme {:?} handshake failed ({}), trying scheme {:?}", first, e, first.other());
                match self.attempt(first.other()).await {
                    Ok(established) => established,
                    Err(e) => return Err(self.fail(e)),
                }
            }
            Err(e) => return Err(self.fail(e)),
        };

        let Established {
            session,
            snapshot,
            events,
        } = established;
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
        self.set_state(ConnectionState::Connected);
        self.spawn_forwarder(events);
        info!("Connected to project {}", snapshot.id);
        Ok(snapshot)
    }

    /// Re-run `connect` unless already connected.
    ///
    /// Returns the fresh snapshot, or `None` when the connection was up.
    pub async fn reconnect(&self) -> Result<Option<ProjectSnapshot>, ConnectError> {
        if self.is_connected() {
            debug!("Reconnect requested while connected, ignoring");
            return Ok(None);
        }
        self.connect().await.map(Some)
    }

    /// Reconnect with exponential backoff until it succeeds, authentication
    /// fails, or the attempt limit is reached.
    pub async fn reconnect_with_backoff(&self) -> Result<Option<ProjectSnapshot>, ConnectError> {
        let mut failures = 0u32;
        loop {
            let started = tokio::time::Instant::now();
            match self.reconnect().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e @ ConnectError::Authentication(_)) => return Err(e),
                Err(e) => {
                    failures += 1;
                    if self.reconnect.exhausted(failures) {
                        warn!("Giving up after {} reconnect attempts", failures);
                        return Err(e);
                    }
                    let delay = self.reconnect.delay(failures, &e, started.elapsed());
                    warn!("Reconnect failed: {}. Retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Close the session and stop forwarding its events.
    pub async fn disconnect(&self) {
        self.teardown().await;
        self.set_state(ConnectionState::Disconnected);
        info!("Disconnected");
    }

    async fn attempt(&self, scheme: Scheme) -> Result<Established, ConnectError> {
        self.set_state(ConnectionState::handshaking(scheme));
        debug!("Handshaking with scheme {:?}", scheme);
        match tokio::time::timeout(self.handshake_timeout, self.connector.handshake(scheme)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::HandshakeTimeout),
        }
    }

    fn fail(&self, error: ConnectError) -> ConnectError {
        self.set_state(ConnectionState::Failed);
        error
    }

    async fn teardown(&self) {
        if let Some(forwarder) = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            forwarder.abort();
        }
        let session = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn spawn_forwarder(&self, mut events: mpsc::UnboundedReceiver<ServerEvent>) {
        let sender = self.events.clone();
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closing = matches!(event, ServerEvent::ForceDisconnect { .. } | ServerEvent::Closed);
                if closing {
                    *state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Disconnected;
                }
                // No receivers is fine; events are simply dropped
                let _ = sender.send(event);
                if closing {
                    return;
                }
            }
            *state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Disconnected;
            let _ = sender.send(ServerEvent::Closed);
        });
        *self.forwarder.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }
}
