//! Live socket transport: socket.io 0.9 over WebSocket.
//!
//! A handshake is an HTTP `GET /socket.io/1/` that hands out a session id,
//! followed by a WebSocket to `/socket.io/1/websocket/<sid>`. Scheme A puts
//! the project id on both URLs and waits for `joinProjectResponse`; scheme B
//! sends an explicit `joinProject` call.

use crate::config::DaemonConfig;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use olsync_core::collaborators::Collaborator;
use olsync_core::connection::{ConnectError, Connector, Established, Scheme};
use olsync_core::ot::TextOp;
use olsync_core::protocol::messages::{self, JoinDocOptions, JoinProjectRequest, PositionUpdate};
use olsync_core::protocol::{
    DocSnapshot, Frame, JoinProjectReply, OtUpdate, ProtocolError, ServerEvent,
};
use olsync_core::transport::{self, DocumentSession, TransportError, with_timeout};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type PendingAcks = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>>;

/// Performs socket handshakes against the configured server.
pub struct SocketIoConnector {
    config: Arc<DaemonConfig>,
    client: reqwest::Client,
}

impl SocketIoConnector {
    pub fn new(config: Arc<DaemonConfig>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { config, client })
    }

    /// HTTP part of the handshake. Returns the session id.
    async fn request_session(&self, scheme: Scheme) -> Result<String, ConnectError> {
        let mut url = self
            .config
            .endpoint("socket.io/1/")
            .map_err(|e| TransportError::Other(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("t", &Utc::now().timestamp_millis().to_string());
            if scheme == Scheme::A {
                query.append_pair("projectId", &self.config.project_id);
            }
        }

        let response = self
            .client
            .get(url)
            .header(reqwest::header::COOKIE, &self.config.cookie)
            .send()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ConnectError::Authentication(format!(
                "server answered {} to the socket handshake",
                status
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: body,
            }
            .into());
        }
        parse_session_id(&body).map_err(|e| TransportError::from(e).into())
    }

    fn websocket_url(&self, scheme: Scheme, sid: &str) -> Result<Url, TransportError> {
        let mut url = self
            .config
            .endpoint(&format!("socket.io/1/websocket/{}", sid))
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let ws_scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(ws_scheme)
            .map_err(|_| TransportError::Other(format!("cannot use {} for a websocket", url)))?;
        if scheme == Scheme::A {
            url.query_pairs_mut()
                .append_pair("projectId", &self.config.project_id);
        }
        Ok(url)
    }

    async fn open_socket(&self, url: &Url) -> Result<WsStream, TransportError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let cookie = HeaderValue::from_str(&self.config.cookie)
            .map_err(|e| TransportError::Other(format!("invalid cookie: {}", e)))?;
        request.headers_mut().insert(COOKIE, cookie);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(ws_stream)
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn handshake(&self, scheme: Scheme) -> Result<Established, ConnectError> {
        let sid = self.request_session(scheme).await?;
        let url = self.websocket_url(scheme, &sid)?;
        debug!("Opening socket {}", url);
        let ws_stream = self.open_socket(&url).await?;

        let (session, mut events) =
            SocketSession::start(ws_stream, self.config.sync.request_timeout);

        let reply = match scheme {
            Scheme::A => wait_for_project(&mut events).await?,
            Scheme::B => {
                let request = to_arg(&JoinProjectRequest {
                    project_id: self.config.project_id.clone(),
                })?;
                tokio::select! {
                    result = session.call("joinProject", vec![request]) => {
                        match result {
                            Ok(args) => JoinProjectReply::from_ack(&args).map_err(TransportError::from)?,
                            Err(TransportError::Remote(reason)) => return Err(ConnectError::Rejected(reason)),
                            Err(e) => return Err(e.into()),
                        }
                    }
                    rejected = wait_for_rejection(&mut events) => return Err(rejected),
                }
            }
        };

        info!(
            "Joined project {} ({}) with scheme {:?}",
            reply.project.name, reply.project.id, scheme
        );
        Ok(Established {
            session: Arc::new(session),
            snapshot: reply.project,
            events,
        })
    }
}

/// Session id from the `sid:heartbeat:close:transports` handshake body.
fn parse_session_id(body: &str) -> Result<String, ProtocolError> {
    let sid = body.trim().split(':').next().unwrap_or_default();
    if sid.is_empty() {
        return Err(ProtocolError::MalformedFrame(body.chars().take(64).collect()));
    }
    Ok(sid.to_string())
}

/// Scheme A: the server pushes the project on its own.
async fn wait_for_project(
    events: &mut mpsc::UnboundedReceiver<ServerEvent>,
) -> Result<JoinProjectReply, ConnectError> {
    loop {
        match events.recv().await {
            Some(ServerEvent::JoinProjectResponse(reply)) => return Ok(reply),
            Some(ServerEvent::ConnectionRejected { reason })
            | Some(ServerEvent::ForceDisconnect { reason }) => {
                return Err(ConnectError::Rejected(reason));
            }
            Some(ServerEvent::Closed) | None => return Err(TransportError::Closed.into()),
            Some(other) => debug!("Ignoring {:?} before the project arrived", other),
        }
    }
}

/// Scheme B: resolves only if the server turns the connection down.
async fn wait_for_rejection(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ConnectError {
    loop {
        match events.recv().await {
            Some(ServerEvent::ConnectionRejected { reason })
            | Some(ServerEvent::ForceDisconnect { reason }) => {
                return ConnectError::Rejected(reason);
            }
            Some(ServerEvent::Closed) | None => return TransportError::Closed.into(),
            Some(other) => debug!("Ignoring {:?} while joining", other),
        }
    }
}

fn to_arg<T: Serialize>(value: &T) -> Result<Value, TransportError> {
    serde_json::to_value(value).map_err(|e| TransportError::Protocol(ProtocolError::from(e)))
}

/// One open socket with its read task.
pub struct SocketSession {
    write: Arc<Mutex<WsSink>>,
    pending: PendingAcks,
    next_id: AtomicU64,
    request_timeout: Duration,
    read_task: JoinHandle<()>,
}

impl SocketSession {
    /// Spawn the read loop for `ws_stream`.
    ///
    /// Server events arrive on the returned receiver, which ends with
    /// [`ServerEvent::Closed`] when the socket goes away.
    pub fn start(
        ws_stream: WsStream,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));
        let pending: PendingAcks = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let read_task = tokio::spawn(Self::read_loop(
            read,
            Arc::clone(&write),
            Arc::clone(&pending),
            event_tx,
        ));

        (
            Self {
                write,
                pending,
                next_id: AtomicU64::new(1),
                request_timeout,
                read_task,
            },
            event_rx,
        )
    }

    /// Read loop that answers heartbeats, resolves acks and forwards events.
    async fn read_loop(
        mut read: SplitStream<WsStream>,
        write: Arc<Mutex<WsSink>>,
        pending: PendingAcks,
        event_tx: mpsc::UnboundedSender<ServerEvent>,
    ) {
        loop {
            let text = match read.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Socket closed");
                        }
                        _ => error!("Socket error: {}", e),
                    }
                    break;
                }
                None => {
                    debug!("Socket stream ended");
                    break;
                }
            };

            let frame = match Frame::decode(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping undecodable frame: {}", e);
                    continue;
                }
            };

            match frame {
                Frame::Heartbeat => {
                    let mut w = write.lock().await;
                    if let Err(e) = w.send(Message::Text(Frame::Heartbeat.encode())).await {
                        warn!("Failed to answer heartbeat: {}", e);
                        break;
                    }
                }
                Frame::Connect => debug!("Socket connected"),
                Frame::Disconnect => {
                    debug!("Server sent disconnect");
                    break;
                }
                Frame::Ack { id, args } => {
                    let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(args);
                        }
                        None => debug!("Ack {} has no waiter (timed out?)", id),
                    }
                }
                Frame::Event { name, args, .. } => match ServerEvent::parse(&name, args) {
                    Ok(event) => {
                        if let ServerEvent::Unknown { name, .. } = &event {
                            debug!("Unknown server event {}", name);
                        }
                        if event_tx.send(event).is_err() {
                            debug!("Event receiver dropped, stopping read loop");
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed {} event: {}", name, e),
                },
                Frame::Error { reason } => {
                    warn!("Server error frame: {}", reason);
                    let _ = event_tx.send(ServerEvent::ConnectionRejected { reason });
                }
                Frame::Other { kind, .. } => debug!("Ignoring frame type {}", kind),
            }
        }

        // Fail every outstanding call
        pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
        let _ = event_tx.send(ServerEvent::Closed);
    }

    async fn send_frame(&self, frame: Frame) -> transport::Result<()> {
        let mut w = self.write.lock().await;
        w.send(Message::Text(frame.encode()))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
                other => TransportError::Other(other.to_string()),
            })
    }

    /// Emit `name` and wait for its ack, bounded by the request timeout.
    ///
    /// An error in the ack's first slot becomes [`TransportError::Remote`].
    pub async fn call(&self, name: &str, args: Vec<Value>) -> transport::Result<Vec<Value>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let request = async {
            self.send_frame(Frame::call(id, name, args)).await?;
            rx.await.map_err(|_| TransportError::Closed)
        };
        let result = with_timeout(self.request_timeout, name, request).await;
        if result.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
        }

        let args = result?;
        if let Some(message) = messages::ack_error(&args) {
            return Err(TransportError::Remote(message));
        }
        Ok(args)
    }
}

impl Drop for SocketSession {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

#[async_trait]
impl DocumentSession for SocketSession {
    async fn join_doc(&self, doc_id: &str) -> transport::Result<DocSnapshot> {
        let args = self
            .call("joinDoc", vec![json!(doc_id), to_arg(&JoinDocOptions::default())?])
            .await?;
        Ok(DocSnapshot::from_ack(&args)?)
    }

    async fn leave_doc(&self, doc_id: &str) -> transport::Result<()> {
        self.call("leaveDoc", vec![json!(doc_id)]).await?;
        Ok(())
    }

    async fn apply_update(&self, doc_id: &str, ops: Vec<TextOp>, version: u64) -> transport::Result<()> {
        let update = OtUpdate {
            doc: doc_id.to_string(),
            op: Some(ops),
            v: version,
        };
        self.call("applyOtUpdate", vec![json!(doc_id), to_arg(&update)?])
            .await?;
        Ok(())
    }

    async fn connected_users(&self) -> transport::Result<Vec<Collaborator>> {
        let args = self.call("clientTracking.getConnectedUsers", Vec::new()).await?;
        Ok(messages::connected_users_from_ack(&args)?)
    }

    async fn update_position(&self, doc_id: &str, row: u32, column: u32) -> transport::Result<()> {
        let position = PositionUpdate {
            row,
            column,
            doc_id: doc_id.to_string(),
        };
        with_timeout(
            self.request_timeout,
            "clientTracking.updatePosition",
            self.send_frame(Frame::event("clientTracking.updatePosition", vec![to_arg(&position)?])),
        )
        .await
    }

    async fn close(&self) {
        if let Err(e) = self.send_frame(Frame::Disconnect).await {
            debug!("Sending disconnect failed: {}", e);
        }
        if let Ok(mut w) = self.write.try_lock() {
            let _ = w.send(Message::Close(None)).await;
        }
        self.read_task.abort();
    }
}
