//! Typed server events and call payloads.
//!
//! Server events arrive as a name plus an untyped argument array. They are
//! validated and converted into [`ServerEvent`] once, at the transport
//! boundary. Unknown names are preserved as [`ServerEvent::Unknown`].

use super::ProtocolError;
use crate::collaborators::Collaborator;
use crate::entity::{EntityKind, EntityRef, ProjectSnapshot};
use crate::ot::TextOp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A content update for one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtUpdate {
    /// Document identity
    pub doc: String,
    /// Ops to apply; absent on the ack the server sends back to the submitter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<Vec<TextOp>>,
    /// Version the ops apply to
    pub v: u64,
}

impl OtUpdate {
    /// Whether this update only acknowledges one of our own submissions.
    pub fn is_ack(&self) -> bool {
        self.op.as_ref().is_none_or(|ops| ops.is_empty())
    }
}

/// Notifications pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    EntityCreated {
        parent_id: String,
        kind: EntityKind,
        entity: EntityRef,
    },
    EntityRenamed {
        id: String,
        name: String,
    },
    EntityRemoved {
        id: String,
    },
    EntityMoved {
        id: String,
        new_parent_id: String,
    },
    OtUpdateApplied(OtUpdate),
    OtUpdateError {
        doc_id: Option<String>,
        message: String,
    },
    CollaboratorUpdated(Collaborator),
    CollaboratorDisconnected {
        client_id: String,
    },
    ConnectionAccepted {
        public_id: Option<String>,
    },
    ConnectionRejected {
        reason: String,
    },
    ForceDisconnect {
        reason: String,
    },
    JoinProjectResponse(JoinProjectReply),
    /// The socket closed; synthesized by the transport, never sent by the server
    Closed,
    Unknown {
        name: String,
        args: Vec<Value>,
    },
}

/// Project snapshot handed over when joining a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinProjectReply {
    pub project: ProjectSnapshot,
    #[serde(default, rename = "permissionsLevel")]
    pub permissions: Option<String>,
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<u32>,
}

/// Document content and version returned by `joinDoc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocSnapshot {
    pub lines: Vec<String>,
    pub version: u64,
}

impl DocSnapshot {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Parse the ack of a `joinDoc` call: `[err, lines, version, ...]`.
    pub fn from_ack(args: &[Value]) -> Result<Self, ProtocolError> {
        let lines: Vec<String> = arg(args, 1, "joinDoc")?;
        let version: u64 = arg(args, 2, "joinDoc")?;
        Ok(Self {
            lines: lines.iter().map(|line| decode_latin1_utf8(line)).collect(),
            version,
        })
    }
}

impl JoinProjectReply {
    /// Parse the ack of a `joinProject` call: `[err, project, permissions, protocolVersion]`.
    pub fn from_ack(args: &[Value]) -> Result<Self, ProtocolError> {
        Ok(Self {
            project: arg(args, 1, "joinProject")?,
            permissions: optional_arg(args, 2, "joinProject")?,
            protocol_version: optional_arg(args, 3, "joinProject")?,
        })
    }
}

/// Error carried in the first slot of an ack, if any.
pub fn ack_error(args: &[Value]) -> Option<String> {
    match args.first() {
        None | Some(Value::Null) => None,
        Some(Value::String(message)) => Some(message.clone()),
        Some(Value::Object(map)) => Some(
            map.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        ),
        Some(other) => Some(other.to_string()),
    }
}

/// Parse the ack of `clientTracking.getConnectedUsers`: `[err, users]`.
pub fn connected_users_from_ack(args: &[Value]) -> Result<Vec<Collaborator>, ProtocolError> {
    arg(args, 1, "clientTracking.getConnectedUsers")
}

/// Options sent with `joinDoc`.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinDocOptions {
    pub encode_ranges: bool,
}

impl Default for JoinDocOptions {
    fn default() -> Self {
        Self {
            encode_ranges: true,
        }
    }
}

/// Position update sent with `clientTracking.updatePosition`.
#[derive(Debug, Clone, Serialize)]
pub struct PositionUpdate {
    pub row: u32,
    pub column: u32,
    pub doc_id: String,
}

/// Join request for the explicit-join handshake.
#[derive(Debug, Clone, Serialize)]
pub struct JoinProjectRequest {
    pub project_id: String,
}

impl ServerEvent {
    /// Convert a named event with its raw arguments.
    pub fn parse(name: &str, args: Vec<Value>) -> Result<Self, ProtocolError> {
        let event = match name {
            "reciveNewDoc" => created(name, &args, EntityKind::Doc)?,
            "reciveNewFile" => created(name, &args, EntityKind::File)?,
            "reciveNewFolder" => created(name, &args, EntityKind::Folder)?,
            "reciveEntityRename" => ServerEvent::EntityRenamed {
                id: arg(&args, 0, name)?,
                name: arg(&args, 1, name)?,
            },
            "removeEntity" => ServerEvent::EntityRemoved {
                id: arg(&args, 0, name)?,
            },
            "reciveEntityMove" => ServerEvent::EntityMoved {
                id: arg(&args, 0, name)?,
                new_parent_id: arg(&args, 1, name)?,
            },
            "otUpdateApplied" => ServerEvent::OtUpdateApplied(arg(&args, 0, name)?),
            "otUpdateError" => {
                let message = match args.first() {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => ack_error(std::slice::from_ref(other)).unwrap_or_default(),
                    None => String::new(),
                };
                let doc_id = args
                    .get(1)
                    .and_then(|update| update.get("doc"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                ServerEvent::OtUpdateError { doc_id, message }
            }
            "clientTracking.clientUpdated" => ServerEvent::CollaboratorUpdated(arg(&args, 0, name)?),
            "clientTracking.clientDisconnected" => ServerEvent::CollaboratorDisconnected {
                client_id: arg(&args, 0, name)?,
            },
            "connectionAccepted" => ServerEvent::ConnectionAccepted {
                public_id: optional_arg(&args, 1, name)?,
            },
            "connectionRejected" => ServerEvent::ConnectionRejected {
                reason: reason(&args),
            },
            "forceDisconnect" => ServerEvent::ForceDisconnect {
                reason: reason(&args),
            },
            "joinProjectResponse" => ServerEvent::JoinProjectResponse(arg(&args, 0, name)?),
            _ => ServerEvent::Unknown {
                name: name.to_string(),
                args,
            },
        };
        Ok(event)
    }
}

fn created(name: &str, args: &[Value], kind: EntityKind) -> Result<ServerEvent, ProtocolError> {
    Ok(ServerEvent::EntityCreated {
        parent_id: arg(args, 0, name)?,
        kind,
        entity: arg(args, 1, name)?,
    })
}

fn reason(args: &[Value]) -> String {
    match args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => ack_error(std::slice::from_ref(other)).unwrap_or_default(),
    }
}

fn arg<T: DeserializeOwned>(args: &[Value], index: usize, event: &str) -> Result<T, ProtocolError> {
    let value = args
        .get(index)
        .ok_or_else(|| ProtocolError::payload(event, format!("missing argument {}", index)))?;
    serde_json::from_value(value.clone())
        .map_err(|e| ProtocolError::payload(event, format!("argument {}: {}", index, e)))
}

fn optional_arg<T: DeserializeOwned>(
    args: &[Value],
    index: usize,
    event: &str,
) -> Result<Option<T>, ProtocolError> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(_) => arg(args, index, event).map(Some),
    }
}

/// Undo the server's "UTF-8 bytes as Latin-1 code points" encoding of doc lines.
///
/// Strings that are not of that shape are returned unchanged.
pub fn decode_latin1_utf8(line: &str) -> String {
    if line.is_ascii() {
        return line.to_string();
    }
    let bytes: Option<Vec<u8>> = line
        .chars()
        .map(|c| u8::try_from(u32::from(c)).ok())
        .collect();
    bytes
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| line.to_string())
}
