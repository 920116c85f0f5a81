//! socket.io 0.9 frame codec.
//!
//! Wire format: `type:id[+]:endpoint[:data]`
//!
//! | type | meaning    | data                              |
//! |------|------------|-----------------------------------|
//! | 0    | disconnect | -                                 |
//! | 1    | connect    | -                                 |
//! | 2    | heartbeat  | -                                 |
//! | 5    | event      | `{"name":"...","args":[...]}`     |
//! | 6    | ack        | `<id>+[...]`                      |
//! | 7    | error      | `reason[+advice]`                 |
//!
//! Message (3), json (4) and noop (8) frames are decoded as [`Frame::Other`].

use super::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Disconnect,
    Connect,
    Heartbeat,
    /// Named event; `id` is set when the sender expects an ack
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    /// Reply to an event that carried `id`
    Ack { id: u64, args: Vec<Value> },
    Error { reason: String },
    Other { kind: u8, data: String },
}

#[derive(Serialize, Deserialize)]
struct EventBody {
    name: String,
    #[serde(default)]
    args: Vec<Value>,
}

impl Frame {
    pub fn event(name: impl Into<String>, args: Vec<Value>) -> Self {
        Frame::Event {
            id: None,
            name: name.into(),
            args,
        }
    }

    /// Event frame that asks the server to ack with `id`.
    pub fn call(id: u64, name: impl Into<String>, args: Vec<Value>) -> Self {
        Frame::Event {
            id: Some(id),
            name: name.into(),
            args,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Frame::Disconnect => "0::".to_string(),
            Frame::Connect => "1::".to_string(),
            Frame::Heartbeat => "2::".to_string(),
            Frame::Event { id, name, args } => {
                let body = serde_json::json!({ "name": name, "args": args });
                match id {
                    Some(id) => format!("5:{}+::{}", id, body),
                    None => format!("5:::{}", body),
                }
            }
            Frame::Ack { id, args } => {
                format!("6:::{}+{}", id, Value::Array(args.clone()))
            }
            Frame::Error { reason } => format!("7:::{}", reason),
            Frame::Other { kind, data } => format!("{}:::{}", kind, data),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let mut parts = raw.splitn(4, ':');
        let kind = parts
            .next()
            .and_then(|k| k.parse::<u8>().ok())
            .ok_or_else(|| ProtocolError::MalformedFrame(truncate(raw)))?;
        let id_field = parts
            .next()
            .ok_or_else(|| ProtocolError::MalformedFrame(truncate(raw)))?;
        let _endpoint = parts.next().unwrap_or("");
        let data = parts.next().unwrap_or("");

        match kind {
            0 => Ok(Frame::Disconnect),
            1 => Ok(Frame::Connect),
            2 => Ok(Frame::Heartbeat),
            5 => {
                let id = parse_id(id_field, raw)?;
                let body: EventBody = serde_json::from_str(data)?;
                Ok(Frame::Event {
                    id,
                    name: body.name,
                    args: body.args,
                })
            }
            6 => {
                let (id, payload) = match data.split_once('+') {
                    Some((id, payload)) => (id, payload),
                    None => (data, ""),
                };
                let id = id
                    .parse::<u64>()
                    .map_err(|_| ProtocolError::MalformedFrame(truncate(raw)))?;
                let args = if payload.is_empty() {
                    Vec::new()
                } else {
                    match serde_json::from_str(payload)? {
                        Value::Array(args) => args,
                        other => vec![other],
                    }
                };
                Ok(Frame::Ack { id, args })
            }
            7 => Ok(Frame::Error {
                reason: data.to_string(),
            }),
            kind => Ok(Frame::Other {
                kind,
                data: data.to_string(),
            }),
        }
    }
}

fn parse_id(field: &str, raw: &str) -> Result<Option<u64>, ProtocolError> {
    let field = field.trim_end_matches('+');
    if field.is_empty() {
        return Ok(None);
    }
    field
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ProtocolError::MalformedFrame(truncate(raw)))
}

fn truncate(raw: &str) -> String {
    raw.chars().take(64).collect()
}
