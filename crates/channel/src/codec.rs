//! Engine.IO v4 / Socket.IO text framing.
//!
//! Every WebSocket text frame is an Engine.IO packet: a single type
//! digit followed by an optional body. Socket.IO packets travel inside
//! Engine.IO `message` packets, so an event on the `/pgagent` namespace
//! looks like `42/pgagent,["job_status_update",{...}]`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown engine packet type '{0}'")]
    UnknownEngineType(char),

    #[error("Unknown socket packet type '{0}'")]
    UnknownSocketType(char),

    #[error("Binary packets are not supported")]
    Binary,

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Engine.IO
// ---------------------------------------------------------------------------

/// Body of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings.
    pub ping_interval: u64,
    /// Milliseconds the server waits for a pong.
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

impl OpenHandshake {
    /// How long the session may stay silent before it is considered dead.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        let kind = frame.chars().next().ok_or(CodecError::Empty)?;
        let body = &frame[kind.len_utf8()..];
        match kind {
            '0' => Ok(Self::Open(serde_json::from_str(body)?)),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping(body.to_string())),
            '3' => Ok(Self::Pong(body.to_string())),
            '4' => Ok(Self::Message(body.to_string())),
            '5' => Ok(Self::Upgrade),
            '6' => Ok(Self::Noop),
            other => Err(CodecError::UnknownEngineType(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            // OpenHandshake only holds strings and integers.
            Self::Open(handshake) => format!(
                "0{}",
                serde_json::to_string(handshake).unwrap_or_else(|_| "{}".into())
            ),
            Self::Close => "1".into(),
            Self::Ping(body) => format!("2{body}"),
            Self::Pong(body) => format!("3{body}"),
            Self::Message(body) => format!("4{body}"),
            Self::Upgrade => "5".into(),
            Self::Noop => "6".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Socket.IO
// ---------------------------------------------------------------------------

/// Root namespace; omitted on the wire.
pub const ROOT_NAMESPACE: &str = "/";

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        payload: Value,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        data: Value,
    },
    ConnectError {
        namespace: String,
        message: String,
    },
}

impl SocketPacket {
    pub fn event(namespace: &str, name: &str, payload: Value) -> Self {
        Self::Event {
            namespace: namespace.to_string(),
            ack_id: None,
            name: name.to_string(),
            payload,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Self::Connect { namespace, .. }
            | Self::Disconnect { namespace }
            | Self::Event { namespace, .. }
            | Self::Ack { namespace, .. }
            | Self::ConnectError { namespace, .. } => namespace,
        }
    }

    /// Decode the body of an Engine.IO `message` packet.
    pub fn decode(body: &str) -> Result<Self, CodecError> {
        let kind = body.chars().next().ok_or(CodecError::Empty)?;
        match kind {
            '0'..='4' => {}
            '5' | '6' => return Err(CodecError::Binary),
            other => return Err(CodecError::UnknownSocketType(other)),
        }
        let mut rest = &body[kind.len_utf8()..];

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(i) => {
                    let ns = &rest[..i];
                    rest = &rest[i + 1..];
                    ns
                }
                None => {
                    let ns = rest;
                    rest = "";
                    ns
                }
            }
        } else {
            ROOT_NAMESPACE
        }
        .to_string();

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|e| CodecError::Malformed(format!("ack id: {e}")))?,
            )
        } else {
            None
        };
        rest = &rest[digits..];

        let data: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        match kind {
            '0' => Ok(Self::Connect { namespace, data }),
            '1' => Ok(Self::Disconnect { namespace }),
            '2' => {
                let mut args = match data {
                    Some(Value::Array(args)) => args.into_iter(),
                    _ => return Err(CodecError::Malformed("event body is not an array".into())),
                };
                let name = match args.next() {
                    Some(Value::String(name)) => name,
                    _ => return Err(CodecError::Malformed("event name missing".into())),
                };
                Ok(Self::Event {
                    namespace,
                    ack_id,
                    name,
                    payload: args.next().unwrap_or(Value::Null),
                })
            }
            '3' => {
                let ack_id =
                    ack_id.ok_or_else(|| CodecError::Malformed("ack without id".into()))?;
                let data = match data {
                    Some(Value::Array(mut args)) if !args.is_empty() => args.swap_remove(0),
                    _ => Value::Null,
                };
                Ok(Self::Ack {
                    namespace,
                    ack_id,
                    data,
                })
            }
            '4' => {
                let message = match data {
                    Some(Value::String(message)) => message,
                    Some(value) => value
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| value.to_string()),
                    None => String::new(),
                };
                Ok(Self::ConnectError { namespace, message })
            }
            other => Err(CodecError::UnknownSocketType(other)),
        }
    }

    pub fn encode(&self) -> String {
        fn prefix(kind: char, namespace: &str) -> String {
            let mut out = String::from(kind);
            if namespace != ROOT_NAMESPACE {
                out.push_str(namespace);
                out.push(',');
            }
            out
        }

        match self {
            Self::Connect { namespace, data } => {
                let mut out = prefix('0', namespace);
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
                out
            }
            Self::Disconnect { namespace } => prefix('1', namespace),
            Self::Event {
                namespace,
                ack_id,
                name,
                payload,
            } => {
                let mut out = prefix('2', namespace);
                if let Some(id) = ack_id {
                    out.push_str(&id.to_string());
                }
                let args = Value::Array(vec![Value::String(name.clone()), payload.clone()]);
                out.push_str(&args.to_string());
                out
            }
            Self::Ack {
                namespace,
                ack_id,
                data,
            } => {
                let mut out = prefix('3', namespace);
                out.push_str(&ack_id.to_string());
                out.push_str(&Value::Array(vec![data.clone()]).to_string());
                out
            }
            Self::ConnectError { namespace, message } => {
                let mut out = prefix('4', namespace);
                out.push_str(&serde_json::json!({ "message": message }).to_string());
                out
            }
        }
    }

    /// Wrap into the Engine.IO text frame that carries it.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}
