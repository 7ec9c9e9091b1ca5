//! Engine.IO v4 / Socket.IO v4 text frame codec.
//!
//! Every WebSocket text frame is one Engine.IO packet: a single type digit
//! followed by an optional payload. Message packets (`4`) carry one
//! Socket.IO packet, which is a type digit, an optional `/namespace,`
//! prefix, an optional numeric ack id and an optional JSON body:
//!
//! ```text
//! 0{"sid":"x","pingInterval":25000,"pingTimeout":20000}   engine open
//! 2                                                       engine ping
//! 40                                                      socket connect
//! 42["new_alert",{"id":7}]                                socket event
//! 42/ws,["new_alert",{"id":7}]                            event on /ws
//! ```
//!
//! Binary attachments are not supported.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ChannelError;

/// The namespace used when a URL has no path.
pub const ROOT_NAMESPACE: &str = "/";

/// Engine.IO session parameters sent by the server on open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
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

/// An Engine.IO packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    /// Decodes one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Protocol`] for an empty frame, an unknown
    /// packet type, or a malformed open handshake.
    pub fn decode(frame: &str) -> Result<Self, ChannelError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or_else(|| protocol("empty engine frame"))?;
        let body = chars.as_str();

        Ok(match kind {
            '0' => Self::Open(serde_json::from_str(body).map_err(|e| ChannelError::Protocol {
                message: format!("bad open handshake: {e}"),
            })?),
            '1' => Self::Close,
            '2' => Self::Ping(body.to_string()),
            '3' => Self::Pong(body.to_string()),
            '4' => Self::Message(body.to_string()),
            '5' => Self::Upgrade,
            '6' => Self::Noop,
            other => return Err(protocol(format!("unknown engine packet type '{other}'"))),
        })
    }

    /// Encodes as one text frame.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Open(handshake) => format!(
                "0{}",
                serde_json::to_string(handshake).unwrap_or_else(|_| "{}".to_string())
            ),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

/// A Socket.IO packet carried inside an engine message.
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
        name: String,
        args: Vec<Value>,
        ack_id: Option<u64>,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        args: Vec<Value>,
    },
    ConnectError {
        namespace: String,
        data: Value,
    },
}

impl SocketPacket {
    /// An event on `namespace` with a single argument.
    #[must_use]
    pub fn event(namespace: &str, name: &str, data: Value) -> Self {
        Self::Event {
            namespace: namespace.to_string(),
            name: name.to_string(),
            args: vec![data],
            ack_id: None,
        }
    }

    /// The namespace this packet belongs to.
    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::Connect { namespace, .. }
            | Self::Disconnect { namespace }
            | Self::Event { namespace, .. }
            | Self::Ack { namespace, .. }
            | Self::ConnectError { namespace, .. } => namespace,
        }
    }

    /// Decodes the payload of an engine message packet.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Protocol`] for unknown or binary packet
    /// types, or a body that is not the JSON shape the type requires.
    pub fn decode(body: &str) -> Result<Self, ChannelError> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| protocol("empty socket packet"))?;
        let mut rest = chars.as_str();

        if matches!(kind, '5' | '6') {
            return Err(protocol("binary socket packets are not supported"));
        }

        let namespace = if rest.starts_with('/') {
            let end = rest.find(',').unwrap_or(rest.len());
            let namespace = rest[..end].to_string();
            rest = rest.get(end + 1..).unwrap_or("");
            namespace
        } else {
            ROOT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|e| protocol(format!("bad ack id: {e}")))?,
            )
        } else {
            None
        };
        rest = &rest[digits..];

        let json = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(rest).map_err(|e| ChannelError::Protocol {
                message: format!("bad socket payload: {e}"),
            })?)
        };

        match kind {
            '0' => Ok(Self::Connect {
                namespace,
                data: json,
            }),
            '1' => Ok(Self::Disconnect { namespace }),
            '2' => {
                let Some(Value::Array(mut items)) = json else {
                    return Err(protocol("event payload must be an array"));
                };
                if items.is_empty() {
                    return Err(protocol("event payload has no name"));
                }
                let Value::String(name) = items.remove(0) else {
                    return Err(protocol("event name must be a string"));
                };
                Ok(Self::Event {
                    namespace,
                    name,
                    args: items,
                    ack_id,
                })
            }
            '3' => {
                let ack_id = ack_id.ok_or_else(|| protocol("ack without id"))?;
                let args = match json {
                    Some(Value::Array(items)) => items,
                    _ => return Err(protocol("ack payload must be an array")),
                };
                Ok(Self::Ack {
                    namespace,
                    ack_id,
                    args,
                })
            }
            '4' => Ok(Self::ConnectError {
                namespace,
                data: json.unwrap_or(Value::Null),
            }),
            other => Err(protocol(format!("unknown socket packet type '{other}'"))),
        }
    }

    /// Encodes as the payload of an engine message packet.
    #[must_use]
    pub fn encode(&self) -> String {
        let prefix = |namespace: &str| {
            if namespace == ROOT_NAMESPACE {
                String::new()
            } else {
                format!("{namespace},")
            }
        };

        match self {
            Self::Connect { namespace, data } => format!(
                "0{}{}",
                prefix(namespace),
                data.as_ref().map(Value::to_string).unwrap_or_default()
            ),
            Self::Disconnect { namespace } => format!("1{}", prefix(namespace)),
            Self::Event {
                namespace,
                name,
                args,
                ack_id,
            } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                format!(
                    "2{}{}{}",
                    prefix(namespace),
                    ack_id.map(|id| id.to_string()).unwrap_or_default(),
                    Value::Array(items)
                )
            }
            Self::Ack {
                namespace,
                ack_id,
                args,
            } => format!(
                "3{}{ack_id}{}",
                prefix(namespace),
                Value::Array(args.clone())
            ),
            Self::ConnectError { namespace, data } => format!("4{}{data}", prefix(namespace)),
        }
    }

    /// Wraps this packet in an engine message frame.
    #[must_use]
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

/// The first argument of an event, or `null` when it has none.
#[must_use]
pub fn first_arg(args: &[Value]) -> Value {
    args.first().cloned().unwrap_or(Value::Null)
}

fn protocol(message: impl Into<String>) -> ChannelError {
    ChannelError::Protocol {
        message: message.into(),
    }
}
