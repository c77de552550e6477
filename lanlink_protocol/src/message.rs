// Reliable-channel message vocabulary.
//
// Every framed payload is UTF-8 text of the form `PREFIX:<fields>`. Two enums
// cover both directions:
// - `ClientMessage`: sent by peers to the relay (`CHAT:`, `FILE_META:`,
//   `CONTROL:`, `PING`).
// - `ServerMessage`: sent by the relay to peers (`CONNECTED:`, `CHAT:`,
//   `FILE_META:`, `STATUS:`, `USERS:`, `PONG`).
//
// Presence payloads (`STATUS:` and `USERS:`) carry JSON built from the
// fixed-field `UserStatus` record so both sides agree on field names.
//
// Parsing mirrors what each side actually accepts. The relay treats anything
// it cannot parse as noise and ignores it, so `ClientMessage::parse` returns
// `Option`. Clients want to know why a server frame was rejected when
// debugging, so `ServerMessage::parse` returns a typed error.

use serde::{Deserialize, Serialize};

use crate::types::{Capability, SessionId};

/// Presence record for one session, as carried by `STATUS:` and `USERS:`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatus {
    pub username: String,
    pub video: bool,
    pub audio: bool,
    pub screen: bool,
}

impl UserStatus {
    /// A freshly joined user with every capability off.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            video: false,
            audio: false,
            screen: false,
        }
    }

    pub fn flag(&self, capability: Capability) -> bool {
        match capability {
            Capability::Video => self.video,
            Capability::Audio => self.audio,
            Capability::Screen => self.screen,
        }
    }

    pub fn set_flag(&mut self, capability: Capability, value: bool) {
        match capability {
            Capability::Video => self.video = value,
            Capability::Audio => self.audio = value,
            Capability::Screen => self.screen = value,
        }
    }
}

/// Errors from decoding a server-to-client frame.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    #[error("unrecognized message: {0:?}")]
    Unrecognized(String),
    #[error("{0} message is missing its sender field")]
    MissingSender(&'static str),
    #[error("invalid presence JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Messages sent by a peer to the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    /// Chat text for everyone else.
    Chat { text: String },
    /// File metadata (opaque JSON text) for everyone else.
    FileMeta { json: String },
    /// Toggle one of the sender's capability flags.
    Control { capability: Capability, on: bool },
    /// Heartbeat.
    Ping,
}

impl ClientMessage {
    pub fn encode(&self) -> String {
        match self {
            ClientMessage::Chat { text } => format!("CHAT:{text}"),
            ClientMessage::FileMeta { json } => format!("FILE_META:{json}"),
            ClientMessage::Control { capability, on } => {
                format!("CONTROL:{}", capability.command(*on))
            }
            ClientMessage::Ping => "PING".into(),
        }
    }

    /// Parse a client frame. Unknown prefixes and unknown control commands
    /// yield `None`.
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(rest) = text.strip_prefix("CHAT:") {
            Some(ClientMessage::Chat { text: rest.into() })
        } else if let Some(rest) = text.strip_prefix("FILE_META:") {
            Some(ClientMessage::FileMeta { json: rest.into() })
        } else if let Some(rest) = text.strip_prefix("CONTROL:") {
            let (capability, on) = Capability::parse_command(rest)?;
            Some(ClientMessage::Control { capability, on })
        } else if text == "PING" {
            Some(ClientMessage::Ping)
        } else {
            None
        }
    }
}

/// Messages sent by the relay to a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMessage {
    /// Handshake accepted.
    Connected { session_id: SessionId, name: String },
    /// Chat from another peer.
    Chat { from: String, text: String },
    /// File metadata from another peer.
    FileMeta { from: String, json: String },
    /// One peer's capability flags changed.
    Status(UserStatus),
    /// Full presence list.
    Users(Vec<UserStatus>),
    /// Heartbeat reply.
    Pong,
}

impl ServerMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        Ok(match self {
            ServerMessage::Connected { session_id, name } => {
                format!("CONNECTED:{session_id}:{name}")
            }
            ServerMessage::Chat { from, text } => format!("CHAT:{from}:{text}"),
            ServerMessage::FileMeta { from, json } => format!("FILE_META:{from}:{json}"),
            ServerMessage::Status(status) => {
                format!("STATUS:{}", serde_json::to_string(status)?)
            }
            ServerMessage::Users(users) => format!("USERS:{}", serde_json::to_string(users)?),
            ServerMessage::Pong => "PONG".into(),
        })
    }

    /// Decode raw frame bytes.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, MessageError> {
        let text = std::str::from_utf8(bytes).map_err(|_| MessageError::NotUtf8)?;
        Self::parse(text)
    }

    pub fn parse(text: &str) -> Result<Self, MessageError> {
        if let Some(rest) = text.strip_prefix("CONNECTED:") {
            let (id, name) = rest
                .split_once(':')
                .ok_or(MessageError::MissingSender("CONNECTED"))?;
            Ok(ServerMessage::Connected {
                session_id: SessionId(id.into()),
                name: name.into(),
            })
        } else if let Some(rest) = text.strip_prefix("CHAT:") {
            let (from, body) = rest
                .split_once(':')
                .ok_or(MessageError::MissingSender("CHAT"))?;
            Ok(ServerMessage::Chat {
                from: from.into(),
                text: body.into(),
            })
        } else if let Some(rest) = text.strip_prefix("FILE_META:") {
            let (from, json) = rest
                .split_once(':')
                .ok_or(MessageError::MissingSender("FILE_META"))?;
            Ok(ServerMessage::FileMeta {
                from: from.into(),
                json: json.into(),
            })
        } else if let Some(rest) = text.strip_prefix("STATUS:") {
            Ok(ServerMessage::Status(serde_json::from_str(rest)?))
        } else if let Some(rest) = text.strip_prefix("USERS:") {
            Ok(ServerMessage::Users(serde_json::from_str(rest)?))
        } else if text == "PONG" {
            Ok(ServerMessage::Pong)
        } else {
            Err(MessageError::Unrecognized(text.into()))
        }
    }
}
