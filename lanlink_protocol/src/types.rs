// Core identifier and enum types shared by the relay and its clients.
//
// `SessionId` is the opaque id the relay hands out in `CONNECTED:` and that
// clients stamp on every media packet. `Capability` names the three per-session
// media flags toggled by `CONTROL:` messages, and `MediaKind` is the type byte
// at the front of every media packet.

use std::fmt;

/// Relay-assigned session id. Opaque to clients; never contains `:`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A per-session media flag, toggled by `CONTROL:<FLAG>_ON|_OFF`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Video,
    Audio,
    Screen,
}

impl Capability {
    /// Wire prefix used in control commands (`VIDEO`, `AUDIO`, `SCREEN`).
    pub fn wire_name(self) -> &'static str {
        match self {
            Capability::Video => "VIDEO",
            Capability::Audio => "AUDIO",
            Capability::Screen => "SCREEN",
        }
    }

    fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "VIDEO" => Some(Capability::Video),
            "AUDIO" => Some(Capability::Audio),
            "SCREEN" => Some(Capability::Screen),
            _ => None,
        }
    }

    /// Format a control command such as `VIDEO_ON` or `SCREEN_OFF`.
    pub fn command(self, on: bool) -> String {
        let state = if on { "ON" } else { "OFF" };
        format!("{}_{state}", self.wire_name())
    }

    /// Parse a control command such as `AUDIO_OFF`. Unknown commands yield
    /// `None`.
    pub fn parse_command(command: &str) -> Option<(Self, bool)> {
        let (name, state) = command.rsplit_once('_')?;
        let on = match state {
            "ON" => true,
            "OFF" => false,
            _ => return None,
        };
        Some((Self::from_wire_name(name)?, on))
    }
}

/// Media packet type byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MediaKind {
    Video = 1,
    Audio = 2,
    Screen = 3,
}

impl MediaKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MediaKind::Video),
            2 => Some(MediaKind::Audio),
            3 => Some(MediaKind::Screen),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}
