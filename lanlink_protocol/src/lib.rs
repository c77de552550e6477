// lanlink_protocol — wire protocol shared by the LanLink relay and its peers.
//
// This crate defines the framing, message vocabulary, and media packet codec
// used by the relay (`lanlink_relay::server`) and peers
// (`lanlink_relay::client`). It performs no networking itself.
//
// Module overview:
// - `types.rs`:    `SessionId`, `Capability` (video/audio/screen flags), and
//                  `MediaKind` (media packet type byte).
// - `message.rs`:  Textual control vocabulary (`ClientMessage`,
//                  `ServerMessage`) and the `UserStatus` presence record.
// - `framing.rs`:  Length-delimited framing over any `Read`/`Write` stream:
//                  4-byte little-endian length prefix, then UTF-8 payload.
// - `media.rs`:    `[type][tag_len][tag][payload]` UDP packet codec.
//
// Design decisions:
// - **Text vocabulary, JSON presence.** Control frames are colon-separated
//   strings so existing peers interoperate; only presence payloads are JSON.
// - **Media payloads are opaque `&[u8]`.** The relay never inspects them.
// - **No async runtime.** Framing works on `std::io::Read`/`Write`, compatible
//   with blocking TCP streams and buffered wrappers alike.

pub mod framing;
pub mod media;
pub mod message;
pub mod types;

pub use framing::{MAX_MESSAGE_SIZE, read_message, write_message};
pub use media::{MAX_DATAGRAM_SIZE, MEDIA_HEADER_SIZE, MediaPacket, PacketError, encode_packet};
pub use message::{ClientMessage, MessageError, ServerMessage, UserStatus};
pub use types::{Capability, MediaKind, SessionId};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Encode a ClientMessage, frame it, read it back, parse it.
    fn client_roundtrip(msg: &ClientMessage) {
        let mut wire = Vec::new();
        write_message(&mut wire, msg.encode().as_bytes()).unwrap();

        let mut cursor = Cursor::new(&wire);
        let recovered = read_message(&mut cursor).unwrap();
        let text = String::from_utf8(recovered).unwrap();
        assert_eq!(ClientMessage::parse(&text).as_ref(), Some(msg));
    }

    /// Encode a ServerMessage, frame it, read it back, parse it.
    fn server_roundtrip(msg: &ServerMessage) {
        let mut wire = Vec::new();
        write_message(&mut wire, msg.encode().unwrap().as_bytes()).unwrap();

        let mut cursor = Cursor::new(&wire);
        let recovered = read_message(&mut cursor).unwrap();
        assert_eq!(&ServerMessage::parse_bytes(&recovered).unwrap(), msg);
    }

    #[test]
    fn roundtrip_client_vocabulary() {
        client_roundtrip(&ClientMessage::Chat {
            text: "Hello everyone!".into(),
        });
        client_roundtrip(&ClientMessage::FileMeta {
            json: r#"{"filename":"notes.pdf","size":20480}"#.into(),
        });
        client_roundtrip(&ClientMessage::Control {
            capability: Capability::Screen,
            on: false,
        });
        client_roundtrip(&ClientMessage::Ping);
    }

    #[test]
    fn roundtrip_server_vocabulary() {
        server_roundtrip(&ServerMessage::Connected {
            session_id: SessionId("alice_1700000000000_0".into()),
            name: "alice".into(),
        });
        server_roundtrip(&ServerMessage::Chat {
            from: "bob".into(),
            text: "see you at 10:30".into(),
        });
        server_roundtrip(&ServerMessage::FileMeta {
            from: "bob".into(),
            json: r#"{"filename":"a.png"}"#.into(),
        });
        server_roundtrip(&ServerMessage::Status(UserStatus {
            username: "alice".into(),
            video: true,
            audio: true,
            screen: false,
        }));
        server_roundtrip(&ServerMessage::Users(vec![]));
        server_roundtrip(&ServerMessage::Pong);
    }

    #[test]
    fn chat_text_with_unicode_survives_framing() {
        client_roundtrip(&ClientMessage::Chat {
            text: "héllo 👋 — ünïcode".into(),
        });
    }
}
