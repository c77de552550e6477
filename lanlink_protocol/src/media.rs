// Unreliable-channel (UDP) media packet codec.
//
// Layout of every datagram, in both directions:
//
//   [type: u8][tag_len: u16 LE][tag: tag_len bytes, UTF-8][payload: rest]
//
// The tag is the sender's session id on the peer → relay leg and the sender's
// display name on the relay → peer leg; the relay re-stamps it before
// fan-out. The payload is opaque: encoded video frames, raw audio chunks, or
// screen captures produced outside this crate.
//
// The type byte is kept raw in `MediaPacket` so the relay can forward packet
// types it does not know about unchanged; receivers use `media_kind()` to map
// it onto `MediaKind` and drop anything else.

use crate::types::MediaKind;

/// Bytes before the tag: the type byte plus the 2-byte tag length.
pub const MEDIA_HEADER_SIZE: usize = 3;

/// Receive buffer size for media sockets; the largest UDP datagram we accept.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

/// Reasons a datagram is rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short: {len} bytes (need at least {MEDIA_HEADER_SIZE})")]
    TooShort { len: usize },
    #[error("declared tag length {declared} exceeds remaining {available} bytes")]
    TagOverrun { declared: usize, available: usize },
    #[error("sender tag is not valid UTF-8")]
    TagNotUtf8,
    #[error("sender tag too long: {len} bytes (max {})", u16::MAX)]
    TagTooLong { len: usize },
}

/// A decoded media packet borrowing from the datagram buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPacket<'a> {
    pub kind: u8,
    pub tag: &'a str,
    pub payload: &'a [u8],
}

impl<'a> MediaPacket<'a> {
    /// Parse a datagram. Fails if it is shorter than the header, if the
    /// declared tag length runs past the end, or if the tag is not UTF-8.
    pub fn decode(datagram: &'a [u8]) -> Result<Self, PacketError> {
        if datagram.len() < MEDIA_HEADER_SIZE {
            return Err(PacketError::TooShort {
                len: datagram.len(),
            });
        }
        let kind = datagram[0];
        let tag_len = usize::from(u16::from_le_bytes([datagram[1], datagram[2]]));
        let rest = &datagram[MEDIA_HEADER_SIZE..];
        if tag_len > rest.len() {
            return Err(PacketError::TagOverrun {
                declared: tag_len,
                available: rest.len(),
            });
        }
        let (tag_bytes, payload) = rest.split_at(tag_len);
        let tag = std::str::from_utf8(tag_bytes).map_err(|_| PacketError::TagNotUtf8)?;
        Ok(Self { kind, tag, payload })
    }

    /// The packet type, if it is one of the known media kinds.
    pub fn media_kind(&self) -> Option<MediaKind> {
        MediaKind::from_byte(self.kind)
    }

    /// Serialize back to wire format.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        encode_packet(self.kind, self.tag, self.payload)
    }

    /// Same packet with a different sender tag (used for re-stamping).
    pub fn with_tag<'b>(&self, tag: &'b str) -> MediaPacket<'b>
    where
        'a: 'b,
    {
        MediaPacket {
            kind: self.kind,
            tag,
            payload: self.payload,
        }
    }
}

/// Build a datagram from its parts.
pub fn encode_packet(kind: u8, tag: &str, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    let tag_len =
        u16::try_from(tag.len()).map_err(|_| PacketError::TagTooLong { len: tag.len() })?;
    let mut out = Vec::with_capacity(MEDIA_HEADER_SIZE + tag.len() + payload.len());
    out.push(kind);
    out.extend_from_slice(&tag_len.to_le_bytes());
    out.extend_from_slice(tag.as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}
