// Error taxonomy for the relay and the client mirror.
//
// `RelayError` covers everything that can end (or be isolated within) a
// server-side operation. None of these are retried: handshakes and frames that
// fail close the connection, malformed media packets are dropped, failed sends
// are logged and skipped. `ClientError` is what the client's `connect` and
// send paths return to the embedding application.

use std::io;
use std::net::SocketAddr;

use lanlink_protocol::{MessageError, PacketError, SessionId};

/// Server-side failures.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Empty, non-UTF-8, unreadable, or timed-out initial payload.
    #[error("handshake failed: {0}")]
    HandshakeFailure(String),

    /// Idle too long waiting for a frame, or a partial frame stalled.
    #[error("frame read timed out")]
    FrameTimeout,

    /// Undersized or inconsistent media datagram.
    #[error("malformed media packet from {from}: {source}")]
    MalformedPacket {
        from: SocketAddr,
        #[source]
        source: PacketError,
    },

    /// A write to one fan-out recipient failed.
    #[error("send to {recipient} failed: {source}")]
    SendFailure {
        recipient: String,
        #[source]
        source: io::Error,
    },

    /// Liveness threshold exceeded.
    #[error("session {0} went stale")]
    StaleSession(SessionId),

    /// The connection's handler thread exited without closing its session.
    #[error("session handler aborted")]
    HandlerAborted,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Classify a read error from the control channel. Read timeouts surface
    /// as `WouldBlock` or `TimedOut` depending on the platform.
    pub fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => RelayError::FrameTimeout,
            _ => RelayError::Io(err),
        }
    }
}

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The relay answered the handshake with something other than
    /// `CONNECTED:<id>:<name>`.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("timed out waiting for the relay")]
    Timeout,

    #[error("invalid server message: {0}")]
    Message(#[from] MessageError),

    #[error("invalid media packet: {0}")]
    Packet(#[from] PacketError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_timeouts_classify_as_frame_timeout() {
        for kind in [io::ErrorKind::WouldBlock, io::ErrorKind::TimedOut] {
            let err = RelayError::from_read(io::Error::from(kind));
            assert!(matches!(err, RelayError::FrameTimeout), "{kind:?}");
        }
        let eof = RelayError::from_read(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(eof, RelayError::Io(_)));
    }
}
