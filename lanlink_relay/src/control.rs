// Reliable-channel (TCP) connection handler and control message processor.
//
// Each accepted connection runs `handle_connection` on its own thread and
// moves through three states:
//
//   AwaitingHandshake ──(display name)──▶ Active ──(read failure/timeout)──▶ Closed
//          │                                                                   ▲
//          └──────────────(empty / bad / timed out)─────────── drop ───────────┘
//
// - AwaitingHandshake: one raw (unframed) read of at most
//   `max_handshake_bytes`, bounded by `handshake_timeout`. The trimmed UTF-8
//   text is the display name. On success the session is registered, the
//   framed `CONNECTED:<id>:<name>` reply is sent, and the full user list is
//   broadcast to everyone. A failed handshake never touches the registry.
// - Active: frames are read with two timeouts, `idle_timeout` for the length
//   prefix (peers may be quiet for a long time between messages) and
//   `frame_timeout` for the body (a half-sent frame is a dead peer). Every
//   frame refreshes `last_seen` and goes through `process_message`.
// - Closed: the session is removed from the registry and, if this path did the
//   removal (the sweeper may have got there first), the remaining sessions get
//   a fresh user list. The socket is shut down either way. `OpenSession` runs
//   this step from its `Drop` if the handler unwinds before closing.
//
// This module only reads from the connection. All writes go through the
// session's `ControlLink` so that they serialize with fan-out writes from
// other threads.

use std::io::{BufReader, Read};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use lanlink_protocol::framing::{read_body, read_length};
use lanlink_protocol::{ClientMessage, ServerMessage, SessionId};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::presence::{self, FanOutReport};
use crate::registry::{ControlLink, SessionRegistry};

/// Timeouts and bounds for one control connection.
#[derive(Clone, Debug)]
pub struct ControlLimits {
    pub handshake_timeout: Duration,
    pub max_handshake_bytes: usize,
    pub idle_timeout: Duration,
    pub frame_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ControlLimits {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            max_handshake_bytes: 1024,
            idle_timeout: Duration::from_secs(300),
            frame_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// What `process_message` did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Chat(FanOutReport),
    FileMeta(FanOutReport),
    Status(FanOutReport),
    Pong,
    /// Unknown prefix, unknown control command, bad UTF-8, or the sender is
    /// no longer registered.
    Ignored,
}

/// Drive one connection from handshake to close. Blocks until the connection
/// ends.
pub fn handle_connection(stream: TcpStream, registry: Arc<SessionRegistry>, limits: &ControlLimits) {
    let peer = stream.peer_addr().ok();

    let name = match read_handshake(&stream, limits) {
        Ok(name) => name,
        Err(e) => {
            debug!(peer = ?peer, error = %e, "dropping connection before registration");
            return;
        }
    };

    let (link, reader) = match split_stream(stream, limits) {
        Ok(halves) => halves,
        Err(e) => {
            warn!(peer = ?peer, error = %e, "failed to set up control connection");
            return;
        }
    };

    let session = match open_session(&registry, &name, &link) {
        Ok(session) => session,
        Err(e) => {
            debug!(peer = ?peer, error = %e, "greeting failed");
            return;
        }
    };

    presence::broadcast_user_list(&registry);
    let reason = run_active(reader, &registry, session.id(), limits);
    session.close(&reason);
}

/// A registered session owned by its handler thread. Dropping it without
/// calling `close` (the handler unwound) still runs the Closed step once.
pub struct OpenSession<'a> {
    registry: &'a SessionRegistry,
    link: &'a ControlLink,
    id: SessionId,
    closed: bool,
}

impl OpenSession<'_> {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn close(mut self, reason: &RelayError) {
        self.closed = true;
        close_session(self.registry, &self.id, self.link, reason);
    }
}

impl Drop for OpenSession<'_> {
    fn drop(&mut self) {
        if !self.closed {
            close_session(self.registry, &self.id, self.link, &RelayError::HandlerAborted);
        }
    }
}

/// Register `name` and send its `CONNECTED` reply. The link's writer is held
/// from before registration until the reply is written, so no fan-out frame
/// can reach the peer ahead of it. A failed reply closes the session.
pub fn open_session<'a>(
    registry: &'a SessionRegistry,
    name: &str,
    link: &'a Arc<ControlLink>,
) -> Result<OpenSession<'a>> {
    let mut writer = link.hold();
    let id = registry.register(name, Arc::clone(link));
    let session = OpenSession {
        registry,
        link: link.as_ref(),
        id,
        closed: false,
    };
    info!(session = %session.id, name = %name, peer = ?link.peer(), "session connected");

    let greeting = ServerMessage::Connected {
        session_id: session.id.clone(),
        name: name.to_owned(),
    }
    .encode()
    .map_err(|e| RelayError::Io(e.into()))
    .and_then(|reply| writer.send_text(&reply).map_err(RelayError::Io));
    drop(writer);

    match greeting {
        Ok(()) => Ok(session),
        Err(e) => {
            session.close(&e);
            Err(e)
        }
    }
}

/// Read the unframed display name.
fn read_handshake(stream: &TcpStream, limits: &ControlLimits) -> Result<String> {
    stream
        .set_read_timeout(Some(limits.handshake_timeout))
        .map_err(|e| RelayError::HandshakeFailure(e.to_string()))?;

    let mut buf = vec![0u8; limits.max_handshake_bytes];
    let mut reader = stream;
    let n = reader
        .read(&mut buf)
        .map_err(|e| RelayError::HandshakeFailure(e.to_string()))?;
    parse_handshake(&buf[..n])
}

/// Validate handshake bytes: non-empty UTF-8 after trimming.
pub fn parse_handshake(bytes: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| RelayError::HandshakeFailure("display name is not UTF-8".into()))?;
    let name = text.trim();
    if name.is_empty() {
        return Err(RelayError::HandshakeFailure("empty display name".into()));
    }
    Ok(name.to_owned())
}

/// Split an accepted stream into the shared write link and a buffered reader.
fn split_stream(
    stream: TcpStream,
    limits: &ControlLimits,
) -> std::io::Result<(Arc<ControlLink>, BufReader<TcpStream>)> {
    let write_half = stream.try_clone()?;
    let link = ControlLink::new(write_half, Some(limits.write_timeout))?;
    Ok((Arc::new(link), BufReader::new(stream)))
}

/// Active-state loop. Returns the error that ended it.
fn run_active(
    mut reader: BufReader<TcpStream>,
    registry: &SessionRegistry,
    id: &SessionId,
    limits: &ControlLimits,
) -> RelayError {
    loop {
        match read_frame(&mut reader, limits) {
            Ok(frame) => {
                registry.touch(id);
                let dispatch = process_message(registry, id, &frame);
                debug!(session = %id, ?dispatch, "processed control frame");
            }
            Err(e) => return e,
        }
    }
}

/// Read one frame with the idle timeout on the prefix and the stall timeout
/// on the body.
fn read_frame(reader: &mut BufReader<TcpStream>, limits: &ControlLimits) -> Result<Vec<u8>> {
    reader.get_ref().set_read_timeout(Some(limits.idle_timeout))?;
    let len = read_length(reader).map_err(RelayError::from_read)?;
    reader.get_ref().set_read_timeout(Some(limits.frame_timeout))?;
    read_body(reader, len).map_err(RelayError::from_read)
}

/// Dispatch one control frame from `sender`.
pub fn process_message(registry: &SessionRegistry, sender: &SessionId, frame: &[u8]) -> Dispatch {
    let Some(message) = std::str::from_utf8(frame).ok().and_then(ClientMessage::parse) else {
        return Dispatch::Ignored;
    };
    let Some(sender_name) = registry.display_name(sender) else {
        return Dispatch::Ignored;
    };

    match message {
        ClientMessage::Chat { text } => {
            registry.traffic().record_chat();
            let msg = ServerMessage::Chat {
                from: sender_name,
                text,
            };
            Dispatch::Chat(presence::broadcast_except(registry, sender, &msg))
        }
        ClientMessage::FileMeta { json } => {
            let msg = ServerMessage::FileMeta {
                from: sender_name,
                json,
            };
            Dispatch::FileMeta(presence::broadcast_except(registry, sender, &msg))
        }
        ClientMessage::Control { capability, on } => {
            match registry.set_capability(sender, capability, on) {
                Some(status) => {
                    debug!(session = %sender, ?capability, on, "capability changed");
                    Dispatch::Status(presence::broadcast_status(registry, sender, status))
                }
                None => Dispatch::Ignored,
            }
        }
        ClientMessage::Ping => {
            let sent = match registry.link(sender) {
                Some(link) => link.send_text("PONG"),
                None => return Dispatch::Ignored,
            };
            if let Err(e) = sent {
                warn!(session = %sender, error = %e, "failed to send PONG");
            }
            Dispatch::Pong
        }
    }
}

/// Closed state: deregister once, rebroadcast presence, release the socket.
fn close_session(
    registry: &SessionRegistry,
    id: &SessionId,
    link: &ControlLink,
    reason: &RelayError,
) {
    if let Some(session) = registry.remove(id) {
        info!(
            session = %id,
            name = %session.display_name(),
            reason = %reason,
            "session closed"
        );
        presence::broadcast_user_list(registry);
    } else {
        debug!(session = %id, reason = %reason, "session already removed");
    }
    link.close();
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpListener;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    use lanlink_protocol::framing::{read_message, write_message};
    use lanlink_protocol::{Capability, UserStatus};

    use super::*;
    use crate::registry::tests::test_link;

    fn short_limits() -> ControlLimits {
        ControlLimits {
            handshake_timeout: Duration::from_millis(300),
            idle_timeout: Duration::from_millis(500),
            frame_timeout: Duration::from_millis(200),
            ..ControlLimits::default()
        }
    }

    fn recv(stream: &mut TcpStream) -> ServerMessage {
        let bytes = read_message(stream).unwrap();
        ServerMessage::parse_bytes(&bytes).unwrap()
    }

    /// Spawn `handle_connection` on the server half of a fresh pair.
    fn spawn_handler(
        registry: &Arc<SessionRegistry>,
        limits: ControlLimits,
    ) -> (TcpStream, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (server, _) = listener.accept().unwrap();
        let registry = Arc::clone(registry);
        let handle = thread::spawn(move || handle_connection(server, registry, &limits));
        (client, handle)
    }

    #[test]
    fn handshake_parsing() {
        assert_eq!(parse_handshake(b"alice").unwrap(), "alice");
        assert_eq!(parse_handshake(b"  bob \r\n").unwrap(), "bob");
        assert!(matches!(
            parse_handshake(b""),
            Err(RelayError::HandshakeFailure(_))
        ));
        assert!(matches!(
            parse_handshake(b" \n"),
            Err(RelayError::HandshakeFailure(_))
        ));
        assert!(matches!(
            parse_handshake(&[0xFF, 0x00]),
            Err(RelayError::HandshakeFailure(_))
        ));
    }

    #[test]
    fn handshake_registers_and_replies() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut client, handle) = spawn_handler(&registry, ControlLimits::default());

        client.write_all(b"alice").unwrap();
        let id = match recv(&mut client) {
            ServerMessage::Connected { session_id, name } => {
                assert_eq!(name, "alice");
                session_id
            }
            other => panic!("expected CONNECTED, got {other:?}"),
        };
        assert_eq!(
            recv(&mut client),
            ServerMessage::Users(vec![UserStatus::new("alice")])
        );
        assert!(registry.contains(&id));

        drop(client);
        handle.join().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn silent_handshake_times_out_without_registering() {
        let registry = Arc::new(SessionRegistry::new());
        let (_client, handle) = spawn_handler(&registry, short_limits());
        handle.join().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn empty_handshake_is_dropped() {
        let registry = Arc::new(SessionRegistry::new());
        let (client, handle) = spawn_handler(&registry, short_limits());
        // Closing without sending anything reads as zero bytes.
        client.shutdown(std::net::Shutdown::Write).unwrap();
        handle.join().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn idle_timeout_closes_active_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut client, handle) = spawn_handler(&registry, short_limits());
        client.write_all(b"sleepy").unwrap();
        let _connected = recv(&mut client);
        let _users = recv(&mut client);

        // Say nothing; the 500ms idle timeout ends the session.
        handle.join().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn stalled_partial_frame_closes_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut client, handle) = spawn_handler(&registry, short_limits());
        client.write_all(b"staller").unwrap();
        let _connected = recv(&mut client);
        let _users = recv(&mut client);

        // Announce 10 bytes, send 2, then stall past the 200ms body timeout.
        client.write_all(&10u32.to_le_bytes()).unwrap();
        client.write_all(b"CH").unwrap();
        handle.join().unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn ping_gets_pong_only_for_sender() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut client, handle) = spawn_handler(&registry, ControlLimits::default());
        client.write_all(b"pinger").unwrap();
        let _connected = recv(&mut client);
        let _users = recv(&mut client);

        write_message(&mut client, b"PING").unwrap();
        assert_eq!(recv(&mut client), ServerMessage::Pong);

        drop(client);
        handle.join().unwrap();
    }

    #[test]
    fn chat_goes_to_everyone_but_the_sender() {
        let registry = SessionRegistry::new();
        let (mut alice_client, alice_link) = test_link();
        let (mut bob_client, bob_link) = test_link();
        let (mut carol_client, carol_link) = test_link();
        let alice = registry.register("alice", alice_link);
        registry.register("bob", bob_link);
        registry.register("carol", carol_link);

        let dispatch = process_message(&registry, &alice, b"CHAT:hi all");
        assert_eq!(
            dispatch,
            Dispatch::Chat(FanOutReport {
                delivered: 2,
                failed: 0
            })
        );
        let expected = ServerMessage::Chat {
            from: "alice".into(),
            text: "hi all".into(),
        };
        assert_eq!(recv(&mut bob_client), expected);
        assert_eq!(recv(&mut carol_client), expected);
        assert_eq!(registry.traffic().snapshot().chat_messages, 1);

        alice_client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        assert!(read_message(&mut alice_client).is_err());
    }

    #[test]
    fn file_meta_is_relayed_with_sender_name() {
        let registry = SessionRegistry::new();
        let (_a, alice_link) = test_link();
        let (mut bob_client, bob_link) = test_link();
        let alice = registry.register("alice", alice_link);
        registry.register("bob", bob_link);

        let json = r#"{"filename":"report.pdf","size":1024}"#;
        let frame = format!("FILE_META:{json}");
        process_message(&registry, &alice, frame.as_bytes());
        assert_eq!(
            recv(&mut bob_client),
            ServerMessage::FileMeta {
                from: "alice".into(),
                json: json.into()
            }
        );
    }

    #[test]
    fn control_sets_flag_and_sends_status_delta() {
        let registry = SessionRegistry::new();
        let (_a, alice_link) = test_link();
        let (mut bob_client, bob_link) = test_link();
        let alice = registry.register("alice", alice_link);
        registry.register("bob", bob_link);

        let dispatch = process_message(&registry, &alice, b"CONTROL:VIDEO_ON");
        assert!(matches!(dispatch, Dispatch::Status(r) if r.delivered == 1));

        let mut expected = UserStatus::new("alice");
        expected.set_flag(Capability::Video, true);
        assert_eq!(recv(&mut bob_client), ServerMessage::Status(expected));

        // Bob's flags are untouched.
        assert_eq!(registry.snapshot()[1], UserStatus::new("bob"));
    }

    #[test]
    fn noise_is_ignored() {
        let registry = SessionRegistry::new();
        let (_a, alice_link) = test_link();
        let alice = registry.register("alice", alice_link);

        assert_eq!(process_message(&registry, &alice, b"HELLO"), Dispatch::Ignored);
        assert_eq!(
            process_message(&registry, &alice, b"CONTROL:MUTE"),
            Dispatch::Ignored
        );
        assert_eq!(
            process_message(&registry, &alice, &[0xFF, 0xFE]),
            Dispatch::Ignored
        );
        assert_eq!(
            process_message(&registry, &SessionId::from("ghost"), b"CHAT:boo"),
            Dispatch::Ignored
        );
        assert_eq!(registry.snapshot(), vec![UserStatus::new("alice")]);
    }

    #[test]
    fn close_after_eviction_does_not_rebroadcast() {
        let registry = SessionRegistry::new();
        let (_a, alice_link) = test_link();
        let (mut bob_client, bob_link) = test_link();
        let alice = registry.register("alice", Arc::clone(&alice_link));
        registry.register("bob", bob_link);

        // Someone else (the sweeper) already removed alice.
        registry.remove(&alice);
        close_session(&registry, &alice, &alice_link, &RelayError::FrameTimeout);

        bob_client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        assert!(read_message(&mut bob_client).is_err());
    }

    #[test]
    fn close_rebroadcasts_to_remaining() {
        let registry = SessionRegistry::new();
        let (_a, alice_link) = test_link();
        let (mut bob_client, bob_link) = test_link();
        let alice = registry.register("alice", Arc::clone(&alice_link));
        registry.register("bob", bob_link);

        close_session(&registry, &alice, &alice_link, &RelayError::FrameTimeout);
        assert_eq!(
            recv(&mut bob_client),
            ServerMessage::Users(vec![UserStatus::new("bob")])
        );
    }

    #[test]
    fn greeting_precedes_concurrent_chat() {
        let registry = Arc::new(SessionRegistry::new());
        let (_alice_client, alice_link) = test_link();
        let alice = registry.register("alice", alice_link);

        // Alice chats nonstop while newcomers join.
        let stop = Arc::new(AtomicBool::new(false));
        let chatter = {
            let registry = Arc::clone(&registry);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    process_message(&registry, &alice, b"CHAT:anyone there?");
                }
            })
        };

        for _ in 0..40 {
            let (mut client, link) = test_link();
            let session = open_session(&registry, "newcomer", &link).unwrap();
            match recv(&mut client) {
                ServerMessage::Connected { session_id, name } => {
                    assert_eq!(&session_id, session.id());
                    assert_eq!(name, "newcomer");
                }
                other => panic!("first frame was {other:?}, not CONNECTED"),
            }
            session.close(&RelayError::FrameTimeout);
        }

        stop.store(true, Ordering::SeqCst);
        chatter.join().unwrap();
    }

    #[test]
    fn unwinding_handler_still_deregisters() {
        let registry = SessionRegistry::new();
        let (mut bob_client, bob_link) = test_link();
        registry.register("bob", bob_link);
        let (_client, link) = test_link();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let session = open_session(&registry, "doomed", &link).unwrap();
            assert!(registry.contains(session.id()));
            panic!("handler blew up");
        }));

        assert!(result.is_err());
        assert_eq!(registry.snapshot(), vec![UserStatus::new("bob")]);
        assert_eq!(
            recv(&mut bob_client),
            ServerMessage::Users(vec![UserStatus::new("bob")])
        );
    }

    #[test]
    fn failed_greeting_leaves_nothing_registered() {
        let registry = SessionRegistry::new();
        let (_client, link) = test_link();
        link.close();

        assert!(open_session(&registry, "gone", &link).is_err());
        assert!(registry.is_empty());
        assert_eq!(registry.id_for_name("gone"), None);
    }
}
