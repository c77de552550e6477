// TCP client for connecting to the relay.
//
// The mirror of `control.rs`, used by peers (and by the end-to-end tests).
// Architecture:
// - `Connector::connect()` performs the TCP connect and the display-name
//   handshake on the calling thread, bounded by `connect_timeout`, then
//   spawns a background reader thread.
// - The reader thread calls `read_message()` in a loop, parses each frame
//   into a `ServerEvent`, and pushes it into an `mpsc` channel. Frames that do
//   not parse are skipped; EOF or a read error ends the thread and flips
//   `is_connected()` to false.
// - Sends go through `ControlSender`, a locked write half, so the client can
//   be shared across threads.
// - `poll()` drains the inbox non-blocking; `recv_timeout()` waits for one.
//
// Media is separate: `open_media()` binds a `MediaTransceiver` tagged with
// this session's id. `disconnect()` stops it and shuts the control stream.

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lanlink_protocol::framing::{read_message, write_message};
use lanlink_protocol::{Capability, ClientMessage, ServerMessage, SessionId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::transceiver::MediaTransceiver;

/// Typed events delivered by the receiver.
pub type ServerEvent = ServerMessage;

/// Where and how to reach the relay.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_host: String,
    pub control_port: u16,
    pub media_port: u16,
    /// Bounds TCP connect and the wait for `CONNECTED`.
    pub connect_timeout: Duration,
    pub socket_buffer_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".into(),
            control_port: 9000,
            media_port: 9001,
            connect_timeout: Duration::from_secs(10),
            socket_buffer_bytes: 4 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Config pointing at a relay's bound addresses.
    pub fn for_relay(control: SocketAddr, media: SocketAddr) -> Self {
        Self {
            server_host: control.ip().to_string(),
            control_port: control.port(),
            media_port: media.port(),
            ..Self::default()
        }
    }
}

/// Identity assigned by the relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub name: String,
}

/// Performs the handshake.
pub struct Connector {
    config: ClientConfig,
}

impl Connector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect, send `name`, and wait for `CONNECTED`. On any failure the
    /// socket is dropped.
    pub fn connect(&self, name: &str) -> Result<NetClient, ClientError> {
        let deadline = Instant::now() + self.config.connect_timeout;
        let target = (self.config.server_host.as_str(), self.config.control_port);
        let mut stream = connect_before(target, deadline).map_err(|source| ClientError::Connect {
            addr: format!("{}:{}", target.0, target.1),
            source,
        })?;

        // The handshake is the only unframed write.
        stream.write_all(name.as_bytes())?;
        stream.flush()?;
        stream.set_read_timeout(Some(remaining(deadline)?))?;
        let reply = read_message(&mut stream).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::Timeout,
            io::ErrorKind::UnexpectedEof => {
                ClientError::Handshake("relay closed the connection".into())
            }
            _ => ClientError::Io(e),
        })?;

        let session = match ServerMessage::parse_bytes(&reply)? {
            ServerMessage::Connected { session_id, name } => SessionInfo { session_id, name },
            other => return Err(ClientError::Handshake(format!("unexpected reply: {other:?}"))),
        };
        stream.set_read_timeout(None)?;
        debug!(session = %session.session_id, "connected to relay");

        NetClient::start(stream, session, self.config.clone())
    }
}

/// Connect to the first address of `target` that answers before `deadline`.
fn connect_before(target: impl ToSocketAddrs, deadline: Instant) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in target.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, remaining(deadline)?) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host did not resolve")))
}

fn remaining(deadline: Instant) -> io::Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(io::Error::from(io::ErrorKind::TimedOut));
    }
    Ok(left)
}

/// Framed writes over the reliable channel.
pub struct ControlSender {
    writer: Mutex<TcpStream>,
}

impl ControlSender {
    fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let text = msg.encode();
        let mut writer = self.writer.lock();
        write_message(&mut *writer, text.as_bytes())?;
        Ok(())
    }

    pub fn send_chat(&self, text: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::Chat { text: text.into() })
    }

    /// `json` is passed through verbatim.
    pub fn send_file_meta(&self, json: &str) -> Result<(), ClientError> {
        self.send(&ClientMessage::FileMeta { json: json.into() })
    }

    pub fn send_control(&self, capability: Capability, on: bool) -> Result<(), ClientError> {
        self.send(&ClientMessage::Control { capability, on })
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ping)
    }
}

/// A connected peer.
pub struct NetClient {
    sender: ControlSender,
    shutdown: TcpStream,
    inbox: Receiver<ServerEvent>,
    connected: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
    session: SessionInfo,
    config: ClientConfig,
    media: Option<Arc<MediaTransceiver>>,
}

impl NetClient {
    /// Shorthand for `Connector::new(config).connect(name)`.
    pub fn connect(config: ClientConfig, name: &str) -> Result<Self, ClientError> {
        Connector::new(config).connect(name)
    }

    fn start(
        stream: TcpStream,
        session: SessionInfo,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let reader = stream.try_clone()?;
        let shutdown = stream.try_clone()?;
        let connected = Arc::new(AtomicBool::new(true));

        let (tx, rx) = mpsc::channel();
        let flag = Arc::clone(&connected);
        let reader_thread = thread::Builder::new()
            .name(format!("lanlink-control-rx-{}", session.name))
            .spawn(move || reader_loop(reader, tx, &flag))?;

        Ok(Self {
            sender: ControlSender {
                writer: Mutex::new(stream),
            },
            shutdown,
            inbox: rx,
            connected,
            reader_thread: Some(reader_thread),
            session,
            config,
            media: None,
        })
    }

    pub fn session(&self) -> &SessionInfo {
        &self.session
    }

    pub fn sender(&self) -> &ControlSender {
        &self.sender
    }

    pub fn send_chat(&self, text: &str) -> Result<(), ClientError> {
        self.sender.send_chat(text)
    }

    pub fn send_file_meta(&self, json: &str) -> Result<(), ClientError> {
        self.sender.send_file_meta(json)
    }

    pub fn send_control(&self, capability: Capability, on: bool) -> Result<(), ClientError> {
        self.sender.send_control(capability, on)
    }

    pub fn ping(&self) -> Result<(), ClientError> {
        self.sender.ping()
    }

    /// False once the reader has seen EOF or a read error.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Drain all queued server events (non-blocking).
    pub fn poll(&self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.inbox.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<ServerEvent, ClientError> {
        self.inbox.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => ClientError::Timeout,
            RecvTimeoutError::Disconnected => {
                ClientError::Io(io::Error::from(io::ErrorKind::NotConnected))
            }
        })
    }

    /// Bind this client's media socket, or return the one already open.
    pub fn open_media(&mut self) -> Result<Arc<MediaTransceiver>, ClientError> {
        if let Some(media) = &self.media {
            return Ok(Arc::clone(media));
        }
        let media = Arc::new(MediaTransceiver::open(
            (self.config.server_host.as_str(), self.config.media_port),
            self.session.session_id.clone(),
            self.config.socket_buffer_bytes,
        )?);
        self.media = Some(Arc::clone(&media));
        Ok(media)
    }

    /// Stop media and close the control connection. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(media) = self.media.take() {
            media.stop();
        }
        match self.shutdown.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => {
                warn!(error = %e, "control shutdown failed");
            }
            _ => {}
        }
        let panicked = self
            .reader_thread
            .take()
            .is_some_and(|handle| handle.join().is_err());
        if panicked {
            warn!("control reader thread panicked");
        }
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Reader thread: read framed messages in a loop, push to channel.
fn reader_loop(mut reader: TcpStream, tx: mpsc::Sender<ServerEvent>, connected: &AtomicBool) {
    loop {
        let bytes = match read_message(&mut reader) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "control reader stopped");
                break;
            }
        };
        match ServerMessage::parse_bytes(&bytes) {
            Ok(event) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => debug!(error = %e, "skipping undecodable frame"),
        }
    }
    connected.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::TcpListener;

    use lanlink_protocol::UserStatus;

    use super::*;

    /// A fake relay that accepts one connection and runs `script` on it.
    fn fake_relay(
        script: impl FnOnce(TcpStream) + Send + 'static,
    ) -> (ClientConfig, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            script(stream);
        });
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(2),
            socket_buffer_bytes: 0,
            ..ClientConfig::for_relay(addr, addr)
        };
        (config, handle)
    }

    fn read_name(stream: &mut TcpStream) -> String {
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[test]
    fn connect_parses_connected_reply() {
        let (config, relay) = fake_relay(|mut stream| {
            assert_eq!(read_name(&mut stream), "alice");
            write_message(&mut stream, b"CONNECTED:alice_1_0:alice").unwrap();
            write_message(&mut stream, b"USERS:[{\"username\":\"alice\",\"video\":false,\"audio\":false,\"screen\":false}]").unwrap();
            // Hold the socket until the client hangs up.
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink);
        });

        let mut client = NetClient::connect(config, "alice").unwrap();
        assert_eq!(
            client.session(),
            &SessionInfo {
                session_id: SessionId::from("alice_1_0"),
                name: "alice".into()
            }
        );
        assert_eq!(
            client.recv_timeout(Duration::from_secs(5)).unwrap(),
            ServerMessage::Users(vec![UserStatus::new("alice")])
        );
        client.disconnect();
        relay.join().unwrap();
    }

    #[test]
    fn wrong_reply_is_a_handshake_error() {
        let (config, relay) = fake_relay(|mut stream| {
            read_name(&mut stream);
            write_message(&mut stream, b"PONG").unwrap();
        });
        let err = NetClient::connect(config, "bob").err().unwrap();
        assert!(matches!(err, ClientError::Handshake(_)), "{err:?}");
        relay.join().unwrap();
    }

    #[test]
    fn closed_connection_is_a_handshake_error() {
        let (config, relay) = fake_relay(|mut stream| {
            read_name(&mut stream);
        });
        let err = NetClient::connect(config, "carol").err().unwrap();
        assert!(matches!(err, ClientError::Handshake(_)), "{err:?}");
        relay.join().unwrap();
    }

    #[test]
    fn silent_relay_times_out() {
        let (mut config, relay) = fake_relay(|mut stream| {
            read_name(&mut stream);
            thread::sleep(Duration::from_millis(800));
        });
        config.connect_timeout = Duration::from_millis(300);
        let err = NetClient::connect(config, "dave").err().unwrap();
        assert!(matches!(err, ClientError::Timeout), "{err:?}");
        relay.join().unwrap();
    }

    #[test]
    fn refused_connection_reports_address() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let config = ClientConfig {
            connect_timeout: Duration::from_secs(1),
            ..ClientConfig::for_relay(addr, addr)
        };
        let err = NetClient::connect(config, "erin").err().unwrap();
        assert!(matches!(err, ClientError::Connect { .. }), "{err:?}");
    }

    #[test]
    fn sender_frames_every_message() {
        let (config, relay) = fake_relay(|mut stream| {
            read_name(&mut stream);
            write_message(&mut stream, b"CONNECTED:frank_1_0:frank").unwrap();
            let mut got = Vec::new();
            for _ in 0..5 {
                got.push(String::from_utf8(read_message(&mut stream).unwrap()).unwrap());
            }
            assert_eq!(
                got,
                [
                    "CHAT:hi: there",
                    "FILE_META:{\"name\":\"a.txt\"}",
                    "CONTROL:AUDIO_ON",
                    "CONTROL:SCREEN_OFF",
                    "PING"
                ]
            );
            write_message(&mut stream, b"not a known message").unwrap();
            write_message(&mut stream, b"PONG").unwrap();
        });

        let client = NetClient::connect(config, "frank").unwrap();
        client.send_chat("hi: there").unwrap();
        client.send_file_meta("{\"name\":\"a.txt\"}").unwrap();
        client.send_control(Capability::Audio, true).unwrap();
        client.send_control(Capability::Screen, false).unwrap();
        client.ping().unwrap();

        // The unparseable frame is skipped.
        assert_eq!(
            client.recv_timeout(Duration::from_secs(5)).unwrap(),
            ServerMessage::Pong
        );
        relay.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!client.is_connected());
        assert!(client.poll().is_empty());
    }

    #[test]
    fn raw_handshake_is_unframed() {
        let (config, relay) = fake_relay(|mut stream| {
            let mut first = [0u8; 4];
            stream.read_exact(&mut first).unwrap();
            // "greg" as text, not a length prefix.
            assert_eq!(&first, b"greg");
        });
        let _ = NetClient::connect(config, "greg");
        relay.join().unwrap();
    }
}
