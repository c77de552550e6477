// Client-side media channel.
//
// A `MediaTransceiver` owns one UDP socket per client. Outbound payloads are
// wrapped as `[type][tag_len][session id][payload]` and sent to the relay's
// media port. The first packet sent is also what teaches the relay this
// client's media address, so a client that only wants to receive should send
// something (an empty audio packet will do) before expecting inbound media.
//
// Inbound datagrams carry the sender's display name as the tag. The receive
// loop runs on its own thread, decodes the header, and hands the payload to a
// `MediaSink` by type. Payloads are never decoded here. Malformed datagrams
// and unknown type bytes are dropped.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lanlink_protocol::{MAX_DATAGRAM_SIZE, MediaKind, MediaPacket, SessionId, encode_packet};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::ClientError;
use crate::socket;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Receives demultiplexed media. Implementations must be cheap or hand off
/// to another thread; they run on the receive loop.
pub trait MediaSink: Send + Sync {
    fn on_video(&self, _sender: &str, _payload: &[u8]) {}
    fn on_audio(&self, _sender: &str, _payload: &[u8]) {}
    fn on_screen(&self, _sender: &str, _payload: &[u8]) {}
}

/// Route one inbound datagram to `sink`. Returns the kind delivered, or
/// `None` if the datagram was dropped.
pub fn dispatch(datagram: &[u8], sink: &dyn MediaSink) -> Option<MediaKind> {
    let packet = match MediaPacket::decode(datagram) {
        Ok(packet) => packet,
        Err(e) => {
            trace!(error = %e, "dropping inbound media packet");
            return None;
        }
    };
    let kind = packet.media_kind()?;
    match kind {
        MediaKind::Video => sink.on_video(packet.tag, packet.payload),
        MediaKind::Audio => sink.on_audio(packet.tag, packet.payload),
        MediaKind::Screen => sink.on_screen(packet.tag, packet.payload),
    }
    Some(kind)
}

struct ReceiveLoop {
    keep_running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct MediaTransceiver {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    session_id: SessionId,
    receiver: Mutex<Option<ReceiveLoop>>,
}

impl MediaTransceiver {
    /// Bind an ephemeral socket of the same address family as `server`.
    pub fn open(
        server: impl ToSocketAddrs,
        session_id: SessionId,
        buffer_bytes: usize,
    ) -> Result<Self, ClientError> {
        let server = server
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no media address"))?;
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket::apply_buffer_size(&socket, buffer_bytes);
        Ok(Self {
            socket: Arc::new(socket),
            server,
            session_id,
            receiver: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one payload tagged with this client's session id.
    pub fn send(&self, kind: MediaKind, payload: &[u8]) -> Result<(), ClientError> {
        let datagram = encode_packet(kind.as_byte(), self.session_id.as_str(), payload)?;
        self.socket.send_to(&datagram, self.server)?;
        Ok(())
    }

    /// Start the receive loop. A second call while running is a no-op.
    pub fn start_receiving(&self, sink: Arc<dyn MediaSink>) -> Result<(), ClientError> {
        let mut slot = self.receiver.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let keep_running = Arc::new(AtomicBool::new(true));
        let socket = Arc::clone(&self.socket);
        let flag = Arc::clone(&keep_running);
        let thread = thread::Builder::new()
            .name("lanlink-media-rx".into())
            .spawn(move || receive_loop(&socket, &*sink, &flag))?;
        *slot = Some(ReceiveLoop {
            keep_running,
            thread,
        });
        Ok(())
    }

    pub fn is_receiving(&self) -> bool {
        self.receiver.lock().is_some()
    }

    /// Stop the receive loop and wait for it. Idempotent.
    pub fn stop(&self) {
        let Some(running) = self.receiver.lock().take() else {
            return;
        };
        running.keep_running.store(false, Ordering::SeqCst);
        if running.thread.join().is_err() {
            debug!("media receive thread panicked");
        }
    }
}

impl Drop for MediaTransceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn receive_loop(socket: &UdpSocket, sink: &dyn MediaSink, keep_running: &AtomicBool) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    while keep_running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((n, _from)) => {
                dispatch(&buf[..n], sink);
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) => {}
            Err(e) => debug!(error = %e, "media receive error"),
        }
    }
}
