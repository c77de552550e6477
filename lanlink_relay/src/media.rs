// Media router: the relay's single UDP endpoint.
//
// One thread runs `MediaRouter::run`, receiving datagrams on the shared socket
// and passing each through `route`:
//
// 1. Decode `[type][tag_len][tag][payload]`. Malformed datagrams (too short,
//    tag overrunning the buffer, non-UTF-8 tag) are dropped without a reply.
// 2. If the tag is a live session id, remember the datagram's source as that
//    session's media address. This is the only way the relay learns where to
//    send media; there is no registration step and the newest source wins.
// 3. Re-stamp the packet with the sender's display name and send it to every
//    other session whose media address is known. Routed datagrams are
//    counted in the registry's traffic stats.
//
// Tags that match no session are still forwarded, labelled `Unknown`, to
// every session with a known address. A peer that starts streaming before its
// handshake completes is heard this way instead of silently dropped.
//
// A failed `send_to` for one recipient is counted and logged at debug level;
// the loop carries on with the next recipient and the next datagram.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lanlink_protocol::{MAX_DATAGRAM_SIZE, MediaPacket, PacketError, SessionId};
use tracing::{debug, info, trace};

use crate::error::RelayError;
use crate::registry::SessionRegistry;
use crate::socket;

/// Sender label used when a packet's tag matches no live session.
pub const UNKNOWN_SENDER: &str = "Unknown";

/// How often the receive loop wakes up to check for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What happened to one inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Forwarded {
        sender: String,
        known_sender: bool,
        delivered: usize,
        failed: usize,
    },
    Dropped(PacketError),
}

pub struct MediaRouter {
    socket: UdpSocket,
    registry: Arc<SessionRegistry>,
}

impl MediaRouter {
    /// Bind the shared media socket. `buffer_bytes` sizes the kernel send and
    /// receive buffers (0 leaves the OS defaults).
    pub fn bind(
        addr: impl ToSocketAddrs,
        registry: Arc<SessionRegistry>,
        buffer_bytes: usize,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket::apply_buffer_size(&socket, buffer_bytes);
        Ok(Self { socket, registry })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Route one datagram received from `from`.
    pub fn route(&self, datagram: &[u8], from: SocketAddr) -> RouteOutcome {
        let packet = match MediaPacket::decode(datagram) {
            Ok(packet) => packet,
            Err(source) => {
                let err = RelayError::MalformedPacket {
                    from,
                    source: source.clone(),
                };
                trace!(error = %err, "dropping media packet");
                return RouteOutcome::Dropped(source);
            }
        };

        let tag = SessionId::from(packet.tag);
        let learned = self.registry.update_media_address(&tag, from);
        let known_sender = learned.is_some();
        let sender = learned.unwrap_or_else(|| UNKNOWN_SENDER.to_owned());
        let except = if known_sender { Some(&tag) } else { None };
        let targets = self.registry.media_targets_except(except);

        let outbound = match packet.with_tag(&sender).encode() {
            Ok(bytes) => bytes,
            Err(e) => return RouteOutcome::Dropped(e),
        };

        self.registry.traffic().record_media(datagram.len());
        let mut delivered = 0;
        let mut failed = 0;
        for target in targets {
            match self.socket.send_to(&outbound, target) {
                Ok(_) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    debug!(%target, error = %e, "media send failed");
                }
            }
        }

        RouteOutcome::Forwarded {
            sender,
            known_sender,
            delivered,
            failed,
        }
    }

    /// Receive and route datagrams until `keep_running` goes false.
    pub fn run(&self, keep_running: &AtomicBool) {
        if let Err(e) = self.socket.set_read_timeout(Some(POLL_INTERVAL)) {
            tracing::error!(error = %e, "cannot set media socket timeout; router not started");
            return;
        }
        info!(addr = ?self.socket.local_addr().ok(), "media router started");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        while keep_running.load(Ordering::SeqCst) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    self.route(&buf[..n], from);
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) => {}
                Err(e) => {
                    // ICMP port-unreachable from an earlier send surfaces here on
                    // some platforms; it says nothing about this socket.
                    debug!(error = %e, "media receive error");
                }
            }
        }
        info!("media router stopped");
    }
}
