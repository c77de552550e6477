// Relay bootstrap: binds both endpoints and starts the long-running threads.
//
// Architecture: thread-per-connection over a shared `SessionRegistry`.
//
// - **Listener thread** (`TcpListener::accept()` loop, non-blocking so it can
//   check `keep_running`): spawns one handler thread per accepted connection.
// - **Handler threads** (one per peer, see `control.rs`): handshake, read
//   frames, dispatch. Writes to other peers go through their `ControlLink`s.
// - **Media thread** (`media.rs`): receives and re-stamps UDP datagrams.
// - **Sweeper thread** (`sweeper.rs`): evicts silent sessions periodically.
//
// There is no central event loop; all shared state lives behind the
// registry's lock. This keeps a slow peer from holding up anyone but itself.
//
// Shutdown: `RelayHandle::stop` clears `keep_running`, removes every session
// from the registry and shuts its socket down (which unblocks the handler
// threads' reads), then joins the listener, media, and sweeper threads.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::control::{self, ControlLimits};
use crate::media::MediaRouter;
use crate::registry::SessionRegistry;
use crate::stats::TrafficSnapshot;
use crate::sweeper;

/// How long the listener sleeps when no connection is pending.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration for starting a relay.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Interface to bind both endpoints on.
    pub bind_host: String,
    /// Reliable-channel port. 0 lets the OS pick.
    pub control_port: u16,
    /// Media-channel port. 0 lets the OS pick.
    pub media_port: u16,
    /// Requested kernel buffer size for the media socket.
    pub socket_buffer_bytes: usize,
    pub limits: ControlLimits,
    pub sweep_interval: Duration,
    /// Sessions silent for longer than this are evicted.
    pub stale_after: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".into(),
            control_port: 9000,
            media_port: 9001,
            socket_buffer_bytes: 4 * 1024 * 1024,
            limits: ControlLimits::default(),
            sweep_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Addresses the relay actually bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayAddrs {
    pub control: SocketAddr,
    pub media: SocketAddr,
}

/// Handle returned by `start_relay` to control the running relay.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    registry: Arc<SessionRegistry>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl RelayHandle {
    /// The live session table. Exposed for embedding and tests.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Traffic relayed so far.
    pub fn traffic(&self) -> TrafficSnapshot {
        self.registry.traffic().snapshot()
    }

    /// Signal every thread to stop, drop all sessions, and wait for the
    /// background threads to exit.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        let links = self.registry.drain();
        let traffic = self.registry.traffic().snapshot();
        info!(
            sessions = links.len(),
            chat_messages = traffic.chat_messages,
            media_packets = traffic.media_packets,
            media_bytes = traffic.media_bytes,
            "relay stopping"
        );
        for link in links {
            link.close();
        }
        for handle in self.threads {
            if handle.join().is_err() {
                warn!("relay thread panicked during shutdown");
            }
        }
    }
}

/// Bind both endpoints and start the relay's threads. Returns a handle for
/// stopping it and the bound addresses (useful when port 0 is used).
pub fn start_relay(config: RelayConfig) -> io::Result<(RelayHandle, RelayAddrs)> {
    let registry = Arc::new(SessionRegistry::new());

    let listener = TcpListener::bind((config.bind_host.as_str(), config.control_port))?;
    listener.set_nonblocking(true)?;
    let router = MediaRouter::bind(
        (config.bind_host.as_str(), config.media_port),
        Arc::clone(&registry),
        config.socket_buffer_bytes,
    )?;
    let addrs = RelayAddrs {
        control: listener.local_addr()?,
        media: router.local_addr()?,
    };
    info!(control = %addrs.control, media = %addrs.media, "relay listening");

    let keep_running = Arc::new(AtomicBool::new(true));
    let mut threads = Vec::with_capacity(3);

    {
        let keep_running = Arc::clone(&keep_running);
        let registry = Arc::clone(&registry);
        let limits = config.limits.clone();
        threads.push(
            thread::Builder::new()
                .name("relay-listener".into())
                .spawn(move || accept_loop(listener, registry, limits, &keep_running))?,
        );
    }
    {
        let keep_running = Arc::clone(&keep_running);
        threads.push(
            thread::Builder::new()
                .name("relay-media".into())
                .spawn(move || router.run(&keep_running))?,
        );
    }
    {
        let keep_running = Arc::clone(&keep_running);
        let registry = Arc::clone(&registry);
        let (interval, stale_after) = (config.sweep_interval, config.stale_after);
        threads.push(
            thread::Builder::new()
                .name("relay-sweeper".into())
                .spawn(move || {
                    sweeper::run_sweeper(&registry, interval, stale_after, &keep_running)
                })?,
        );
    }

    Ok((
        RelayHandle {
            keep_running,
            registry,
            threads,
        },
        addrs,
    ))
}

/// Accept connections until `keep_running` goes false, one handler thread
/// each.
fn accept_loop(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    limits: ControlLimits,
    keep_running: &AtomicBool,
) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(%peer, error = %e, "dropping connection");
                    continue;
                }
                debug!(%peer, "accepted connection");
                let registry = Arc::clone(&registry);
                let limits = limits.clone();
                let spawned = thread::Builder::new()
                    .name(format!("relay-conn-{peer}"))
                    .spawn(move || control::handle_connection(stream, registry, &limits));
                if let Err(e) = spawned {
                    error!(%peer, error = %e, "failed to spawn connection handler");
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!(error = %e, "accept failed; listener stopping");
                break;
            }
        }
    }
    debug!("listener stopped");
}
