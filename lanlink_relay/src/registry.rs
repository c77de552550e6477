// Session registry: the relay's single source of truth about connected peers.
//
// `SessionRegistry` is shared (`Arc`) between the listener's per-connection
// handler threads, the media router thread, and the liveness sweeper. All of
// its tables live behind one `parking_lot::Mutex`, so every operation below is
// atomic with respect to every other:
// - `sessions`: id → `Session` (display name + flags, write link, media
//   address, liveness timestamp, join serial).
// - `by_name`: display name → id convenience index. Names are not unique;
//   the most recent registration for a name wins, and removal only clears the
//   entry if it still points at the removed session.
// - `room`: membership of the single `main` room.
// A session is in all three or in none of them.
//
// The registry never performs network I/O while holding the lock. Callers that
// need to send (presence, chat fan-out, media) take a snapshot of recipients
// (`recipients_except`, `presence_view`, `media_targets_except`) and send after
// the lock is released.
//
// `media_address` is a derived cache learned from inbound UDP traffic
// (last writer wins), not part of a session's identity. It starts out `None`
// and the media router skips sessions without one.
//
// `ControlLink` is the write half of a session's reliable channel. Its writer
// lock keeps concurrent broadcasts from interleaving frames on one stream, and
// `close()` shuts the socket down so the handler thread's blocked read returns.
// The handshake holds that lock across `register` until `CONNECTED` is
// written, so a session is never visible to fan-out before its greeting.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lanlink_protocol::framing::write_message;
use lanlink_protocol::{Capability, SessionId, UserStatus};
use parking_lot::{Mutex, MutexGuard};

use crate::stats::TrafficStats;

/// Write half of one peer's reliable channel.
pub struct ControlLink {
    writer: Mutex<TcpStream>,
    closer: TcpStream,
    peer: Option<SocketAddr>,
}

impl ControlLink {
    /// Wrap a connected stream. `write_timeout` bounds how long one stalled
    /// peer can hold up a fan-out thread.
    pub fn new(stream: TcpStream, write_timeout: Option<Duration>) -> io::Result<Self> {
        stream.set_write_timeout(write_timeout)?;
        let closer = stream.try_clone()?;
        let peer = stream.peer_addr().ok();
        Ok(Self {
            writer: Mutex::new(stream),
            closer,
            peer,
        })
    }

    /// Send one framed text message.
    pub fn send_text(&self, text: &str) -> io::Result<()> {
        self.hold().send_text(text)
    }

    /// Take the writer lock. Other senders block until the guard drops, so
    /// whatever is written through it goes out ahead of their frames.
    pub fn hold(&self) -> LinkWriter<'_> {
        LinkWriter(self.writer.lock())
    }

    /// Shut the connection down in both directions. Idempotent.
    pub fn close(&self) {
        let _ = self.closer.shutdown(Shutdown::Both);
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Exclusive access to a link's write half.
pub struct LinkWriter<'a>(MutexGuard<'a, TcpStream>);

impl LinkWriter<'_> {
    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        write_message(&mut *self.0, text.as_bytes())
    }
}

/// Server-side record of one connected peer.
pub struct Session {
    pub id: SessionId,
    /// Display name and capability flags, in wire shape.
    pub status: UserStatus,
    pub link: Arc<ControlLink>,
    pub media_address: Option<SocketAddr>,
    pub last_seen: Instant,
    serial: u64,
}

impl Session {
    pub fn display_name(&self) -> &str {
        &self.status.username
    }
}

/// A fan-out target captured from the registry.
#[derive(Clone)]
pub struct Recipient {
    pub id: SessionId,
    pub name: String,
    pub link: Arc<ControlLink>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, Session>,
    by_name: HashMap<String, SessionId>,
    room: BTreeSet<SessionId>,
    next_serial: u64,
}

impl Tables {
    fn recipients_except(&self, except: Option<&SessionId>) -> Vec<Recipient> {
        let mut sessions: Vec<&Session> = self
            .sessions
            .values()
            .filter(|s| Some(&s.id) != except)
            .collect();
        sessions.sort_by_key(|s| s.serial);
        sessions
            .into_iter()
            .map(|s| Recipient {
                id: s.id.clone(),
                name: s.status.username.clone(),
                link: Arc::clone(&s.link),
            })
            .collect()
    }

    fn snapshot(&self) -> Vec<UserStatus> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.serial);
        sessions.into_iter().map(|s| s.status.clone()).collect()
    }
}

/// Thread-safe table of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Tables>,
    traffic: TrafficStats,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its id. Duplicate display names are
    /// accepted; the name index then points at the newest session.
    pub fn register(&self, name: &str, link: Arc<ControlLink>) -> SessionId {
        let mut tables = self.inner.lock();
        let serial = tables.next_serial;
        tables.next_serial += 1;

        let id = SessionId(format!(
            "{}_{}_{serial}",
            name.replace(':', "_"),
            unix_millis()
        ));
        tables.sessions.insert(
            id.clone(),
            Session {
                id: id.clone(),
                status: UserStatus::new(name),
                link,
                media_address: None,
                last_seen: Instant::now(),
                serial,
            },
        );
        tables.by_name.insert(name.to_owned(), id.clone());
        tables.room.insert(id.clone());
        id
    }

    /// Remove a session from every index. Returns `None` if it was already
    /// gone, so racing removals deregister exactly once.
    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        let mut tables = self.inner.lock();
        let session = tables.sessions.remove(id)?;
        if tables.by_name.get(session.display_name()) == Some(id) {
            tables.by_name.remove(session.display_name());
        }
        tables.room.remove(id);
        Some(session)
    }

    /// Record inbound reliable-channel traffic. Returns false for unknown ids.
    pub fn touch(&self, id: &SessionId) -> bool {
        let mut tables = self.inner.lock();
        match tables.sessions.get_mut(id) {
            Some(session) => {
                session.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Learn a session's media address from an inbound packet. Returns the
    /// session's display name if the id is live.
    pub fn update_media_address(&self, id: &SessionId, addr: SocketAddr) -> Option<String> {
        let mut tables = self.inner.lock();
        let session = tables.sessions.get_mut(id)?;
        session.media_address = Some(addr);
        Some(session.status.username.clone())
    }

    /// Set one capability flag and return the session's updated status.
    pub fn set_capability(
        &self,
        id: &SessionId,
        capability: Capability,
        value: bool,
    ) -> Option<UserStatus> {
        let mut tables = self.inner.lock();
        let session = tables.sessions.get_mut(id)?;
        session.status.set_flag(capability, value);
        Some(session.status.clone())
    }

    /// Point-in-time presence list, in join order.
    pub fn snapshot(&self) -> Vec<UserStatus> {
        self.inner.lock().snapshot()
    }

    /// Presence list plus every session's link, taken under one lock so the
    /// list matches the set of recipients it is sent to.
    pub fn presence_view(&self) -> (Vec<UserStatus>, Vec<Recipient>) {
        let tables = self.inner.lock();
        (tables.snapshot(), tables.recipients_except(None))
    }

    /// All sessions except `except`, captured under the lock.
    pub fn recipients_except(&self, except: Option<&SessionId>) -> Vec<Recipient> {
        self.inner.lock().recipients_except(except)
    }

    /// Call `f` for every session except `except`. The recipient list is
    /// captured first and `f` runs after the lock is released, so `f` may do
    /// I/O or call back into the registry.
    pub fn for_each_except(&self, except: Option<&SessionId>, mut f: impl FnMut(&Recipient)) {
        let recipients = self.recipients_except(except);
        for recipient in &recipients {
            f(recipient);
        }
    }

    /// Known media addresses of every session except `except`.
    pub fn media_targets_except(&self, except: Option<&SessionId>) -> Vec<SocketAddr> {
        let tables = self.inner.lock();
        tables
            .sessions
            .values()
            .filter(|s| Some(&s.id) != except)
            .filter_map(|s| s.media_address)
            .collect()
    }

    /// Ids of sessions silent for longer than `threshold` as of `now`.
    pub fn stale_sessions(&self, now: Instant, threshold: Duration) -> Vec<SessionId> {
        let tables = self.inner.lock();
        tables
            .sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_seen) > threshold)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Remove every session, returning their links. Used on shutdown.
    pub fn drain(&self) -> Vec<Arc<ControlLink>> {
        let mut tables = self.inner.lock();
        tables.by_name.clear();
        tables.room.clear();
        tables
            .sessions
            .drain()
            .map(|(_, session)| session.link)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().sessions.is_empty()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().sessions.contains_key(id)
    }

    pub fn display_name(&self, id: &SessionId) -> Option<String> {
        let tables = self.inner.lock();
        tables.sessions.get(id).map(|s| s.status.username.clone())
    }

    pub fn id_for_name(&self, name: &str) -> Option<SessionId> {
        self.inner.lock().by_name.get(name).cloned()
    }

    pub fn link(&self, id: &SessionId) -> Option<Arc<ControlLink>> {
        let tables = self.inner.lock();
        tables.sessions.get(id).map(|s| Arc::clone(&s.link))
    }

    pub fn media_address(&self, id: &SessionId) -> Option<SocketAddr> {
        let tables = self.inner.lock();
        tables.sessions.get(id).and_then(|s| s.media_address)
    }

    /// Relay-wide traffic counters. Not guarded by the table lock.
    pub fn traffic(&self) -> &TrafficStats {
        &self.traffic
    }

    /// Members of the `main` room.
    pub fn room_members(&self) -> Vec<SessionId> {
        self.inner.lock().room.iter().cloned().collect()
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
