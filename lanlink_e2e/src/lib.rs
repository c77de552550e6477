// Test-only peer for end-to-end relay tests.
//
// Wraps the real `NetClient` and `MediaTransceiver` (from `lanlink_relay`)
// behind a synchronous, test-friendly API: connect, send, and then block until
// a matching control event or media delivery shows up. Media deliveries are
// captured by a recording `MediaSink`.
//
// The only test-specific code here is the blocking polling wrappers. All
// networking goes through the same code paths a real peer uses.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lanlink_protocol::{Capability, MediaKind, ServerMessage, SessionId, UserStatus};
use lanlink_relay::server::{RelayAddrs, RelayConfig, RelayHandle, start_relay};
use lanlink_relay::{ClientConfig, MediaSink, MediaTransceiver, NetClient};
use parking_lot::Mutex;

/// Default timeout for blocking poll operations.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One media delivery as seen by a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub kind: MediaKind,
    pub sender: String,
    pub payload: Vec<u8>,
}

/// `MediaSink` that records every delivery.
#[derive(Default)]
pub struct RecordingSink {
    received: Mutex<Vec<Delivery>>,
}

impl RecordingSink {
    fn record(&self, kind: MediaKind, sender: &str, payload: &[u8]) {
        self.received.lock().push(Delivery {
            kind,
            sender: sender.to_owned(),
            payload: payload.to_vec(),
        });
    }

    pub fn take(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.received.lock())
    }
}

impl MediaSink for RecordingSink {
    fn on_video(&self, sender: &str, payload: &[u8]) {
        self.record(MediaKind::Video, sender, payload);
    }

    fn on_audio(&self, sender: &str, payload: &[u8]) {
        self.record(MediaKind::Audio, sender, payload);
    }

    fn on_screen(&self, sender: &str, payload: &[u8]) {
        self.record(MediaKind::Screen, sender, payload);
    }
}

/// Start a relay on loopback with OS-assigned ports.
pub fn start_local_relay() -> (RelayHandle, RelayAddrs) {
    let config = RelayConfig {
        bind_host: "127.0.0.1".into(),
        control_port: 0,
        media_port: 0,
        socket_buffer_bytes: 0,
        ..RelayConfig::default()
    };
    start_relay(config).expect("relay failed to start")
}

/// A test peer wrapping a real `NetClient` and its media channel.
pub struct TestPeer {
    client: NetClient,
    media: Arc<MediaTransceiver>,
    sink: Arc<RecordingSink>,
}

impl TestPeer {
    /// Connect, open media, and start receiving.
    pub fn connect(addrs: RelayAddrs, name: &str) -> Self {
        let config = ClientConfig {
            socket_buffer_bytes: 0,
            ..ClientConfig::for_relay(addrs.control, addrs.media)
        };
        let mut client = NetClient::connect(config, name).expect("TestPeer::connect failed");
        let media = client.open_media().expect("open_media failed");
        let sink = Arc::new(RecordingSink::default());
        media
            .start_receiving(Arc::clone(&sink) as Arc<dyn MediaSink>)
            .expect("start_receiving failed");
        Self {
            client,
            media,
            sink,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.client.session().session_id
    }

    pub fn name(&self) -> &str {
        &self.client.session().name
    }

    pub fn chat(&self, text: &str) {
        self.client.send_chat(text).expect("send_chat failed");
    }

    pub fn file_meta(&self, json: &str) {
        self.client
            .send_file_meta(json)
            .expect("send_file_meta failed");
    }

    pub fn toggle(&self, capability: Capability, on: bool) {
        self.client
            .send_control(capability, on)
            .expect("send_control failed");
    }

    pub fn ping(&self) {
        self.client.ping().expect("ping failed");
    }

    pub fn send_media(&self, kind: MediaKind, payload: &[u8]) {
        self.media.send(kind, payload).expect("media send failed");
    }

    /// Drain queued control events without blocking.
    pub fn poll_raw(&self) -> Vec<ServerMessage> {
        self.client.poll()
    }

    /// Block until an event satisfies `pred`, discarding the others.
    pub fn wait_for(&self, what: &str, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        let start = Instant::now();
        loop {
            assert!(start.elapsed() < POLL_TIMEOUT, "timed out waiting for {what}");
            match self.client.recv_timeout(POLL_INTERVAL) {
                Ok(event) if pred(&event) => return event,
                _ => {}
            }
        }
    }

    /// Block until the user list has exactly `names`, in join order.
    pub fn wait_for_users(&self, names: &[&str]) -> Vec<UserStatus> {
        let event = self.wait_for("user list", |event| match event {
            ServerMessage::Users(users) => users
                .iter()
                .map(|u| u.username.as_str())
                .eq(names.iter().copied()),
            _ => false,
        });
        match event {
            ServerMessage::Users(users) => users,
            _ => unreachable!(),
        }
    }

    /// Collect non-presence events for `window`. Used to assert that
    /// something did NOT arrive.
    pub fn quiet_for(&self, window: Duration) -> Vec<ServerMessage> {
        thread::sleep(window);
        self.client
            .poll()
            .into_iter()
            .filter(|event| !matches!(event, ServerMessage::Users(_)))
            .collect()
    }

    /// Block until at least `n` media deliveries have arrived.
    pub fn wait_for_media(&self, n: usize) -> Vec<Delivery> {
        let start = Instant::now();
        let mut got = Vec::new();
        while got.len() < n {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "timed out waiting for media ({} of {n})",
                got.len()
            );
            got.extend(self.sink.take());
            thread::sleep(POLL_INTERVAL);
        }
        got
    }

    /// Media deliveries within `window`.
    pub fn media_for(&self, window: Duration) -> Vec<Delivery> {
        thread::sleep(window);
        self.sink.take()
    }

    /// Discard media received so far, after letting in-flight datagrams land.
    pub fn clear_media(&self) {
        thread::sleep(Duration::from_millis(100));
        self.sink.take();
    }

    /// Send empty audio packets until the relay has learned this peer's
    /// media address. Other peers receive those packets; call `clear_media`
    /// on them before asserting on deliveries.
    pub fn announce_media(&self, relay: &RelayHandle) {
        let start = Instant::now();
        while relay.registry().media_address(self.id()).is_none() {
            assert!(start.elapsed() < POLL_TIMEOUT, "media address never learned");
            self.send_media(MediaKind::Audio, &[]);
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }
}
