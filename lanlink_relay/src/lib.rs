// lanlink_relay — LAN chat and media relay, plus the client that talks to it.
//
// The relay is a thin broker. Peers open a TCP control connection, hand over
// a display name, and get back a session id. Chat, file metadata, capability
// toggles, and heartbeats then flow over that connection, while audio, video,
// and screen payloads go over UDP. The relay never looks inside media
// payloads; it only re-stamps each packet's sender tag from session id to
// display name and fans it out to the other peers.
//
// Module overview:
// - `registry.rs`:    `SessionRegistry`, the single source of truth for who
//                     is connected. Every other module goes through it.
// - `control.rs`:     Per-connection handshake and framed message loop, and
//                     `process_message` for chat/file-meta/control/ping.
// - `presence.rs`:    `USERS` and `STATUS` broadcasts and the concurrent,
//                     failure-isolating `fan_out` used for all TCP relaying.
// - `media.rs`:       `MediaRouter`, the UDP receive-restamp-forward loop.
// - `sweeper.rs`:     Evicts sessions that have gone quiet.
// - `server.rs`:      Binds both endpoints and starts the threads.
// - `client.rs`:      `Connector` and `NetClient`, the peer side of the
//                     control channel.
// - `transceiver.rs`: `MediaTransceiver` and `MediaSink`, the peer side of
//                     the media channel.
// - `socket.rs`:      Kernel buffer sizing for UDP sockets.
// - `stats.rs`:       Atomic traffic counters.
// - `error.rs`:       `RelayError` and `ClientError`.
//
// Dependencies: `lanlink_protocol` for framing, the text vocabulary, and the
// media packet codec.
//
// The relay can run as a standalone binary (`main.rs`) or be embedded via
// the library API (`start_relay`).

pub mod client;
pub mod control;
pub mod error;
pub mod media;
pub mod presence;
pub mod registry;
pub mod server;
pub mod socket;
pub mod stats;
pub mod sweeper;
pub mod transceiver;

pub use client::{ClientConfig, Connector, NetClient, ServerEvent, SessionInfo};
pub use error::{ClientError, RelayError};
pub use server::{RelayAddrs, RelayConfig, RelayHandle, start_relay};
pub use stats::TrafficSnapshot;
pub use transceiver::{MediaSink, MediaTransceiver};
