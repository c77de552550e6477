// Presence broadcasting and the shared fan-out primitive.
//
// Two presence shapes go out over the reliable channel:
// - `USERS:<json array>` to every session on join, leave, and eviction.
// - `STATUS:<json object>` to every session except the one whose flags
//   changed, on a capability toggle.
//
// `fan_out` is also used for chat and file-metadata relaying. It sends to all
// recipients concurrently on scoped threads (inline if a thread cannot be
// spawned) and isolates failures: a recipient
// whose write fails or stalls past its write timeout is logged and counted,
// and the others still receive the message. Nothing is retried; the failed
// peer's own handler notices the broken connection and deregisters it.

use std::io;
use std::thread;

use lanlink_protocol::{ServerMessage, SessionId, UserStatus};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::registry::{Recipient, SessionRegistry};

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub failed: usize,
}

enum Pending<'scope> {
    Spawned(thread::ScopedJoinHandle<'scope, Result<(), RelayError>>),
    Done(Result<(), RelayError>),
}

fn send_one(recipient: &Recipient, text: &str) -> Result<(), RelayError> {
    recipient
        .link
        .send_text(text)
        .map_err(|source| RelayError::SendFailure {
            recipient: recipient.name.clone(),
            source,
        })
}

/// Send `text` to every recipient concurrently. Per-recipient failures are
/// logged as `SendFailure` and do not affect the other sends.
pub fn fan_out(recipients: &[Recipient], text: &str) -> FanOutReport {
    let results: Vec<Result<(), RelayError>> = thread::scope(|scope| {
        let pending: Vec<_> = recipients
            .iter()
            .map(|recipient| {
                let spawned = thread::Builder::new()
                    .name("relay-fan-out".into())
                    .spawn_scoped(scope, move || send_one(recipient, text));
                match spawned {
                    Ok(handle) => Pending::Spawned(handle),
                    // Out of threads: send from this one instead.
                    Err(e) => {
                        debug!(error = %e, "fan-out spawn failed; sending inline");
                        Pending::Done(send_one(recipient, text))
                    }
                }
            })
            .collect();
        pending
            .into_iter()
            .map(|pending| match pending {
                Pending::Spawned(handle) => handle.join().unwrap_or_else(|_| {
                    Err(RelayError::Io(io::Error::other("fan-out sender panicked")))
                }),
                Pending::Done(result) => result,
            })
            .collect()
    });

    let mut report = FanOutReport::default();
    for (recipient, result) in recipients.iter().zip(results) {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                warn!(session = %recipient.id, error = %e, "fan-out send failed");
            }
        }
    }
    report
}

/// Encode `msg` and fan it out. Encoding failures are logged and nothing is
/// sent.
pub fn send_to_all(recipients: &[Recipient], msg: &ServerMessage) -> FanOutReport {
    match msg.encode() {
        Ok(text) => fan_out(recipients, &text),
        Err(e) => {
            warn!(error = %e, "failed to encode server message");
            FanOutReport::default()
        }
    }
}

/// Send the full user list to every live session.
pub fn broadcast_user_list(registry: &SessionRegistry) -> FanOutReport {
    let (users, recipients) = registry.presence_view();
    debug!(users = users.len(), "broadcasting user list");
    send_to_all(&recipients, &ServerMessage::Users(users))
}

/// Tell every session except `changed` about its new capability flags.
pub fn broadcast_status(
    registry: &SessionRegistry,
    changed: &SessionId,
    status: UserStatus,
) -> FanOutReport {
    let recipients = registry.recipients_except(Some(changed));
    send_to_all(&recipients, &ServerMessage::Status(status))
}

/// Relay a message from `sender` to every other session.
pub fn broadcast_except(
    registry: &SessionRegistry,
    sender: &SessionId,
    msg: &ServerMessage,
) -> FanOutReport {
    let recipients = registry.recipients_except(Some(sender));
    send_to_all(&recipients, msg)
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;
    use std::net::TcpStream;
    use std::time::Duration;

    use lanlink_protocol::Capability;
    use lanlink_protocol::framing::read_message;

    use super::*;
    use crate::registry::tests::test_link;

    fn recv(reader: &mut BufReader<TcpStream>) -> ServerMessage {
        let bytes = read_message(reader).unwrap();
        ServerMessage::parse_bytes(&bytes).unwrap()
    }

    /// True if no frame arrives within a short window.
    fn nothing_pending(reader: &mut BufReader<TcpStream>) -> bool {
        reader
            .get_ref()
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        read_message(reader).is_err()
    }

    fn join(registry: &SessionRegistry, name: &str) -> (SessionId, BufReader<TcpStream>) {
        let (client, link) = test_link();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let id = registry.register(name, link);
        (id, BufReader::new(client))
    }

    #[test]
    fn user_list_reaches_everyone() {
        let registry = SessionRegistry::new();
        let (_a, mut reader_a) = join(&registry, "alice");
        let (_b, mut reader_b) = join(&registry, "bob");

        let report = broadcast_user_list(&registry);
        assert_eq!(report, FanOutReport { delivered: 2, failed: 0 });

        let expected = ServerMessage::Users(vec![UserStatus::new("alice"), UserStatus::new("bob")]);
        assert_eq!(recv(&mut reader_a), expected);
        assert_eq!(recv(&mut reader_b), expected);
    }

    #[test]
    fn status_skips_the_changed_session() {
        let registry = SessionRegistry::new();
        let (alice, mut reader_a) = join(&registry, "alice");
        let (_bob, mut reader_b) = join(&registry, "bob");

        let status = registry
            .set_capability(&alice, Capability::Screen, true)
            .unwrap();
        let report = broadcast_status(&registry, &alice, status.clone());
        assert_eq!(report.delivered, 1);

        assert_eq!(recv(&mut reader_b), ServerMessage::Status(status));
        assert!(nothing_pending(&mut reader_a), "alice got her own status");
    }

    #[test]
    fn one_failed_recipient_does_not_block_the_rest() {
        let registry = SessionRegistry::new();
        let (sender, _sender_reader) = join(&registry, "sender");
        let mut readers = Vec::new();
        for name in ["r1", "r2", "r3", "r4"] {
            readers.push(join(&registry, name).1);
        }
        let (broken, broken_reader) = join(&registry, "broken");
        // Kill the broken recipient's connection from the relay side so the
        // write fails.
        registry.link(&broken).unwrap().close();
        drop(broken_reader);

        let msg = ServerMessage::Chat {
            from: "sender".into(),
            text: "hello".into(),
        };
        let report = broadcast_except(&registry, &sender, &msg);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.failed, 1);

        for reader in &mut readers {
            assert_eq!(recv(reader), msg);
        }
    }
}
