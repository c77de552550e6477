// Relay-wide traffic counters.
//
// Lock-free atomics bumped from the control handlers and the media router,
// read as a plain `TrafficSnapshot`. Counts only accepted traffic: relayed
// chat messages, and the bytes of well-formed media datagrams.

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub chat_messages: u64,
    pub media_packets: u64,
    pub media_bytes: u64,
}

#[derive(Debug, Default)]
pub struct TrafficStats {
    chat_messages: AtomicU64,
    media_packets: AtomicU64,
    media_bytes: AtomicU64,
}

impl TrafficStats {
    pub fn record_chat(&self) {
        self.chat_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// One routed media datagram of `bytes` (header included).
    pub fn record_media(&self, bytes: usize) {
        self.media_packets.fetch_add(1, Ordering::Relaxed);
        self.media_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            chat_messages: self.chat_messages.load(Ordering::Relaxed),
            media_packets: self.media_packets.load(Ordering::Relaxed),
            media_bytes: self.media_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn counters_start_at_zero() {
        assert_eq!(TrafficStats::default().snapshot(), TrafficSnapshot::default());
    }

    #[test]
    fn concurrent_records_all_land() {
        let stats = Arc::new(TrafficStats::default());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        stats.record_chat();
                        stats.record_media(10);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(
            stats.snapshot(),
            TrafficSnapshot {
                chat_messages: 800,
                media_packets: 800,
                media_bytes: 8000,
            }
        );
    }
}
