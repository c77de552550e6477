// Liveness sweeper.
//
// Every `sweep_interval` the sweeper looks for sessions whose `last_seen` is
// older than `stale_after`, removes them from the registry, and shuts their
// sockets down so the owning connection handler unblocks and exits. If anything
// was evicted the remaining sessions get one fresh user list per sweep, not one
// per eviction.
//
// Removal goes through `SessionRegistry::remove`, the same call the connection
// handler uses on close, so whichever path gets there first does the
// deregistration and the other sees `None` and stays quiet.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use lanlink_protocol::SessionId;
use tracing::{debug, info};

use crate::error::RelayError;
use crate::presence;
use crate::registry::SessionRegistry;

/// Granularity of the shutdown check while waiting between sweeps.
const TICK: Duration = Duration::from_millis(100);

/// Evict every session silent for longer than `stale_after` as of `now`.
/// Returns the evicted ids.
pub fn sweep(registry: &SessionRegistry, now: Instant, stale_after: Duration) -> Vec<SessionId> {
    let mut evicted = Vec::new();
    for id in registry.stale_sessions(now, stale_after) {
        let Some(session) = registry.remove(&id) else {
            continue;
        };
        let reason = RelayError::StaleSession(id.clone());
        info!(
            name = %session.display_name(),
            peer = ?session.link.peer(),
            reason = %reason,
            "evicting session"
        );
        session.link.close();
        evicted.push(id);
    }

    if !evicted.is_empty() {
        presence::broadcast_user_list(registry);
    }
    evicted
}

/// Sweep on a fixed interval until `keep_running` goes false.
pub fn run_sweeper(
    registry: &SessionRegistry,
    interval: Duration,
    stale_after: Duration,
    keep_running: &AtomicBool,
) {
    debug!(?interval, ?stale_after, "sweeper started");
    let mut next = Instant::now() + interval;
    while keep_running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= next {
            sweep(registry, now, stale_after);
            next = now + interval;
        }
        thread::sleep(TICK.min(next.saturating_duration_since(now)));
    }
    debug!("sweeper stopped");
}
