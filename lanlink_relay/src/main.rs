// CLI entry point for the LanLink relay.
//
// Starts a standalone relay that peers connect to. See `server.rs` for the
// threading model and `control.rs` / `media.rs` for the two channels.
//
// Usage:
//   lanlink-relay [OPTIONS]
//     --host <HOST>             Bind address (default: 0.0.0.0)
//     --control-port <PORT>     TCP control port (default: 9000)
//     --media-port <PORT>       UDP media port (default: 9001)
//     --buffer-bytes <N>        UDP socket buffer size (default: 4 MiB)
//     --stale-after-secs <N>    Evict sessions silent this long (default: 300)
//     --sweep-interval-secs <N> How often to look for stale sessions (default: 60)
//
// Log verbosity follows RUST_LOG (default `lanlink_relay=info`). SIGINT and
// SIGTERM stop the relay cleanly, closing every peer's connection.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::Parser;
use lanlink_relay::server::{RelayConfig, start_relay};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Cleared by the signal handler.
static RUNNING: AtomicBool = AtomicBool::new(true);

#[derive(Parser, Debug)]
#[command(name = "lanlink-relay", version, about = "LAN chat and media relay")]
struct Args {
    /// Interface to bind both endpoints on.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 9000)]
    control_port: u16,

    #[arg(long, default_value_t = 9001)]
    media_port: u16,

    /// Requested SO_RCVBUF/SO_SNDBUF for the media socket; 0 keeps the OS default.
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    buffer_bytes: usize,

    #[arg(long, default_value_t = 300)]
    stale_after_secs: u64,

    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            bind_host: self.host,
            control_port: self.control_port,
            media_port: self.media_port,
            socket_buffer_bytes: self.buffer_bytes,
            stale_after: Duration::from_secs(self.stale_after_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            ..RelayConfig::default()
        }
    }
}

#[cfg(unix)]
extern "C" fn on_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lanlink_relay=info")),
        )
        .init();

    let config = Args::parse().into_config();
    let (handle, addrs) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to start relay");
            return ExitCode::FAILURE;
        }
    };

    install_signal_handlers();
    info!(control = %addrs.control, media = %addrs.media, "relay running; Ctrl+C to stop");

    while RUNNING.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    info!("shutting down");
    handle.stop();
    ExitCode::SUCCESS
}
