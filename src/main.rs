//! frameload: concurrent TCP load tester for a checksum-framed protocol.
//!
//! Features:
//! - N simultaneous non-blocking connections on a single event loop
//! - One framed message per connection, partial sends tracked
//! - Per-connection byte counters and close reasons
//! - Configuration via CLI arguments or TOML file

use frameload::config::Config;
use frameload::harness::{Harness, StopHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Set from the signal handler; only async-signal-safe work happens there.
#[cfg(unix)]
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Release);
}

/// Route SIGINT and SIGTERM to the harness stop handle.
#[cfg(unix)]
fn stop_on_signal(handle: StopHandle) {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    thread::spawn(move || {
        while !handle.is_stopped() {
            if INTERRUPTED.load(Ordering::Acquire) {
                warn!("Interrupted, closing live connections");
                handle.stop();
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
    });
}

#[cfg(not(unix))]
fn stop_on_signal(_handle: StopHandle) {}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let connections = config.connections.resolve();
    info!(
        host = %config.host,
        port = config.port,
        connections,
        checksum = %config.checksum,
        decode_responses = config.decode_responses,
        "Starting frameload"
    );

    let harness = Harness::new(config.harness_config(connections));
    stop_on_signal(harness.stop_handle());
    let report = harness.run()?;

    for conn in &report.connections {
        info!(
            conn = conn.id,
            bytes_sent = conn.bytes_sent,
            bytes_received = conn.bytes_received,
            frames_received = conn.frames_received,
            reason = %conn.reason,
            elapsed_ms = conn.elapsed.as_millis() as u64,
            "Connection finished"
        );
    }

    Ok(())
}
