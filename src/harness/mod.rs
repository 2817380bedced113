//! Concurrent connection harness.
//!
//! Opens a fixed pool of client connections against one target, sends one
//! framed message on each, counts bytes until every connection is closed,
//! and returns per-connection reports.
//!
//! - `Connection`: per-session state machine, generic over its stream
//! - `event_loop`: single-threaded mio driver owning the pool
//! - `report`: final counters and close reasons

mod connection;
mod event_loop;
mod report;

pub use connection::{ConnState, ConnectOutcome, Connection, Step};
pub use report::{CloseReason, ConnectionReport, RunReport};

use crate::frame::{ChecksumKind, FrameCodec, MAX_PAYLOAD_LEN};
use bytes::Bytes;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default bytes drained per read call.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;

/// Errors that abort a whole run. Connection-level failures never do.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no addresses found for {host}:{port}")]
    NoAddress { host: String, port: u16 },

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
}

/// Parameters of one harness run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub host: String,
    pub port: u16,
    /// Number of simultaneous connections.
    pub connections: usize,
    /// Unframed message each connection sends exactly once.
    pub payload: Bytes,
    pub read_chunk_size: usize,
    pub checksum: ChecksumKind,
    /// Limit applied when verifying response frames.
    pub max_payload: usize,
    /// Verify inbound bytes as frames and count them.
    pub decode_responses: bool,
    /// Longest single wait for readiness.
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    /// Longest lifetime of one connection.
    pub connection_timeout: Duration,
    /// Longest duration of the whole run.
    pub run_deadline: Duration,
    pub event_capacity: usize,
}

impl HarnessConfig {
    pub fn new(host: impl Into<String>, port: u16, connections: usize) -> Self {
        Self {
            host: host.into(),
            port,
            connections,
            payload: Bytes::new(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            checksum: ChecksumKind::default(),
            max_payload: MAX_PAYLOAD_LEN,
            decode_responses: false,
            poll_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(60),
            run_deadline: Duration::from_secs(300),
            event_capacity: 1024,
        }
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.checksum).with_max_payload(self.max_payload)
    }
}

/// Cloneable handle that asks a running harness to stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// Close every live connection with `CloseReason::Cancelled` at the
    /// next loop iteration.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// One load-test run against one target.
pub struct Harness {
    config: HarnessConfig,
    stop: Arc<AtomicBool>,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: Arc::clone(&self.stop),
        }
    }

    /// Resolve the target, run the pool to completion, and report.
    pub fn run(&self) -> Result<RunReport, HarnessError> {
        let addr = resolve(&self.config.host, self.config.port)?;
        debug!(host = %self.config.host, addr = %addr, "Resolved target");
        event_loop::run(&self.config, addr, self.config.codec(), &self.stop)
    }
}

/// Resolve `host:port`, taking the first address.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, HarnessError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|source| HarnessError::Resolve {
            host: host.to_string(),
            port,
            source,
        })?
        .next()
        .ok_or_else(|| HarnessError::NoAddress {
            host: host.to_string(),
            port,
        })
}
