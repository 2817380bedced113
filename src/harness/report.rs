//! Per-connection and per-run transfer counters.

use crate::frame::FrameError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Why a connection reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Remote end closed its write side (zero-byte read).
    RemoteClosed,
    /// The connect attempt failed.
    ConnectFailed(io::ErrorKind),
    /// The connect attempt did not complete in time.
    ConnectTimeout,
    /// Send or receive failed after the connection was established.
    Io(io::ErrorKind),
    /// A response frame failed verification.
    Corrupt(FrameError),
    /// The connection or the whole run outlived its deadline.
    Deadline,
    /// The run was stopped from outside.
    Cancelled,
}

impl CloseReason {
    /// Whether this outcome counts as a failure of the connection.
    pub fn is_failure(&self) -> bool {
        !matches!(self, CloseReason::RemoteClosed)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::RemoteClosed => f.write_str("closed by remote"),
            CloseReason::ConnectFailed(kind) => write!(f, "connect failed: {kind}"),
            CloseReason::ConnectTimeout => f.write_str("connect timed out"),
            CloseReason::Io(kind) => write!(f, "i/o error: {kind}"),
            CloseReason::Corrupt(e) => write!(f, "corrupt frame: {e}"),
            CloseReason::Deadline => f.write_str("deadline exceeded"),
            CloseReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Final counters of one connection, produced once when it closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    pub id: usize,
    pub peer: SocketAddr,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Verified response frames (only counted when response decoding is on).
    pub frames_received: u64,
    pub reason: CloseReason,
    pub elapsed: Duration,
}

/// Outcome of a whole harness run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub connections: Vec<ConnectionReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn total_sent(&self) -> u64 {
        self.connections.iter().map(|c| c.bytes_sent).sum()
    }

    pub fn total_received(&self) -> u64 {
        self.connections.iter().map(|c| c.bytes_received).sum()
    }

    /// Connections that ended in anything other than a clean remote close.
    pub fn failures(&self) -> usize {
        self.connections
            .iter()
            .filter(|c| c.reason.is_failure())
            .count()
    }

    pub fn completed(&self) -> usize {
        self.connections.len() - self.failures()
    }
}
