//! mio event loop driving the connection pool.
//!
//! Readiness-based model: poll tells us when sockets are ready, then each
//! ready connection gets one non-blocking syscall per readiness kind.
//! Uses epoll on Linux, kqueue on macOS. Single-threaded; the pool is owned
//! by this loop and never shared.

use crate::frame::FrameCodec;
use crate::harness::connection::{self, ConnectOutcome, Connection, Step};
use crate::harness::report::{CloseReason, ConnectionReport, RunReport};
use crate::harness::{HarnessConfig, HarnessError};
use bytes::Bytes;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

type Pool = Slab<Connection<TcpStream>>;

/// Readiness kinds, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ready {
    /// Pending connect may have finished.
    Connect,
    Readable,
    Writable,
    /// Socket error reported without a read or write to surface it.
    Error,
}

/// Readiness flags of one event, detached from mio.
#[derive(Debug, Clone, Copy, Default)]
struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
    read_closed: bool,
    write_closed: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
        }
    }
}

impl Ready {
    /// Split an event's readiness into the kinds it carries for a connection
    /// in the given phase, in dispatch order.
    fn kinds(ready: Readiness, connecting: bool) -> impl Iterator<Item = Ready> {
        let connect = connecting && (ready.writable || ready.error || ready.write_closed);
        if connecting && !connect {
            return [None::<Ready>; 4].into_iter().flatten();
        }
        [
            connect.then_some(Ready::Connect),
            (ready.readable || ready.read_closed).then_some(Ready::Readable),
            ready.writable.then_some(Ready::Writable),
            (ready.error && !connecting).then_some(Ready::Error),
        ]
        .into_iter()
        .flatten()
    }
}

/// Run one harness pass to completion.
pub(crate) fn run(
    config: &HarnessConfig,
    addr: SocketAddr,
    codec: FrameCodec,
    stop: &AtomicBool,
) -> Result<RunReport, HarnessError> {
    let started = Instant::now();
    let run_deadline = started + config.run_deadline;

    let mut poll = Poll::new().map_err(HarnessError::Poll)?;
    let mut events = Events::with_capacity(config.event_capacity.max(1));
    let mut pool: Pool = Slab::with_capacity(config.connections);
    let mut reports = Vec::with_capacity(config.connections);

    info!(
        addr = %addr,
        connections = config.connections,
        payload_len = config.payload.len(),
        checksum = %codec.checksum_kind(),
        "Starting harness"
    );

    for id in 0..config.connections {
        open_connection(
            id,
            addr,
            config,
            codec,
            poll.registry(),
            &mut pool,
            &mut reports,
        );
    }

    while !pool.is_empty() {
        if stop.load(Ordering::Acquire) {
            info!(live = pool.len(), "Stop requested");
            close_all(poll.registry(), &mut pool, &mut reports, CloseReason::Cancelled);
            break;
        }

        let now = Instant::now();
        if now >= run_deadline {
            warn!(live = pool.len(), "Run deadline reached");
            close_all(poll.registry(), &mut pool, &mut reports, CloseReason::Deadline);
            break;
        }

        expire_connections(config, poll.registry(), &mut pool, &mut reports);
        if pool.is_empty() {
            break;
        }

        let timeout = config.poll_interval.min(run_deadline - now);
        match poll.poll(&mut events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(HarnessError::Poll(e)),
        }

        for event in events.iter() {
            let Token(key) = event.token();
            let Some(conn) = pool.get_mut(key) else {
                continue;
            };

            let step = match dispatch(conn, event, &codec) {
                Step::Continue => rearm(poll.registry(), key, conn),
                closing => closing,
            };

            if let Step::Close(reason) = step {
                finish(poll.registry(), &mut pool, &mut reports, key, reason);
            }
        }
    }

    reports.sort_by_key(|r| r.id);
    let report = RunReport {
        connections: reports,
        elapsed: started.elapsed(),
    };

    info!(
        connections = report.connections.len(),
        completed = report.completed(),
        failures = report.failures(),
        bytes_sent = report.total_sent(),
        bytes_received = report.total_received(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Harness finished"
    );

    Ok(report)
}

/// Create the socket, issue the connect, and register for connect completion.
fn open_connection(
    id: usize,
    addr: SocketAddr,
    config: &HarnessConfig,
    codec: FrameCodec,
    registry: &Registry,
    pool: &mut Pool,
    reports: &mut Vec<ConnectionReport>,
) {
    let mut stream = match connect_nonblocking(addr) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(conn = id, error = %e, "Connect failed");
            reports.push(connection::refused(id, addr, &e));
            return;
        }
    };

    let entry = pool.vacant_entry();
    let key = entry.key();
    if let Err(e) = registry.register(&mut stream, Token(key), Interest::WRITABLE) {
        warn!(conn = id, error = %e, "Failed to register connection");
        reports.push(connection::refused(id, addr, &e));
        return;
    }

    let mut conn = Connection::new(
        id,
        addr,
        stream,
        Bytes::clone(&config.payload),
        config.read_chunk_size,
    );
    if config.decode_responses {
        conn = conn.with_response_decoder(codec);
    }
    entry.insert(conn);
    debug!(conn = id, token = key, "Connect issued");
}

/// Open a non-blocking TCP socket and start connecting it.
fn connect_nonblocking(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let stream: std::net::TcpStream = socket.into();
    Ok(TcpStream::from_std(stream))
}

/// Route one event to the connection's handlers.
fn dispatch(conn: &mut Connection<TcpStream>, event: &Event, codec: &FrameCodec) -> Step {
    for kind in Ready::kinds(Readiness::from(event), conn.is_connecting()) {
        let step = match kind {
            Ready::Connect => {
                let outcome = conn
                    .stream()
                    .map_or(ConnectOutcome::Pending, connect_outcome);
                conn.handle_connected(outcome)
            }
            Ready::Readable => conn.handle_readable(),
            Ready::Writable => conn.handle_writable(codec),
            Ready::Error => socket_error(conn),
        };

        if let Step::Close(_) = step {
            return step;
        }
        if conn.is_connecting() {
            // Connect still pending; nothing else applies yet.
            break;
        }
    }
    Step::Continue
}

/// Inspect a socket after a connect wakeup.
///
/// A connected peer wins: an error pending on an established socket is left
/// for the next read or write to report.
fn connect_outcome(stream: &TcpStream) -> ConnectOutcome {
    match stream.peer_addr() {
        Ok(_) => ConnectOutcome::Established,
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => match stream.take_error() {
            Ok(Some(e)) | Err(e) => ConnectOutcome::Failed(e),
            Ok(None) => ConnectOutcome::Pending,
        },
        Err(e) => ConnectOutcome::Failed(e),
    }
}

fn socket_error(conn: &Connection<TcpStream>) -> Step {
    match conn.stream().map(TcpStream::take_error) {
        Some(Ok(Some(e))) | Some(Err(e)) => Step::Close(CloseReason::Io(e.kind())),
        _ => Step::Continue,
    }
}

/// Interest matching what the connection currently wants.
fn interest_for(conn: &Connection<TcpStream>) -> Option<Interest> {
    if conn.is_connecting() {
        return Some(Interest::WRITABLE);
    }
    match (conn.wants_read(), conn.wants_write()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Re-register with the current interest.
///
/// Re-registering also re-arms the edge-triggered registration, so a
/// socket that is still ready after one syscall is reported again.
fn rearm(registry: &Registry, key: usize, conn: &mut Connection<TcpStream>) -> Step {
    let Some(interest) = interest_for(conn) else {
        return Step::Continue;
    };
    let Some(stream) = conn.stream_mut() else {
        return Step::Continue;
    };
    match registry.reregister(stream, Token(key), interest) {
        Ok(()) => Step::Continue,
        Err(e) => Step::Close(CloseReason::Io(e.kind())),
    }
}

/// Close per-connection timeouts: connect timeout and connection lifetime.
fn expire_connections(
    config: &HarnessConfig,
    registry: &Registry,
    pool: &mut Pool,
    reports: &mut Vec<ConnectionReport>,
) {
    let expired: Vec<(usize, CloseReason)> = pool
        .iter()
        .filter_map(|(key, conn)| {
            let age = conn.age();
            if conn.is_connecting() && age >= config.connect_timeout {
                Some((key, CloseReason::ConnectTimeout))
            } else if age >= config.connection_timeout {
                Some((key, CloseReason::Deadline))
            } else {
                None
            }
        })
        .collect();

    for (key, reason) in expired {
        finish(registry, pool, reports, key, reason);
    }
}

fn close_all(
    registry: &Registry,
    pool: &mut Pool,
    reports: &mut Vec<ConnectionReport>,
    reason: CloseReason,
) {
    let keys: Vec<usize> = pool.iter().map(|(key, _)| key).collect();
    for key in keys {
        finish(registry, pool, reports, key, reason.clone());
    }
}

/// Close a connection, deregister its socket, and drop it from the pool.
fn finish(
    registry: &Registry,
    pool: &mut Pool,
    reports: &mut Vec<ConnectionReport>,
    key: usize,
    reason: CloseReason,
) {
    let Some(mut conn) = pool.try_remove(key) else {
        return;
    };
    let failed = reason.is_failure();
    let report = conn.close(reason, |stream| {
        let _ = registry.deregister(stream);
    });

    if let Some(report) = report {
        if failed {
            warn!(
                conn = report.id,
                reason = %report.reason,
                bytes_sent = report.bytes_sent,
                bytes_received = report.bytes_received,
                "Connection failed"
            );
        }
        reports.push(report);
    }
}
