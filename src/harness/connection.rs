//! Connection state machine for one client session.
//!
//! A connection moves `Connecting -> Open -> Closed`. While open, writing
//! and reading are independent: the connection wants to write until its
//! single framed message has been fully sent, and wants to read until the
//! remote closes. `Closed` is terminal.
//!
//! The state machine is generic over the stream so it can be driven by
//! the mio event loop or by in-memory streams in tests.

use crate::frame::{FrameCodec, FrameDecoder};
use crate::harness::report::{CloseReason, ConnectionReport};
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Current lifecycle state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    /// Non-blocking connect issued, completion not yet observed.
    Connecting,
    /// Connected; reads and writes are allowed.
    Open,
    /// Terminal.
    Closed(CloseReason),
}

/// Outbound message progress.
#[derive(Debug)]
enum Outbound {
    /// Payload not framed yet; framing happens on the first write opportunity.
    Pending(Bytes),
    /// Frame built, `written` bytes of it already accepted by the transport.
    Framed { frame: Bytes, written: usize },
    /// Whole frame sent.
    Flushed,
}

/// What the transport said about a pending connect.
#[derive(Debug)]
pub enum ConnectOutcome {
    Established,
    /// Not finished yet (spurious wakeup).
    Pending,
    Failed(io::Error),
}

/// Result of handling one readiness event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Close(CloseReason),
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    id: usize,
    peer: SocketAddr,
    /// Owned exclusively; taken (and dropped) exactly once on close.
    stream: Option<S>,
    state: ConnState,
    outbound: Outbound,
    read_buf: Box<[u8]>,
    decoder: Option<FrameDecoder>,
    bytes_sent: u64,
    bytes_received: u64,
    frames_received: u64,
    opened_at: Instant,
}

impl<S: Read + Write> Connection<S> {
    /// Create a connection whose connect has been issued but not completed.
    pub fn new(
        id: usize,
        peer: SocketAddr,
        stream: S,
        payload: Bytes,
        read_chunk_size: usize,
    ) -> Self {
        Self {
            id,
            peer,
            stream: Some(stream),
            state: ConnState::Connecting,
            outbound: Outbound::Pending(payload),
            read_buf: vec![0u8; read_chunk_size.max(1)].into_boxed_slice(),
            decoder: None,
            bytes_sent: 0,
            bytes_received: 0,
            frames_received: 0,
            opened_at: Instant::now(),
        }
    }

    /// Verify inbound bytes as a stream of frames.
    pub fn with_response_decoder(mut self, codec: FrameCodec) -> Self {
        self.decoder = Some(FrameDecoder::new(codec));
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> &ConnState {
        &self.state
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self.state, ConnState::Connecting)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, ConnState::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed(_))
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    /// Time since the connect was issued.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.stream.as_mut()
    }

    /// True while connected and part of the frame is still unsent.
    pub fn wants_write(&self) -> bool {
        self.is_open() && !matches!(self.outbound, Outbound::Flushed)
    }

    /// True until the connection is closed.
    pub fn wants_read(&self) -> bool {
        !self.is_closed()
    }

    /// Handle a connect-completion event.
    pub fn handle_connected(&mut self, outcome: ConnectOutcome) -> Step {
        if !self.is_connecting() {
            return Step::Continue;
        }
        match outcome {
            ConnectOutcome::Established => {
                debug!(conn = self.id, peer = %self.peer, "Connected");
                self.state = ConnState::Open;
                Step::Continue
            }
            ConnectOutcome::Pending => Step::Continue,
            // A reset needs an established session; the handshake fails as refused.
            ConnectOutcome::Failed(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                Step::Close(CloseReason::Io(e.kind()))
            }
            ConnectOutcome::Failed(e) => Step::Close(CloseReason::ConnectFailed(e.kind())),
        }
    }

    /// Handle a writable event: frame the payload if not done yet, then
    /// make one non-blocking write of the unsent remainder.
    pub fn handle_writable(&mut self, codec: &FrameCodec) -> Step {
        if !self.wants_write() {
            return Step::Continue;
        }

        if let Outbound::Pending(payload) = &self.outbound {
            let frame = codec.encode(payload);
            self.outbound = Outbound::Framed { frame, written: 0 };
        }

        let Outbound::Framed { frame, written } = &mut self.outbound else {
            return Step::Continue;
        };
        let Some(stream) = self.stream.as_mut() else {
            return Step::Continue;
        };

        let n = match stream.write(&frame[*written..]) {
            Ok(0) => return Step::Close(CloseReason::Io(io::ErrorKind::WriteZero)),
            Ok(n) => n,
            Err(ref e) if is_transient(e) => return Step::Continue,
            Err(e) => return Step::Close(CloseReason::Io(e.kind())),
        };

        *written += n;
        self.bytes_sent += n as u64;
        let done = *written >= frame.len();
        trace!(conn = self.id, bytes = n, remaining = frame.len() - *written, "Wrote");

        if done {
            self.outbound = Outbound::Flushed;
        }
        Step::Continue
    }

    /// Handle a readable event: one non-blocking read of up to one chunk.
    pub fn handle_readable(&mut self) -> Step {
        if !self.is_open() {
            return Step::Continue;
        }
        let Some(stream) = self.stream.as_mut() else {
            return Step::Continue;
        };

        let n = match stream.read(&mut self.read_buf) {
            Ok(0) => return Step::Close(CloseReason::RemoteClosed),
            Ok(n) => n,
            Err(ref e) if is_transient(e) => return Step::Continue,
            Err(e) => return Step::Close(CloseReason::Io(e.kind())),
        };

        self.bytes_received += n as u64;
        trace!(conn = self.id, bytes = n, "Read");

        if let Some(decoder) = &mut self.decoder {
            decoder.extend(&self.read_buf[..n]);
            loop {
                match decoder.next_frame() {
                    Ok(Some(_)) => self.frames_received += 1,
                    Ok(None) => break,
                    Err(e) => return Step::Close(CloseReason::Corrupt(e)),
                }
            }
        }
        Step::Continue
    }

    /// Move to `Closed`, releasing the stream exactly once.
    ///
    /// `release` runs on the stream right before it is dropped. Returns the
    /// final report, or `None` if the connection was already closed.
    pub fn close<F>(&mut self, reason: CloseReason, release: F) -> Option<ConnectionReport>
    where
        F: FnOnce(&mut S),
    {
        if self.is_closed() {
            return None;
        }
        if let Some(mut stream) = self.stream.take() {
            release(&mut stream);
        }
        debug!(
            conn = self.id,
            reason = %reason,
            bytes_sent = self.bytes_sent,
            bytes_received = self.bytes_received,
            "Connection closed"
        );
        self.state = ConnState::Closed(reason.clone());
        Some(self.report(reason))
    }

    fn report(&self, reason: CloseReason) -> ConnectionReport {
        ConnectionReport {
            id: self.id,
            peer: self.peer,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            frames_received: self.frames_received,
            reason,
            elapsed: self.age(),
        }
    }
}

/// Report for a connection whose socket could not even be created or
/// whose connect was rejected synchronously.
pub fn refused(id: usize, peer: SocketAddr, err: &io::Error) -> ConnectionReport {
    ConnectionReport {
        id,
        peer,
        bytes_sent: 0,
        bytes_received: 0,
        frames_received: 0,
        reason: CloseReason::ConnectFailed(err.kind()),
        elapsed: Duration::ZERO,
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameError, HEADER_LEN};
    use std::collections::VecDeque;

    /// In-memory stream with a per-call write limit and scripted reads.
    #[derive(Debug, Default)]
    struct MockStream {
        written: Vec<u8>,
        write_limit: Option<usize>,
        write_error: Option<io::ErrorKind>,
        reads: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(Ok(data[n..].to_vec()));
                    }
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            let n = self.write_limit.map_or(buf.len(), |l| l.min(buf.len()));
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:32450".parse().unwrap()
    }

    fn open_conn(id: usize, stream: MockStream, payload: &'static [u8]) -> Connection<MockStream> {
        let mut conn = Connection::new(id, peer(), stream, Bytes::from_static(payload), 8192);
        assert_eq!(conn.handle_connected(ConnectOutcome::Established), Step::Continue);
        conn
    }

    #[test]
    fn test_connection_state_transitions() {
        let mut conn = Connection::new(0, peer(), MockStream::default(), Bytes::new(), 8192);
        assert!(conn.is_connecting());
        assert!(!conn.wants_write());
        assert!(conn.wants_read());

        assert_eq!(conn.handle_connected(ConnectOutcome::Pending), Step::Continue);
        assert!(conn.is_connecting());

        conn.handle_connected(ConnectOutcome::Established);
        assert!(conn.is_open());
        assert!(conn.wants_write());

        let report = conn.close(CloseReason::RemoteClosed, |_| {}).unwrap();
        assert_eq!(report.reason, CloseReason::RemoteClosed);
        assert!(conn.is_closed());
        assert!(!conn.wants_read());
        assert!(!conn.wants_write());
    }

    #[test]
    fn test_connect_failure_is_terminal() {
        let mut conn = Connection::new(0, peer(), MockStream::default(), Bytes::new(), 8192);
        let step = conn.handle_connected(ConnectOutcome::Failed(
            io::ErrorKind::ConnectionRefused.into(),
        ));
        assert_eq!(
            step,
            Step::Close(CloseReason::ConnectFailed(io::ErrorKind::ConnectionRefused))
        );
    }

    #[test]
    fn test_reset_before_first_write_is_io_error() {
        let mut conn = Connection::new(0, peer(), MockStream::default(), Bytes::new(), 8192);
        let step = conn.handle_connected(ConnectOutcome::Failed(
            io::ErrorKind::ConnectionReset.into(),
        ));
        assert_eq!(
            step,
            Step::Close(CloseReason::Io(io::ErrorKind::ConnectionReset))
        );
        assert_eq!(conn.bytes_sent(), 0);
    }

    #[test]
    fn test_full_write() {
        let codec = FrameCodec::default();
        let mut conn = open_conn(0, MockStream::default(), b"hello,kitty");

        assert_eq!(conn.handle_writable(&codec), Step::Continue);
        assert_eq!(conn.bytes_sent(), 23);
        assert!(!conn.wants_write());
        assert_eq!(conn.stream().unwrap().written, codec.encode(b"hello,kitty"));

        // Further writable events are no-ops.
        assert_eq!(conn.handle_writable(&codec), Step::Continue);
        assert_eq!(conn.bytes_sent(), 23);
    }

    #[test]
    fn test_partial_sends() {
        let codec = FrameCodec::default();
        let expected = codec.encode(b"GET /index.html HTTP/1.0\r\n\r\n");

        for limit in [1, 5, 12, 13, 39] {
            let stream = MockStream {
                write_limit: Some(limit),
                ..Default::default()
            };
            let mut conn = open_conn(0, stream, b"GET /index.html HTTP/1.0\r\n\r\n");

            let mut events = 0;
            while conn.wants_write() {
                assert_eq!(conn.handle_writable(&codec), Step::Continue);
                events += 1;
            }

            assert_eq!(events, expected.len().div_ceil(limit));
            assert_eq!(conn.bytes_sent(), expected.len() as u64);
            assert_eq!(conn.stream().unwrap().written, expected);
        }
    }

    #[test]
    fn test_empty_payload_sends_header() {
        let codec = FrameCodec::default();
        let mut conn = open_conn(0, MockStream::default(), b"");
        conn.handle_writable(&codec);
        assert_eq!(conn.bytes_sent(), HEADER_LEN as u64);
        assert!(!conn.wants_write());
    }

    #[test]
    fn test_write_would_block() {
        let codec = FrameCodec::default();
        let stream = MockStream {
            write_error: Some(io::ErrorKind::WouldBlock),
            ..Default::default()
        };
        let mut conn = open_conn(0, stream, b"data");
        assert_eq!(conn.handle_writable(&codec), Step::Continue);
        assert_eq!(conn.bytes_sent(), 0);
        assert!(conn.wants_write());
    }

    #[test]
    fn test_write_error_closes() {
        let codec = FrameCodec::default();
        let stream = MockStream {
            write_error: Some(io::ErrorKind::BrokenPipe),
            ..Default::default()
        };
        let mut conn = open_conn(0, stream, b"data");
        assert_eq!(
            conn.handle_writable(&codec),
            Step::Close(CloseReason::Io(io::ErrorKind::BrokenPipe))
        );
    }

    #[test]
    fn test_no_write_before_connected() {
        let codec = FrameCodec::default();
        let payload = Bytes::from_static(b"x");
        let mut conn = Connection::new(0, peer(), MockStream::default(), payload, 8192);
        assert_eq!(conn.handle_writable(&codec), Step::Continue);
        assert_eq!(conn.bytes_sent(), 0);
        assert!(conn.stream().unwrap().written.is_empty());
    }

    #[test]
    fn test_reads_in_chunks_until_eof() {
        let stream = MockStream {
            reads: VecDeque::from(vec![Ok(vec![1u8; 10]), Ok(Vec::new())]),
            ..Default::default()
        };
        let mut conn = Connection::new(0, peer(), stream, Bytes::new(), 4);
        conn.handle_connected(ConnectOutcome::Established);

        assert_eq!(conn.handle_readable(), Step::Continue);
        assert_eq!(conn.bytes_received(), 4);
        assert_eq!(conn.handle_readable(), Step::Continue);
        assert_eq!(conn.handle_readable(), Step::Continue);
        assert_eq!(conn.bytes_received(), 10);
        assert_eq!(conn.handle_readable(), Step::Close(CloseReason::RemoteClosed));
    }

    #[test]
    fn test_read_spurious_wakeup() {
        let mut conn = open_conn(0, MockStream::default(), b"");
        assert_eq!(conn.handle_readable(), Step::Continue);
        assert_eq!(conn.bytes_received(), 0);
    }

    #[test]
    fn test_read_reset_closes() {
        let stream = MockStream {
            reads: VecDeque::from(vec![Err(io::ErrorKind::ConnectionReset.into())]),
            ..Default::default()
        };
        let mut conn = open_conn(0, stream, b"");
        assert_eq!(
            conn.handle_readable(),
            Step::Close(CloseReason::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn test_response_decoding_counts_frames() {
        let codec = FrameCodec::default();
        let mut reply = codec.encode(b"pong").to_vec();
        reply.extend_from_slice(&codec.encode(b"pong again"));

        let stream = MockStream {
            reads: VecDeque::from(vec![Ok(reply.clone())]),
            ..Default::default()
        };
        let mut conn = open_conn(0, stream, b"ping").with_response_decoder(codec);

        assert_eq!(conn.handle_readable(), Step::Continue);
        assert_eq!(conn.frames_received(), 2);
        assert_eq!(conn.bytes_received(), reply.len() as u64);
    }

    #[test]
    fn test_response_decoding_rejects_corruption() {
        let codec = FrameCodec::default();
        let mut reply = codec.encode(b"pong").to_vec();
        reply[HEADER_LEN] ^= 0x20;

        let stream = MockStream {
            reads: VecDeque::from(vec![Ok(reply)]),
            ..Default::default()
        };
        let mut conn = open_conn(0, stream, b"ping").with_response_decoder(codec);

        match conn.handle_readable() {
            Step::Close(CloseReason::Corrupt(FrameError::PayloadChecksum { .. })) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_close_exactly_once() {
        let mut conn = open_conn(0, MockStream::default(), b"");
        let mut releases = 0;

        let first = conn.close(CloseReason::Cancelled, |_| releases += 1);
        assert!(first.is_some());
        assert!(conn.stream().is_none());

        let second = conn.close(CloseReason::RemoteClosed, |_| releases += 1);
        assert!(second.is_none());
        assert_eq!(releases, 1);
        assert_eq!(conn.state(), &ConnState::Closed(CloseReason::Cancelled));
    }

    #[test]
    fn test_counters_final_after_close() {
        let codec = FrameCodec::default();
        let stream = MockStream {
            write_limit: Some(5),
            ..Default::default()
        };
        let mut conn = open_conn(3, stream, b"hello,kitty");
        conn.handle_writable(&codec);

        let report = conn
            .close(CloseReason::Io(io::ErrorKind::ConnectionReset), |_| {})
            .unwrap();
        assert_eq!(report.id, 3);
        assert_eq!(report.bytes_sent, 5);
        assert_eq!(report.bytes_received, 0);

        // Closed connections ignore further events.
        assert_eq!(conn.handle_writable(&codec), Step::Continue);
        assert_eq!(conn.handle_readable(), Step::Continue);
        assert_eq!(conn.bytes_sent(), 5);
    }

    #[test]
    fn test_pool_independence() {
        let codec = FrameCodec::default();
        let mut pool: Vec<Connection<MockStream>> = (0..3)
            .map(|id| open_conn(id, MockStream::default(), b"hello,kitty"))
            .collect();

        pool[1].stream_mut().unwrap().write_error = Some(io::ErrorKind::ConnectionReset);

        let mut reports = Vec::new();
        for conn in pool.iter_mut() {
            if let Step::Close(reason) = conn.handle_writable(&codec) {
                reports.extend(conn.close(reason, |_| {}));
            }
        }

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].id, 1);
        assert!(pool[1].is_closed());
        for i in [0, 2] {
            assert!(pool[i].is_open());
            assert_eq!(pool[i].bytes_sent(), 23);
        }
    }
}
