//! Streaming frame decoder for the receiving side of a connection.
//!
//! Bytes arrive in arbitrary chunks; the decoder buffers them and yields
//! whole verified payloads. The header is verified as soon as its 12 bytes
//! are present, so a corrupt or hostile size never causes the payload to
//! be buffered.

use super::{FrameCodec, FrameError, Header, HEADER_LEN};
use bytes::{Buf, Bytes, BytesMut};

/// Incremental decoder over a byte stream of frames.
#[derive(Debug)]
pub struct FrameDecoder {
    codec: FrameCodec,
    buf: BytesMut,
    /// Header of the frame currently being assembled, already verified.
    pending: Option<(Header, usize)>,
    /// Set once a frame fails verification; the stream is unusable after that.
    failed: Option<FrameError>,
}

impl FrameDecoder {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buf: BytesMut::new(),
            pending: None,
            failed: None,
        }
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        if self.failed.is_none() {
            self.buf.extend_from_slice(data);
        }
    }

    /// Number of bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete payload.
    ///
    /// Returns `Ok(None)` if more bytes are needed. Once an error has been
    /// returned every later call returns the same error.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        let (header, size) = match self.pending {
            Some(pending) => pending,
            None => {
                let Some(head) = self.buf.get(..HEADER_LEN) else {
                    return Ok(None);
                };
                let mut raw = [0u8; HEADER_LEN];
                raw.copy_from_slice(head);
                let header = Header::parse(&raw);
                let size = self.codec.check_header(&header).map_err(|e| self.fail(e))?;
                self.buf.advance(HEADER_LEN);
                self.pending = Some((header, size));
                (header, size)
            }
        };

        if self.buf.len() < size {
            self.buf.reserve(size - self.buf.len());
            return Ok(None);
        }

        let payload = self.buf.split_to(size).freeze();
        self.pending = None;
        self.codec
            .check_payload(&header, &payload)
            .map_err(|e| self.fail(e))?;
        Ok(Some(payload))
    }

    fn fail(&mut self, err: FrameError) -> FrameError {
        self.buf.clear();
        self.pending = None;
        self.failed = Some(err.clone());
        err
    }
}
