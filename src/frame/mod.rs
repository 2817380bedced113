//! Frame codec for the checksum-framed wire protocol.
//!
//! Every message on the wire is a 12-byte header followed by the payload:
//!
//! ```text
//! +--------------+---------------+------------------+-----------------+
//! | payload_size | size_checksum | payload_checksum |    payload      |
//! |   i32 LE     |    u32 LE     |     u32 LE       | payload_size B  |
//! +--------------+---------------+------------------+-----------------+
//! ```
//!
//! - `size_checksum` covers the 4 encoded bytes of `payload_size`.
//! - `payload_checksum` covers the raw payload bytes.
//! - All integers are little-endian. The checksum variant is fixed per
//!   deployment (see [`ChecksumKind`]); it is not negotiated.
//!
//! Encoding is total. Decoding rejects anything whose header or payload
//! does not verify, and rejects bad headers before the declared payload
//! length is ever buffered.

mod checksum;
mod decoder;

pub use checksum::ChecksumKind;
pub use decoder::FrameDecoder;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_LEN: usize = 12;

/// Default maximum payload size (a whole frame is capped at 1 MiB).
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024 - HEADER_LEN;

/// Errors produced while verifying a received frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than a header.
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The size field does not match its checksum.
    #[error("size checksum mismatch: header {expected:#010x}, computed {computed:#010x}")]
    SizeChecksum { expected: u32, computed: u32 },

    /// The payload does not match its checksum.
    #[error("payload checksum mismatch: header {expected:#010x}, computed {computed:#010x}")]
    PayloadChecksum { expected: u32, computed: u32 },

    /// Declared payload size is negative.
    #[error("negative payload size {0}")]
    NegativeSize(i32),

    /// Declared payload size is above the receiver's limit.
    #[error("payload size {size} exceeds limit {limit}")]
    TooLarge { size: usize, limit: usize },

    /// Declared payload size disagrees with the bytes actually present.
    #[error("declared payload size {declared} but frame carries {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
}

impl FrameError {
    /// True for data corruption (a checksum did not verify), false for
    /// protocol violations such as bad sizes.
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(
            self,
            FrameError::SizeChecksum { .. } | FrameError::PayloadChecksum { .. }
        )
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Payload length in bytes.
    pub payload_size: i32,
    /// Checksum of the 4 encoded bytes of `payload_size`.
    pub size_checksum: u32,
    /// Checksum of the payload.
    pub payload_checksum: u32,
}

impl Header {
    /// Read a header from its wire form. No verification is done here.
    pub fn parse(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            payload_size: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            size_checksum: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            payload_checksum: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    /// Append the wire form of this header to `dst`.
    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_i32_le(self.payload_size);
        dst.put_u32_le(self.size_checksum);
        dst.put_u32_le(self.payload_checksum);
    }
}

/// Stateless encoder/verifier bound to one checksum variant and size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    checksum: ChecksumKind,
    max_payload: usize,
}

impl FrameCodec {
    /// Create a codec with the default payload limit.
    pub fn new(checksum: ChecksumKind) -> Self {
        Self {
            checksum,
            max_payload: MAX_PAYLOAD_LEN,
        }
    }

    /// Override the receiver-side payload limit (clamped to `i32::MAX`).
    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload.min(i32::MAX as usize);
        self
    }

    pub fn checksum_kind(&self) -> ChecksumKind {
        self.checksum
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Build the header for `payload`.
    ///
    /// Payloads longer than `i32::MAX` cannot be described by the size field;
    /// configuration rejects them long before a frame is built.
    pub fn header_for(&self, payload: &[u8]) -> Header {
        let payload_size = i32::try_from(payload.len()).unwrap_or(i32::MAX);
        Header {
            payload_size,
            size_checksum: self.checksum.checksum(&payload_size.to_le_bytes()),
            payload_checksum: self.checksum.checksum(payload),
        }
    }

    /// Frame `payload` into a freshly allocated buffer.
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut dst = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.encode_into(payload, &mut dst);
        dst.freeze()
    }

    /// Append the framed form of `payload` to `dst`.
    pub fn encode_into(&self, payload: &[u8], dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + payload.len());
        self.header_for(payload).write(dst);
        dst.put_slice(payload);
    }

    /// Verify a header and return the payload length it declares.
    ///
    /// Never looks past the header, so a hostile size is rejected before
    /// anything is buffered for it.
    pub fn check_header(&self, header: &Header) -> Result<usize, FrameError> {
        let computed = self.checksum.checksum(&header.payload_size.to_le_bytes());
        if computed != header.size_checksum {
            return Err(FrameError::SizeChecksum {
                expected: header.size_checksum,
                computed,
            });
        }
        if header.payload_size < 0 {
            return Err(FrameError::NegativeSize(header.payload_size));
        }
        let size = header.payload_size as usize;
        if size > self.max_payload {
            return Err(FrameError::TooLarge {
                size,
                limit: self.max_payload,
            });
        }
        Ok(size)
    }

    /// Verify `payload` against the checksum carried in `header`.
    pub fn check_payload(&self, header: &Header, payload: &[u8]) -> Result<(), FrameError> {
        let computed = self.checksum.checksum(payload);
        if computed != header.payload_checksum {
            return Err(FrameError::PayloadChecksum {
                expected: header.payload_checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Decode exactly one frame occupying all of `frame`.
    ///
    /// Returns the verified payload. Trailing or missing bytes are a
    /// `LengthMismatch` even if the payload checksum happens to verify.
    pub fn decode<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8], FrameError> {
        let head: &[u8; HEADER_LEN] = frame
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or(FrameError::Truncated {
                needed: HEADER_LEN,
                available: frame.len(),
            })?;
        let header = Header::parse(head);
        let declared = self.check_header(&header)?;

        let payload = &frame[HEADER_LEN..];
        if payload.len() != declared {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }

        self.check_payload(&header, payload)?;
        Ok(payload)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(ChecksumKind::default())
    }
}
