//! Frame type combining header and payload.
//!
//! A `Frame` is the transport-layer packet: a 36-byte raw binary header
//! followed by already-encoded payload bytes. For typed payloads see
//! [`Payload::into_frame`](crate::Payload::into_frame) and
//! [`Payload::from_frame`](crate::Payload::from_frame).

use bytes::{BufMut, Bytes};

use crate::{
    FrameHeader,
    errors::{ProtocolError, Result},
};

/// Complete protocol frame
///
/// Layout on the wire:
/// `[FrameHeader: 36 bytes, raw binary] + [payload: variable bytes]`
///
/// # Invariants
///
/// - Size Consistency: `payload.len()` matches `header.payload_size()`.
///   Enforced by [`Frame::new`] and verified by [`Frame::decode`].
/// - Size Limit: `payload.len()` never exceeds
///   [`FrameHeader::MAX_PAYLOAD_SIZE`] on the wire; oversized frames are
///   rejected by [`Frame::encode`].
///
/// A decoded frame is structurally valid only. It is not authenticated until
/// its sealed payload opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,

    /// Raw payload bytes (CBOR-encoded)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame, setting `payload_size` from the payload.
    ///
    /// Payloads longer than `u32::MAX` get a saturated size, which
    /// [`Frame::encode`] then rejects as too large.
    #[must_use]
    pub fn new(mut header: FrameHeader, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let payload_len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        header.payload_size = payload_len.to_be_bytes();
        Self { header, payload }
    }

    /// Encoded length of this frame.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        FrameHeader::SIZE + self.payload.len()
    }

    /// Encode frame into buffer
    ///
    /// Writes `[header] + [payload]`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if the payload exceeds
    ///   `MAX_PAYLOAD_SIZE`
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Same as [`Frame::encode`].
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.wire_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode frame from wire format
    ///
    /// Does not deserialize the payload. Trailing bytes after the claimed
    /// payload are ignored.
    ///
    /// # Errors
    ///
    /// - `ProtocolError` if header parsing fails
    /// - `ProtocolError::FrameTruncated` if fewer payload bytes are present
    ///   than the header claims
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;

        let payload_size = header.payload_size() as usize;
        let total_size = FrameHeader::SIZE + payload_size;

        let Some(payload) = bytes.get(FrameHeader::SIZE..total_size) else {
            return Err(ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            });
        };

        Ok(Self { header: *header, payload: Bytes::copy_from_slice(payload) })
    }
}
