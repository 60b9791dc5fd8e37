//! CBOR-encoded protocol messages.
//!
//! Frame headers are raw binary, payloads are CBOR. The payload type is
//! determined by the header's opcode, so only the inner struct is serialized
//! (no variant tag).
//!
//! # Invariants
//!
//! Each payload variant maps to exactly one opcode (enforced by match
//! exhaustiveness). Decoding an encoded payload with its own opcode yields an
//! equal value.

pub mod handshake;
pub mod transfer;

use bytes::BufMut;
use serde::de::DeserializeOwned;

use crate::{
    Frame, FrameHeader, Opcode,
    errors::{ProtocolError, Result},
};

/// All frame payloads
///
/// # Security
///
/// The opcode in the header is the only type discriminator. A payload that
/// does not decode as the type its opcode names is rejected, never
/// reinterpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Initiator's handshake offer
    Hello(handshake::Hello),
    /// Responder's handshake answer
    HelloReply(handshake::HelloReply),
    /// Session abort
    Abort(handshake::Abort),
    /// Encrypted file chunk
    Chunk(transfer::SealedChunk),
    /// Sealed manifest summary
    Finish(transfer::SealedControl),
    /// Sealed receipt for a verified manifest
    Receipt(transfer::SealedControl),
}

impl Payload {
    /// Opcode corresponding to this payload type.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::Hello(_) => Opcode::Hello,
            Self::HelloReply(_) => Opcode::HelloReply,
            Self::Abort(_) => Opcode::Abort,
            Self::Chunk(_) => Opcode::Chunk,
            Self::Finish(_) => Opcode::Finish,
            Self::Receipt(_) => Opcode::Receipt,
        }
    }

    /// Encode payload to buffer
    ///
    /// Serializes only the inner struct. Size limits are enforced later by
    /// [`Frame::encode`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let mut writer = dst.writer();

        match self {
            Self::Hello(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::HelloReply(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Abort(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Chunk(inner) => ciborium::ser::into_writer(inner, &mut writer),
            Self::Finish(inner) | Self::Receipt(inner) => {
                ciborium::ser::into_writer(inner, &mut writer)
            },
        }
        .map_err(|e| ProtocolError::CborEncode(e.to_string()))
    }

    /// Decode payload bytes for `opcode`
    ///
    /// The size check runs before any CBOR parsing.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if bytes exceed `MAX_PAYLOAD_SIZE`
    /// - `ProtocolError::CborDecode` if CBOR deserialization fails
    pub fn decode(opcode: Opcode, bytes: &[u8]) -> Result<Self> {
        if bytes.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(match opcode {
            Opcode::Hello => Self::Hello(cbor(bytes)?),
            Opcode::HelloReply => Self::HelloReply(cbor(bytes)?),
            Opcode::Abort => Self::Abort(cbor(bytes)?),
            Opcode::Chunk => Self::Chunk(cbor(bytes)?),
            Opcode::Finish => Self::Finish(cbor(bytes)?),
            Opcode::Receipt => Self::Receipt(cbor(bytes)?),
        })
    }

    /// Convert payload into a transport frame
    ///
    /// Encodes the payload, sets the opcode in `header` and builds a frame
    /// with the matching `payload_size`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::CborEncode` if serialization fails
    pub fn into_frame(self, mut header: FrameHeader) -> Result<Frame> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        header.opcode = self.opcode().to_u16().to_be_bytes();
        Ok(Frame::new(header, buf))
    }

    /// Parse payload from a raw transport frame
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownOpcode` if the opcode is not recognized
    /// - errors from [`Payload::decode`]
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let opcode = frame
            .header
            .opcode_enum()
            .ok_or(ProtocolError::UnknownOpcode(frame.header.opcode()))?;
        Self::decode(opcode, &frame.payload)
    }
}

fn cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::{
        handshake::{Abort, Hello},
        transfer::{KeyAdvertWire, RatchetHeaderWire, SealedChunk},
        *,
    };

    fn ratchet_header() -> RatchetHeaderWire {
        RatchetHeaderWire {
            epoch: 2,
            counter: 17,
            prev_chain_len: 64,
            dh_public: [5; 32],
            target_generation: 1,
            pq_ciphertext: Some(vec![9; 1088]),
            advert: None,
        }
    }

    #[test]
    fn abort_round_trip() {
        let payload = Payload::Abort(Abort { code: Abort::CANCELLED });
        let frame = payload.clone().into_frame(FrameHeader::new(Opcode::Hello)).unwrap();

        assert_eq!(frame.header.opcode_enum(), Some(Opcode::Abort));
        assert_eq!(Payload::from_frame(&frame).unwrap(), payload);
    }

    #[test]
    fn chunk_round_trip() {
        let payload = Payload::Chunk(SealedChunk {
            ratchet: ratchet_header(),
            index: 700,
            prev_link: [3; 32],
            ciphertext: vec![0xAB; 300],
            tag: [1; 16],
        });
        let frame = payload.clone().into_frame(FrameHeader::new(Opcode::Chunk)).unwrap();
        assert_eq!(Payload::from_frame(&frame).unwrap(), payload);
    }

    #[test]
    fn byte_fields_encode_compactly() {
        let payload = Payload::Hello(Hello {
            version: 1,
            x25519_public: [7; 32],
            mlkem_public: vec![1; 1184],
            cipher_suites: vec![1, 2],
            keyset: KeyAdvertWire { generation: 0, dh_public: [8; 32], pq_public: vec![2; 1184] },
        });
        let mut buf = Vec::new();
        payload.encode(&mut buf).unwrap();

        // Byte strings, not arrays of integers
        assert!(buf.len() < 2 * 1184 + 2 * 32 + 64);
    }

    #[test]
    fn opcode_mismatch_rejected() {
        let payload = Payload::Abort(Abort { code: Abort::PROTOCOL_VIOLATION });
        let mut buf = Vec::new();
        payload.encode(&mut buf).unwrap();

        assert!(matches!(Payload::decode(Opcode::Chunk, &buf), Err(ProtocolError::CborDecode(_))));
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut frame = Frame::new(FrameHeader::new(Opcode::Chunk), Vec::new());
        frame.header.opcode = 0x7777u16.to_be_bytes();
        assert_eq!(Payload::from_frame(&frame), Err(ProtocolError::UnknownOpcode(0x7777)));
    }
}
