//! Skiff wire protocol
//!
//! Every message between two peers is a [`Frame`]: a fixed 36-byte binary
//! header followed by a CBOR payload whose type is selected by the header's
//! [`Opcode`].
//!
//! The header is parsed zero-copy and carries everything needed to route and
//! authenticate a frame before its payload is touched: the session id, a
//! per-direction sequence number (the nonce counter for sealed frames) and
//! step flags. Sealed payloads authenticate the header through their AAD, so
//! a relay that rewrites any header field breaks the tag.

#![deny(missing_docs)]

pub mod errors;
mod frame;
mod header;
pub mod payloads;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use payloads::Payload;

/// Operation code carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Initiator's handshake offer
    Hello = 0x0001,
    /// Responder's handshake answer
    HelloReply = 0x0002,
    /// Session abort (either side)
    Abort = 0x0003,
    /// Encrypted file chunk
    Chunk = 0x0010,
    /// Sealed manifest summary, sent after the last chunk
    Finish = 0x0011,
    /// Sealed confirmation that the manifest verified
    Receipt = 0x0012,
}

impl Opcode {
    /// Every opcode, in wire order.
    pub const ALL: [Self; 6] =
        [Self::Hello, Self::HelloReply, Self::Abort, Self::Chunk, Self::Finish, Self::Receipt];

    /// Wire value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value. `None` if unrecognized.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Hello),
            0x0002 => Some(Self::HelloReply),
            0x0003 => Some(Self::Abort),
            0x0010 => Some(Self::Chunk),
            0x0011 => Some(Self::Finish),
            0x0012 => Some(Self::Receipt),
            _ => None,
        }
    }

    /// Whether the payload is sealed with a ratchet message key.
    #[must_use]
    pub const fn is_sealed(self) -> bool {
        matches!(self, Self::Chunk | Self::Finish | Self::Receipt)
    }
}

/// Frame flag bits.
///
/// Informational: the authoritative step information lives in the sealed
/// ratchet header. Flags are still covered by the AAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set
    pub const NONE: Self = Self(0);
    /// Frame opens a new ratchet epoch
    pub const RATCHET_STEP: Self = Self(0x01);
    /// The epoch step includes a post-quantum encapsulation
    pub const PQ_STEP: Self = Self(0x02);
    /// Frame re-sends an earlier chunk
    pub const RETRANSMIT: Self = Self(0x04);

    /// Raw flag byte.
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        self.0
    }

    /// Flags from a raw byte. Unknown bits are preserved.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Whether every bit in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of both flag sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for opcode in Opcode::ALL {
            assert_eq!(Opcode::from_u16(opcode.to_u16()), Some(opcode));
        }
        assert_eq!(Opcode::from_u16(0xFFFF), None);
    }

    #[test]
    fn sealed_opcodes() {
        assert!(Opcode::Chunk.is_sealed());
        assert!(Opcode::Receipt.is_sealed());
        assert!(!Opcode::Hello.is_sealed());
        assert!(!Opcode::Abort.is_sealed());
    }

    #[test]
    fn flags_compose() {
        let flags = FrameFlags::RATCHET_STEP.with(FrameFlags::PQ_STEP);
        assert!(flags.contains(FrameFlags::RATCHET_STEP));
        assert!(flags.contains(FrameFlags::PQ_STEP));
        assert!(!flags.contains(FrameFlags::RETRANSMIT));
        assert_eq!(FrameFlags::from_byte(flags.to_byte()), flags);
    }
}
