//! Frame header with zero-copy parsing.
//!
//! The `FrameHeader` is a fixed 36-byte structure serialized as raw binary
//! (Big Endian), so a session can look up the sequence number and opcode of a
//! frame without decoding its payload.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    FrameFlags, Opcode,
    errors::{ProtocolError, Result},
};

/// Fixed 36-byte frame header (Big Endian network byte order)
///
/// Fields are stored as raw byte arrays to avoid alignment issues.
///
/// # Security
///
/// The `#[repr(C, packed)]` layout with zerocopy traits ensures this struct
/// can be safely cast from untrusted network bytes: every 36-byte pattern is a
/// valid value. Parsing validates structure only. Sealed payloads bind
/// [`Self::aad_bytes`] into their AEAD tag, which authenticates every field
/// except `payload_size` (covered implicitly by the ciphertext length).
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FrameHeader {
    // Protocol identification (bytes 0-7)
    magic: [u8; 4], // 0x534B4631 ("SKF1" in ASCII)
    version: u8,    // 0x01
    flags: u8,      // FrameFlags bitfield
    pub(crate) opcode: [u8; 2],

    // Payload metadata (bytes 8-11)
    pub(crate) payload_size: [u8; 4],

    // Session binding (bytes 12-27)
    session_id: [u8; 16],

    // Per-direction sequence number (bytes 28-35)
    sequence: [u8; 8],
}

impl FrameHeader {
    /// Size of the serialized header
    pub const SIZE: usize = 36;

    /// Magic number: "SKF1" in ASCII (0x534B4631)
    pub const MAGIC: u32 = 0x534B_4631;

    /// Current framing version
    pub const VERSION: u8 = 0x01;

    /// Maximum payload size (16 MiB)
    pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

    /// Create a new header with the specified opcode.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&Self::MAGIC.to_be_bytes());
        bytes[4] = Self::VERSION;
        bytes[6..8].copy_from_slice(&opcode.to_u16().to_be_bytes());

        let Ok(header) = Self::from_bytes(&bytes) else {
            unreachable!("constructed header has valid magic and version")
        };
        *header
    }

    /// Parse header from network bytes (zero-copy, safe)
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if the buffer is under 36 bytes
    /// - `ProtocolError::InvalidMagic` if the magic number is wrong
    /// - `ProtocolError::UnsupportedVersion` if the version is unknown
    /// - `ProtocolError::PayloadTooLarge` if the claimed size exceeds the limit
    ///
    /// Cheap checks run first so garbage is rejected before anything else.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::FrameTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if u32::from_be_bytes(header.magic) != Self::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        if header.version != Self::VERSION {
            return Err(ProtocolError::UnsupportedVersion(header.version));
        }

        let payload_size = u32::from_be_bytes(header.payload_size);
        if payload_size > Self::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_size as usize,
                max: Self::MAX_PAYLOAD_SIZE as usize,
            });
        }

        Ok(header)
    }

    /// Serialize header to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(IntoBytes::as_bytes(self));
        arr
    }

    /// Header bytes bound into a sealed payload's AAD.
    ///
    /// Everything except `payload_size`: bytes 0-7 and 12-35.
    #[must_use]
    pub fn aad_bytes(&self) -> [u8; Self::SIZE - 4] {
        let bytes = self.to_bytes();
        let mut data = [0u8; Self::SIZE - 4];
        data[..8].copy_from_slice(&bytes[..8]);
        data[8..].copy_from_slice(&bytes[12..]);
        data
    }

    /// Protocol magic number.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_be_bytes(self.magic)
    }

    /// Framing version byte.
    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Frame flags.
    #[must_use]
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_byte(self.flags)
    }

    /// Operation code as raw u16.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_be_bytes(self.opcode)
    }

    /// Operation code as enum. `None` if unrecognized.
    #[must_use]
    pub fn opcode_enum(&self) -> Option<Opcode> {
        Opcode::from_u16(self.opcode())
    }

    /// Payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> u32 {
        u32::from_be_bytes(self.payload_size)
    }

    /// Session the frame belongs to.
    #[must_use]
    pub fn session_id(&self) -> &[u8; 16] {
        &self.session_id
    }

    /// Per-direction sequence number.
    ///
    /// For sealed frames this is the nonce counter. Handshake and abort
    /// frames carry zero.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        u64::from_be_bytes(self.sequence)
    }

    /// Update frame flags.
    pub fn set_flags(&mut self, flags: FrameFlags) {
        self.flags = flags.to_byte();
    }

    /// Update session id.
    pub fn set_session_id(&mut self, session_id: [u8; 16]) {
        self.session_id = session_id;
    }

    /// Update sequence number.
    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence.to_be_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameHeader")
            .field("magic", &format!("{:#010x}", self.magic()))
            .field("version", &self.version())
            .field("flags", &self.flags())
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("payload_size", &self.payload_size())
            .field("session_id", &format!("{:#034x}", u128::from_be_bytes(self.session_id)))
            .field("sequence", &self.sequence())
            .finish()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for FrameHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for FrameHeader {}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    impl Arbitrary for FrameHeader {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            (
                any::<u16>(),                  // opcode
                any::<u8>(),                   // flags
                0u32..=Self::MAX_PAYLOAD_SIZE, // payload_size
                any::<[u8; 16]>(),             // session_id
                any::<u64>(),                  // sequence
            )
                .prop_map(|(opcode, flags, payload_size, session_id, sequence)| Self {
                    magic: Self::MAGIC.to_be_bytes(),
                    version: Self::VERSION,
                    flags,
                    opcode: opcode.to_be_bytes(),
                    payload_size: payload_size.to_be_bytes(),
                    session_id,
                    sequence: sequence.to_be_bytes(),
                })
                .boxed()
        }
    }

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<FrameHeader>(), FrameHeader::SIZE);
    }

    proptest! {
        #[test]
        fn header_round_trip(header in any::<FrameHeader>()) {
            let bytes = header.to_bytes();
            let parsed = FrameHeader::from_bytes(&bytes).expect("should parse");
            prop_assert_eq!(&header, parsed);
        }

        #[test]
        fn aad_ignores_only_payload_size(header in any::<FrameHeader>(), size in any::<u32>()) {
            let mut resized = header;
            resized.payload_size = size.to_be_bytes();
            prop_assert_eq!(header.aad_bytes(), resized.aad_bytes());
        }
    }

    #[test]
    fn aad_covers_sequence_and_session() {
        let mut a = FrameHeader::new(Opcode::Chunk);
        let b = a;
        a.set_sequence(1);
        assert_ne!(a.aad_bytes(), b.aad_bytes());

        let mut c = b;
        c.set_session_id([9; 16]);
        assert_ne!(c.aad_bytes(), b.aad_bytes());
    }

    #[test]
    fn reject_short_buffer() {
        let result = FrameHeader::from_bytes(&[0u8; 20]);
        assert_eq!(result, Err(ProtocolError::FrameTooShort { expected: 36, actual: 20 }));
    }

    #[test]
    fn reject_invalid_magic() {
        let mut buf = [0u8; 36];
        buf[0..4].copy_from_slice(&[0xFF; 4]);
        buf[4] = FrameHeader::VERSION;
        assert_eq!(FrameHeader::from_bytes(&buf), Err(ProtocolError::InvalidMagic));
    }

    #[test]
    fn reject_invalid_version() {
        let mut buf = [0u8; 36];
        buf[0..4].copy_from_slice(&FrameHeader::MAGIC.to_be_bytes());
        buf[4] = 0xFF;
        assert_eq!(FrameHeader::from_bytes(&buf), Err(ProtocolError::UnsupportedVersion(0xFF)));
    }

    #[test]
    fn reject_oversized_payload() {
        let mut buf = FrameHeader::new(Opcode::Chunk).to_bytes();
        buf[8..12].copy_from_slice(&(FrameHeader::MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        assert!(matches!(
            FrameHeader::from_bytes(&buf),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }
}
