//! Fuzz target for frame header boundary conditions
//!
//! Prevent DoS attacks via malformed frame headers
//!
//! # Strategy
//!
//! - Magic bytes: Valid, off-by-one, all-zeros, all-ones, random
//! - Payload size: Zero, small, at-max, just-over-max, u32::MAX
//! - Version: Valid (0x01), zero, max, random
//! - Session id / sequence: Boundary values (0, MAX)
//!
//! # Invariants
//!
//! - `payload_size > MAX_PAYLOAD_SIZE` (16 MiB) MUST NOT decode
//! - Invalid magic bytes MUST return `ProtocolError::InvalidMagic`
//! - All decode errors MUST be structured (never panic)
//! - Encoded size MUST equal 36 + payload_size

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use skiff_proto::{Frame, FrameFlags, FrameHeader, Opcode, ProtocolError};

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryFrame {
    magic: MagicBytes,
    version: VersionBytes,
    flags: u8,
    opcode: u16,
    payload_size: PayloadSize,
    session_id: SessionId,
    sequence: Sequence,
}

#[derive(Debug, Clone, Arbitrary)]
enum MagicBytes {
    Valid,
    OffByOne(u8),
    AllZeros,
    AllOnes,
    Random([u8; 4]),
}

#[derive(Debug, Clone, Arbitrary)]
enum VersionBytes {
    Valid,
    Zero,
    Max,
    Random(u8),
}

#[derive(Debug, Clone, Arbitrary)]
enum PayloadSize {
    Zero,
    Small(u8),
    AtMaxBoundary,
    JustOverMax,
    MaxU32,
    Random(u32),
}

#[derive(Debug, Clone, Arbitrary)]
enum SessionId {
    Zero,
    MaxU128,
    Random(u128),
}

#[derive(Debug, Clone, Arbitrary)]
enum Sequence {
    Zero,
    One,
    MaxU64,
    Random(u64),
}

fuzz_target!(|boundary: BoundaryFrame| {
    let max = FrameHeader::MAX_PAYLOAD_SIZE;
    let payload_size_value = match boundary.payload_size {
        PayloadSize::Zero => 0,
        PayloadSize::Small(s) => u32::from(s),
        PayloadSize::AtMaxBoundary => max,
        PayloadSize::JustOverMax => max.saturating_add(1),
        PayloadSize::MaxU32 => u32::MAX,
        PayloadSize::Random(r) => r,
    };

    let actual_payload_size = payload_size_value.min(100_000) as usize;
    let mut buffer = vec![0u8; FrameHeader::SIZE + actual_payload_size];
    let magic = FrameHeader::MAGIC.to_be_bytes();

    match boundary.magic {
        MagicBytes::Valid => buffer[0..4].copy_from_slice(&magic),
        MagicBytes::OffByOne(offset) => {
            buffer[0..4].copy_from_slice(&magic);
            let idx = (offset % 4) as usize;
            buffer[idx] = buffer[idx].wrapping_add(1);
        },
        MagicBytes::AllZeros => buffer[0..4].fill(0),
        MagicBytes::AllOnes => buffer[0..4].fill(0xFF),
        MagicBytes::Random(bytes) => buffer[0..4].copy_from_slice(&bytes),
    }

    buffer[4] = match boundary.version {
        VersionBytes::Valid => FrameHeader::VERSION,
        VersionBytes::Zero => 0,
        VersionBytes::Max => u8::MAX,
        VersionBytes::Random(v) => v,
    };
    buffer[5] = boundary.flags;
    buffer[6..8].copy_from_slice(&boundary.opcode.to_be_bytes());
    buffer[8..12].copy_from_slice(&payload_size_value.to_be_bytes());

    let session_id = match boundary.session_id {
        SessionId::Zero => 0,
        SessionId::MaxU128 => u128::MAX,
        SessionId::Random(r) => r,
    };
    buffer[12..28].copy_from_slice(&session_id.to_be_bytes());

    let sequence = match boundary.sequence {
        Sequence::Zero => 0,
        Sequence::One => 1,
        Sequence::MaxU64 => u64::MAX,
        Sequence::Random(r) => r,
    };
    buffer[28..36].copy_from_slice(&sequence.to_be_bytes());

    match Frame::decode(&buffer) {
        Ok(frame) => {
            assert_eq!(buffer[0..4], magic);
            assert!(payload_size_value <= max);
            assert_eq!(frame.header.sequence(), sequence);
            assert_eq!(frame.header.session_id(), &session_id.to_be_bytes());
            assert_eq!(frame.header.flags(), FrameFlags::from_byte(boundary.flags));
        },
        Err(ProtocolError::InvalidMagic) => assert_ne!(buffer[0..4], magic),
        Err(_) => {},
    }

    if let Some(opcode) = Opcode::from_u16(boundary.opcode) {
        let mut header = FrameHeader::new(opcode);
        header.set_session_id(session_id.to_be_bytes());
        header.set_sequence(sequence);

        let frame = Frame::new(header, vec![0xAA; actual_payload_size.min(1000)]);

        let mut encoded = Vec::new();
        if frame.encode(&mut encoded).is_err() {
            return;
        }
        assert_eq!(encoded.len(), FrameHeader::SIZE + frame.payload.len());

        let decoded = Frame::decode(&encoded).expect("encoded frame must decode");
        assert_eq!(decoded.header.sequence(), sequence);
        assert_eq!(decoded.header.opcode_enum(), Some(opcode));
        assert_eq!(decoded.payload, frame.payload);
    }
});
