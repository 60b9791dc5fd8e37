//! Property-based tests for frame and payload encoding
//!
//! These tests verify that framing is correct for all valid inputs and that
//! arbitrary bytes never crash the decoder.

use bytes::Bytes;
use proptest::prelude::*;
use skiff_proto::{
    Frame, FrameFlags, FrameHeader, Opcode, Payload,
    payloads::transfer::{KeyAdvertWire, RatchetHeaderWire, SealedChunk, SealedControl},
};

/// Strategy for generating arbitrary opcodes
fn arbitrary_opcode() -> impl Strategy<Value = Opcode> {
    prop::sample::select(Opcode::ALL.to_vec())
}

/// Strategy for generating arbitrary frame headers
fn arbitrary_header() -> impl Strategy<Value = FrameHeader> {
    (arbitrary_opcode(), any::<[u8; 16]>(), any::<u64>(), any::<u8>()).prop_map(
        |(opcode, session_id, sequence, flags)| {
            let mut header = FrameHeader::new(opcode);
            header.set_session_id(session_id);
            header.set_sequence(sequence);
            header.set_flags(FrameFlags::from_byte(flags));
            header
        },
    )
}

/// Strategy for generating arbitrary frames with payloads
fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (arbitrary_header(), prop::collection::vec(any::<u8>(), 0..1024))
        .prop_map(|(header, payload)| Frame::new(header, Bytes::from(payload)))
}

fn arbitrary_advert() -> impl Strategy<Value = KeyAdvertWire> + Clone {
    (any::<u32>(), any::<[u8; 32]>(), prop::collection::vec(any::<u8>(), 0..64)).prop_map(
        |(generation, dh_public, pq_public)| KeyAdvertWire { generation, dh_public, pq_public },
    )
}

fn arbitrary_ratchet() -> impl Strategy<Value = RatchetHeaderWire> + Clone {
    (
        any::<(u32, u32, u32, u32)>(),
        any::<[u8; 32]>(),
        prop::option::of(prop::collection::vec(any::<u8>(), 0..64)),
        prop::option::of(arbitrary_advert()),
    )
        .prop_map(|((epoch, counter, prev_chain_len, target_generation), dh_public, pq, advert)| {
            RatchetHeaderWire {
                epoch,
                counter,
                prev_chain_len,
                dh_public,
                target_generation,
                pq_ciphertext: pq,
                advert,
            }
        })
}

fn arbitrary_sealed_payload() -> impl Strategy<Value = Payload> {
    let chunk = (
        arbitrary_ratchet(),
        any::<u64>(),
        any::<[u8; 32]>(),
        prop::collection::vec(any::<u8>(), 0..256),
        any::<[u8; 16]>(),
    )
        .prop_map(|(ratchet, index, prev_link, ciphertext, tag)| {
            Payload::Chunk(SealedChunk { ratchet, index, prev_link, ciphertext, tag })
        });
    let control = (arbitrary_ratchet(), prop::collection::vec(any::<u8>(), 0..96), any::<[u8; 16]>())
        .prop_map(|(ratchet, ciphertext, tag)| SealedControl { ratchet, ciphertext, tag });

    prop_oneof![chunk, control.clone().prop_map(Payload::Finish), control.prop_map(Payload::Receipt)]
}

#[test]
fn prop_frame_encode_decode_roundtrip() {
    proptest!(|(frame in arbitrary_frame())| {
        let mut buf = Vec::new();
        frame.encode(&mut buf).expect("encode should succeed");

        let decoded = Frame::decode(&buf).expect("decode should succeed");

        // PROPERTY: Round-trip must be identity
        prop_assert_eq!(decoded.header, frame.header, "Header mismatch after round-trip");
        prop_assert_eq!(decoded.payload, frame.payload, "Payload mismatch after round-trip");
    });
}

#[test]
fn prop_frame_size_matches_header() {
    proptest!(|(frame in arbitrary_frame())| {
        let wire = frame.to_vec().expect("encode should succeed");

        // PROPERTY: wire length = header + claimed payload size
        prop_assert_eq!(wire.len(), FrameHeader::SIZE + frame.header.payload_size() as usize);
    });
}

#[test]
fn prop_sealed_payload_roundtrip() {
    proptest!(|(payload in arbitrary_sealed_payload(), header in arbitrary_header())| {
        let frame = payload.clone().into_frame(header).expect("into_frame should succeed");
        let wire = frame.to_vec().expect("encode should succeed");

        let decoded = Payload::from_frame(&Frame::decode(&wire).expect("decode should succeed"))
            .expect("payload should decode");

        // PROPERTY: the opcode alone recovers the payload type
        prop_assert_eq!(frame.header.opcode_enum(), Some(payload.opcode()));
        prop_assert_eq!(decoded, payload);
    });
}

#[test]
fn prop_decode_never_panics() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..256))| {
        // PROPERTY: arbitrary bytes return a result, never a panic
        if let Ok(frame) = Frame::decode(&bytes) {
            let _ = Payload::from_frame(&frame);
        }
    });
}

#[test]
fn prop_truncation_detected() {
    proptest!(|(frame in arbitrary_frame(), cut in 1usize..64)| {
        let wire = frame.to_vec().expect("encode should succeed");
        prop_assume!(!frame.payload.is_empty());

        let cut = cut.min(frame.payload.len());
        let truncated = &wire[..wire.len() - cut];

        // PROPERTY: a short payload is never accepted
        prop_assert!(Frame::decode(truncated).is_err());
    });
}
