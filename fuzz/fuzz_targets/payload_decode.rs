//! Fuzz target for Payload::from_frame
//!
//! This fuzzer tests payload deserialization (CBOR decoding) with:
//! - Malformed CBOR data
//! - Type confusion attacks (wrong payload type for opcode)
//! - Oversized byte strings or collections
//!
//! The fuzzer should NEVER panic. All invalid inputs should return an error.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use skiff_proto::{Frame, FrameHeader, Opcode, Payload};

fuzz_target!(|data: &[u8]| {
    for opcode in Opcode::ALL {
        let frame = Frame::new(FrameHeader::new(opcode), Bytes::copy_from_slice(data));

        if let Ok(payload) = Payload::from_frame(&frame) {
            // Decoded payloads always carry the opcode they were decoded under.
            assert_eq!(payload.opcode(), opcode);
        }
    }
});
