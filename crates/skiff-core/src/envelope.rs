//! Translation between ratchet types and their wire form, plus the AEAD
//! associated data for sealed frames.
//!
//! Associated data for every sealed frame:
//!
//! ```text
//! "skiff v1 frame" || header (without payload_size) || ratchet header
//!                  || [index_be || prev_link]   (chunks only)
//! ```
//!
//! `payload_size` is left out because it depends on the ciphertext; the
//! frame decoder already checks it against the bytes received.

use skiff_crypto::{KeyAdvert, RatchetHeader};
use skiff_proto::{
    FrameFlags, FrameHeader,
    payloads::transfer::{KeyAdvertWire, RatchetHeaderWire},
};

const AAD_LABEL: &[u8] = b"skiff v1 frame";

pub(crate) fn advert_to_wire(advert: &KeyAdvert) -> KeyAdvertWire {
    KeyAdvertWire {
        generation: advert.generation,
        dh_public: advert.dh_public,
        pq_public: advert.pq_public.clone(),
    }
}

pub(crate) fn advert_from_wire(wire: &KeyAdvertWire) -> KeyAdvert {
    KeyAdvert {
        generation: wire.generation,
        dh_public: wire.dh_public,
        pq_public: wire.pq_public.clone(),
    }
}

pub(crate) fn ratchet_to_wire(header: &RatchetHeader) -> RatchetHeaderWire {
    RatchetHeaderWire {
        epoch: header.epoch,
        counter: header.counter,
        prev_chain_len: header.prev_chain_len,
        dh_public: header.dh_public,
        target_generation: header.target_generation,
        pq_ciphertext: header.pq_ciphertext.clone(),
        advert: header.advert.as_ref().map(advert_to_wire),
    }
}

pub(crate) fn ratchet_from_wire(wire: &RatchetHeaderWire) -> RatchetHeader {
    RatchetHeader {
        epoch: wire.epoch,
        counter: wire.counter,
        prev_chain_len: wire.prev_chain_len,
        dh_public: wire.dh_public,
        target_generation: wire.target_generation,
        pq_ciphertext: wire.pq_ciphertext.clone(),
        advert: wire.advert.as_ref().map(advert_from_wire),
    }
}

/// Flags announcing that `header` opens a new epoch.
pub(crate) fn step_flags(header: &RatchetHeader) -> FrameFlags {
    if header.epoch == 0 || header.counter != 0 {
        return FrameFlags::NONE;
    }
    if header.pq_ciphertext.is_some() {
        FrameFlags::RATCHET_STEP.with(FrameFlags::PQ_STEP)
    } else {
        FrameFlags::RATCHET_STEP
    }
}

/// Associated data binding a sealed frame's cleartext.
///
/// `header` must already carry its final opcode, flags, session id and
/// sequence.
pub(crate) fn frame_aad(
    header: &FrameHeader,
    ratchet: &RatchetHeader,
    chunk: Option<(u64, &[u8; 32])>,
) -> Vec<u8> {
    let mut aad = Vec::with_capacity(AAD_LABEL.len() + FrameHeader::SIZE + 128);
    aad.extend_from_slice(AAD_LABEL);
    aad.extend_from_slice(&header.aad_bytes());
    ratchet.encode_aad(&mut aad);
    if let Some((index, prev_link)) = chunk {
        aad.extend_from_slice(&index.to_be_bytes());
        aad.extend_from_slice(prev_link);
    }
    aad
}

#[cfg(test)]
mod tests {
    use skiff_proto::Opcode;

    use super::*;

    fn ratchet() -> RatchetHeader {
        RatchetHeader {
            epoch: 3,
            counter: 0,
            prev_chain_len: 64,
            dh_public: [4; 32],
            target_generation: 1,
            pq_ciphertext: Some(vec![6; 1088]),
            advert: Some(KeyAdvert { generation: 2, dh_public: [1; 32], pq_public: vec![2; 1184] }),
        }
    }

    #[test]
    fn wire_conversion_preserves_fields() {
        let header = ratchet();
        assert_eq!(ratchet_from_wire(&ratchet_to_wire(&header)), header);
    }

    #[test]
    fn flags_mark_epoch_openers_only() {
        let mut header = ratchet();
        assert_eq!(step_flags(&header), FrameFlags::RATCHET_STEP.with(FrameFlags::PQ_STEP));

        header.pq_ciphertext = None;
        assert_eq!(step_flags(&header), FrameFlags::RATCHET_STEP);

        header.counter = 1;
        assert_eq!(step_flags(&header), FrameFlags::NONE);
    }

    #[test]
    fn aad_binds_sequence_and_chunk_position() {
        let mut frame = FrameHeader::new(Opcode::Chunk);
        frame.set_sequence(9);
        let base = frame_aad(&frame, &ratchet(), Some((9, &[0; 32])));

        assert_ne!(frame_aad(&frame, &ratchet(), Some((10, &[0; 32]))), base);
        assert_ne!(frame_aad(&frame, &ratchet(), Some((9, &[1; 32]))), base);

        frame.set_sequence(10);
        assert_ne!(frame_aad(&frame, &ratchet(), Some((9, &[0; 32]))), base);
    }
}
