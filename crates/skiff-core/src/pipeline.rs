//! Batch sealing on a worker pool.
//!
//! Everything order-dependent (ratchet keys, nonces, manifest links) is
//! derived sequentially by the session before a batch gets here. Only the
//! AEAD work fans out, so the N-th chunk always carries the N-th key no matter
//! which worker seals it.

use rayon::prelude::*;
use skiff_crypto::{ChunkCipher, DirectionalNonce, MessageKey, RatchetHeader};
use skiff_proto::{Frame, FrameHeader, Payload, ProtocolError, payloads::transfer::SealedChunk};

use crate::envelope;

/// Batches smaller than this are sealed on the calling thread.
const PARALLEL_THRESHOLD: usize = 4;

/// A chunk with all of its keying decided, waiting for encryption.
pub(crate) struct PreparedChunk<'a> {
    pub(crate) header: FrameHeader,
    pub(crate) ratchet: RatchetHeader,
    pub(crate) key: MessageKey,
    pub(crate) nonce: DirectionalNonce,
    pub(crate) index: u64,
    pub(crate) prev_link: [u8; 32],
    pub(crate) plaintext: &'a [u8],
}

impl PreparedChunk<'_> {
    /// Encrypt and frame. Consumes (and so wipes) the message key.
    pub(crate) fn seal(self, cipher: &ChunkCipher) -> Result<Frame, ProtocolError> {
        let aad =
            envelope::frame_aad(&self.header, &self.ratchet, Some((self.index, &self.prev_link)));
        let record = cipher.seal_chunk(self.index, self.plaintext, &self.key, self.nonce, &aad);

        Payload::Chunk(SealedChunk {
            ratchet: envelope::ratchet_to_wire(&self.ratchet),
            index: record.index,
            prev_link: self.prev_link,
            ciphertext: record.ciphertext,
            tag: record.tag,
        })
        .into_frame(self.header)
    }
}

/// Seal a batch, returning frames in the order the chunks were prepared.
pub(crate) fn seal_all(
    cipher: &ChunkCipher,
    prepared: Vec<PreparedChunk<'_>>,
) -> Result<Vec<Frame>, ProtocolError> {
    if prepared.len() < PARALLEL_THRESHOLD {
        return prepared.into_iter().map(|chunk| chunk.seal(cipher)).collect();
    }
    prepared.into_par_iter().map(|chunk| chunk.seal(cipher)).collect()
}
