//! Transfer manifest: hash chain over chunks plus a whole-file digest.
//!
//! ```text
//! genesis  = BLAKE3-derive("genesis")(session_id || direction)
//! content  = BLAKE3-derive("chunk content")(index || len || plaintext)
//! link[i]  = BLAKE3-derive("manifest link")(link[i-1] || index || content)
//! ```
//!
//! Every chunk frame carries `link[i-1]` as authenticated data. The receiver
//! recomputes the chain in index order and compares the claimed link in
//! constant time, so a chunk that authenticates but sits at the wrong position
//! (or follows a missing chunk) is caught even if its AEAD key was
//! compromised. The final link and a plain BLAKE3 digest of the file bytes
//! make up the [`ManifestSummary`] exchanged at the end of the transfer.
//!
//! Hashes cover plaintext, not ciphertext: a retransmitted chunk is sealed
//! under a fresh key and nonce but still verifies against the same link.

use std::collections::BTreeMap;

use crate::{
    ct::{ct_eq, ct_eq_32},
    error::{CryptoError, IntegrityError, ResourceError},
    nonce::Direction,
};

/// Size of every manifest hash.
pub const DIGEST_SIZE: usize = 32;

/// Encoded size of a [`ManifestSummary`].
pub const SUMMARY_SIZE: usize = 8 + 8 + DIGEST_SIZE + DIGEST_SIZE;

/// Default bound on chunks buffered ahead of a gap.
pub const DEFAULT_MAX_PENDING_CHUNKS: usize = 1024;

const GENESIS_CONTEXT: &str = "skiff v1 manifest genesis";
const CONTENT_CONTEXT: &str = "skiff v1 chunk content";
const LINK_CONTEXT: &str = "skiff v1 manifest link";

/// Hash of one chunk's position, length and plaintext.
pub fn content_hash(index: u64, plaintext: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = blake3::Hasher::new_derive_key(CONTENT_CONTEXT);
    hasher.update(&index.to_be_bytes());
    hasher.update(&(plaintext.len() as u64).to_be_bytes());
    hasher.update(plaintext);
    *hasher.finalize().as_bytes()
}

fn link(prev: &[u8; DIGEST_SIZE], index: u64, content: &[u8; DIGEST_SIZE]) -> [u8; DIGEST_SIZE] {
    let mut hasher = blake3::Hasher::new_derive_key(LINK_CONTEXT);
    hasher.update(prev);
    hasher.update(&index.to_be_bytes());
    hasher.update(content);
    *hasher.finalize().as_bytes()
}

fn genesis(session_id: &[u8; 16], direction: Direction) -> [u8; DIGEST_SIZE] {
    let mut hasher = blake3::Hasher::new_derive_key(GENESIS_CONTEXT);
    hasher.update(session_id);
    hasher.update(&direction.tag());
    *hasher.finalize().as_bytes()
}

/// End-of-transfer commitment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestSummary {
    /// Number of chunks
    pub chunk_count: u64,
    /// Sum of plaintext lengths
    pub total_bytes: u64,
    /// Final chain link
    pub chain_digest: [u8; DIGEST_SIZE],
    /// BLAKE3 of the concatenated plaintext
    pub file_digest: [u8; DIGEST_SIZE],
}

impl ManifestSummary {
    /// Fixed-size big-endian encoding.
    pub fn to_bytes(&self) -> [u8; SUMMARY_SIZE] {
        let mut out = [0u8; SUMMARY_SIZE];
        out[0..8].copy_from_slice(&self.chunk_count.to_be_bytes());
        out[8..16].copy_from_slice(&self.total_bytes.to_be_bytes());
        out[16..48].copy_from_slice(&self.chain_digest);
        out[48..80].copy_from_slice(&self.file_digest);
        out
    }

    /// Parse the encoding produced by [`to_bytes`](Self::to_bytes).
    ///
    /// # Errors
    ///
    /// - `IntegrityError::MalformedSummary` on any other length
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IntegrityError> {
        let Ok(raw) = <&[u8; SUMMARY_SIZE]>::try_from(bytes) else {
            return Err(IntegrityError::MalformedSummary { len: bytes.len() });
        };

        let mut count = [0u8; 8];
        let mut total = [0u8; 8];
        let mut chain_digest = [0u8; DIGEST_SIZE];
        let mut file_digest = [0u8; DIGEST_SIZE];
        count.copy_from_slice(&raw[0..8]);
        total.copy_from_slice(&raw[8..16]);
        chain_digest.copy_from_slice(&raw[16..48]);
        file_digest.copy_from_slice(&raw[48..80]);

        Ok(Self {
            chunk_count: u64::from_be_bytes(count),
            total_bytes: u64::from_be_bytes(total),
            chain_digest,
            file_digest,
        })
    }

    /// Constant-time equality over the whole summary.
    pub fn ct_matches(&self, other: &Self) -> bool {
        ct_eq(&self.to_bytes(), &other.to_bytes())
    }
}

/// What the sender records about one appended chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Chunk index
    pub index: u64,
    /// Chain link before this chunk (sent with the chunk)
    pub prev_link: [u8; DIGEST_SIZE],
    /// Content hash of the chunk
    pub content_hash: [u8; DIGEST_SIZE],
    /// Plaintext length
    pub len: u64,
}

/// Sender-side manifest builder.
#[derive(Debug, Clone)]
pub struct TransferManifest {
    head: [u8; DIGEST_SIZE],
    total_bytes: u64,
    file: blake3::Hasher,
    entries: Vec<ManifestEntry>,
}

impl TransferManifest {
    /// Start an empty manifest for one direction of a session.
    pub fn new(session_id: &[u8; 16], direction: Direction) -> Self {
        Self {
            head: genesis(session_id, direction),
            total_bytes: 0,
            file: blake3::Hasher::new(),
            entries: Vec::new(),
        }
    }

    /// Append the next chunk. Indices are assigned sequentially from 0.
    pub fn append(&mut self, plaintext: &[u8]) -> ManifestEntry {
        let index = self.entries.len() as u64;
        let content_hash = content_hash(index, plaintext);
        let entry =
            ManifestEntry { index, prev_link: self.head, content_hash, len: plaintext.len() as u64 };

        self.head = link(&self.head, index, &content_hash);
        self.total_bytes += plaintext.len() as u64;
        self.file.update(plaintext);
        self.entries.push(entry);
        entry
    }

    /// Recorded entry for `index`, for retransmission.
    pub fn entry(&self, index: u64) -> Option<&ManifestEntry> {
        self.entries.get(usize::try_from(index).ok()?)
    }

    /// Chunks appended so far.
    pub fn chunk_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Commitment over everything appended so far.
    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            chunk_count: self.chunk_count(),
            total_bytes: self.total_bytes,
            chain_digest: self.head,
            file_digest: *self.file.finalize().as_bytes(),
        }
    }
}

/// A chunk whose position in the chain has been verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedChunk {
    /// Chunk index
    pub index: u64,
    /// Plaintext
    pub plaintext: Vec<u8>,
}

#[derive(Debug)]
struct PendingChunk {
    prev_link: [u8; DIGEST_SIZE],
    plaintext: Vec<u8>,
}

/// Receiver-side manifest verifier.
///
/// # Invariants
///
/// - Chunks are applied to the chain strictly in index order; anything ahead
///   of a gap waits in a bounded buffer.
/// - Once a fatal mismatch is seen the verifier stays failed.
/// - Complete only after every declared chunk verified and all digests
///   matched.
#[derive(Debug)]
pub struct IntegrityVerifier {
    head: [u8; DIGEST_SIZE],
    next_index: u64,
    total_bytes: u64,
    file: blake3::Hasher,
    pending: BTreeMap<u64, PendingChunk>,
    max_pending: usize,
    expected: Option<ManifestSummary>,
    complete: bool,
    failed: bool,
}

impl IntegrityVerifier {
    /// Start verifying one direction of a session.
    pub fn new(session_id: &[u8; 16], direction: Direction, max_pending: usize) -> Self {
        Self {
            head: genesis(session_id, direction),
            next_index: 0,
            total_bytes: 0,
            file: blake3::Hasher::new(),
            pending: BTreeMap::new(),
            max_pending,
            expected: None,
            complete: false,
            failed: false,
        }
    }

    /// Chunks verified in sequence so far.
    pub fn verified_chunks(&self) -> u64 {
        self.next_index
    }

    /// Chunk count declared by the sender's summary, once received.
    pub fn expected_chunks(&self) -> Option<u64> {
        self.expected.map(|summary| summary.chunk_count)
    }

    /// Chunks waiting behind a gap.
    pub fn pending_chunks(&self) -> usize {
        self.pending.len()
    }

    /// Index of the first chunk still missing.
    pub fn next_missing(&self) -> u64 {
        self.next_index
    }

    /// Whether every chunk has been verified in order and the final digests
    /// matched.
    pub fn verify_manifest_complete(&self) -> bool {
        self.complete && !self.failed
    }

    /// Whether a fatal mismatch was seen.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Summary of what has been verified so far.
    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            chunk_count: self.next_index,
            total_bytes: self.total_bytes,
            chain_digest: self.head,
            file_digest: *self.file.finalize().as_bytes(),
        }
    }

    /// Check whether `index` could still be accepted (not verified, not
    /// buffered, not beyond the declared count).
    ///
    /// Lets the caller refuse a duplicate before spending work on it.
    pub fn check_index(&self, index: u64) -> Result<(), IntegrityError> {
        if index < self.next_index || self.pending.contains_key(&index) {
            return Err(IntegrityError::DuplicateChunk { index });
        }
        if let Some(expected) = self.expected {
            if index >= expected.chunk_count {
                return Err(IntegrityError::UnexpectedChunk { index, count: expected.chunk_count });
            }
        }
        Ok(())
    }

    /// Check that [`accept`](Self::accept) would take chunk `index` without a
    /// recoverable refusal.
    ///
    /// Run before anything is spent on the chunk (its ratchet key, its nonce),
    /// so a chunk refused here can still be accepted when it arrives again.
    ///
    /// # Errors
    ///
    /// - `IntegrityError::DuplicateChunk` for a chunk already seen
    /// - `IntegrityError::UnexpectedChunk` for an index beyond the declared count
    /// - `ResourceError::ReorderBufferFull` if the chunk would have to wait and
    ///   the buffer is full
    pub fn admit(&self, index: u64) -> Result<(), CryptoError> {
        if self.failed {
            return Err(IntegrityError::ChainMismatch { index }.into());
        }
        self.check_index(index)?;
        if index > self.next_index && self.pending.len() >= self.max_pending {
            return Err(ResourceError::ReorderBufferFull { capacity: self.max_pending }.into());
        }
        Ok(())
    }

    /// Accept an authenticated chunk.
    ///
    /// Returns every chunk that became verifiable, in index order (possibly
    /// none if `index` is ahead of a gap).
    ///
    /// # Errors
    ///
    /// - `IntegrityError::DuplicateChunk` (recoverable) for a chunk already seen
    /// - `IntegrityError::UnexpectedChunk` for an index beyond the declared count
    /// - `IntegrityError::ChainMismatch` if a claimed link is wrong
    /// - `IntegrityError` digest variants if this chunk completes the manifest
    ///   and the final digests disagree
    /// - `ResourceError::ReorderBufferFull` (recoverable) if the chunk would
    ///   have to wait and the buffer is full
    pub fn accept(
        &mut self,
        index: u64,
        prev_link: &[u8; DIGEST_SIZE],
        plaintext: Vec<u8>,
    ) -> Result<Vec<VerifiedChunk>, CryptoError> {
        if self.failed {
            return Err(IntegrityError::ChainMismatch { index }.into());
        }
        self.check_index(index).map_err(|err| self.fail_if_fatal(err))?;

        if index > self.next_index {
            if self.pending.len() >= self.max_pending {
                return Err(ResourceError::ReorderBufferFull { capacity: self.max_pending }.into());
            }
            self.pending.insert(index, PendingChunk { prev_link: *prev_link, plaintext });
            return Ok(Vec::new());
        }

        let mut verified = Vec::new();
        self.apply(index, prev_link, plaintext, &mut verified)?;
        while let Some(chunk) = self.pending.remove(&self.next_index) {
            self.apply(self.next_index, &chunk.prev_link, chunk.plaintext, &mut verified)?;
        }
        self.try_complete()?;
        Ok(verified)
    }

    /// Record the sender's final summary and complete if everything arrived.
    ///
    /// Returns whether the manifest is now complete.
    ///
    /// # Errors
    ///
    /// - `IntegrityError::ConflictingManifest` if a different summary was
    ///   already recorded
    /// - `IntegrityError::UnexpectedChunk` if chunks beyond the declared count
    ///   were already received
    /// - digest and length variants if the transfer is complete but differs
    pub fn finish(&mut self, summary: ManifestSummary) -> Result<bool, IntegrityError> {
        if self.failed {
            return Err(IntegrityError::ChainDigestMismatch);
        }
        if let Some(existing) = self.expected {
            if !existing.ct_matches(&summary) {
                return Err(self.fail(IntegrityError::ConflictingManifest));
            }
        }

        let count = summary.chunk_count;
        let last_seen = self.pending.keys().next_back().copied().or(self.next_index.checked_sub(1));
        if let Some(index) = last_seen.filter(|&index| index >= count) {
            return Err(self.fail(IntegrityError::UnexpectedChunk { index, count }));
        }

        self.expected = Some(summary);
        self.try_complete()?;
        Ok(self.complete)
    }

    fn apply(
        &mut self,
        index: u64,
        prev_link: &[u8; DIGEST_SIZE],
        plaintext: Vec<u8>,
        verified: &mut Vec<VerifiedChunk>,
    ) -> Result<(), IntegrityError> {
        if !ct_eq_32(prev_link, &self.head) {
            return Err(self.fail(IntegrityError::ChainMismatch { index }));
        }

        let content = content_hash(index, &plaintext);
        self.head = link(&self.head, index, &content);
        self.total_bytes += plaintext.len() as u64;
        self.file.update(&plaintext);
        self.next_index = index + 1;
        verified.push(VerifiedChunk { index, plaintext });
        Ok(())
    }

    fn try_complete(&mut self) -> Result<(), IntegrityError> {
        let Some(expected) = self.expected else {
            return Ok(());
        };
        if self.complete || self.next_index != expected.chunk_count {
            return Ok(());
        }

        let actual = self.summary();
        if actual.total_bytes != expected.total_bytes {
            return Err(self.fail(IntegrityError::LengthMismatch {
                expected: expected.total_bytes,
                actual: actual.total_bytes,
            }));
        }
        let chain_ok = ct_eq_32(&actual.chain_digest, &expected.chain_digest);
        let file_ok = ct_eq_32(&actual.file_digest, &expected.file_digest);
        if !chain_ok {
            return Err(self.fail(IntegrityError::ChainDigestMismatch));
        }
        if !file_ok {
            return Err(self.fail(IntegrityError::FileDigestMismatch));
        }

        self.complete = true;
        Ok(())
    }

    fn fail(&mut self, err: IntegrityError) -> IntegrityError {
        self.failed = true;
        self.pending.clear();
        err
    }

    fn fail_if_fatal(&mut self, err: IntegrityError) -> IntegrityError {
        if err.is_fatal() { self.fail(err) } else { err }
    }
}
