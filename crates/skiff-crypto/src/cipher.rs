//! Chunk AEAD transform.
//!
//! A [`CipherSuite`] is negotiated once during the handshake and resolved into
//! a [`ChunkCipher`] holding plain function pointers, so no per-chunk dispatch
//! on the suite takes place.
//!
//! # Authenticate before release
//!
//! [`ChunkCipher::decrypt`] decrypts into a scratch buffer that is wiped on
//! drop. The buffer is returned to the caller only after the tag verified. On
//! failure the caller gets [`AuthError::TagMismatch`] and nothing else; some
//! AEAD implementations apply the keystream before comparing tags, which is
//! why the scratch buffer is never exposed on the error path.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{AeadInPlace, KeyInit, generic_array::GenericArray},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    error::{AuthError, HandshakeError},
    nonce::{DirectionalNonce, NONCE_SALT_SIZE},
    ratchet::MessageKey,
};

/// Detached authentication tag size for every supported suite.
pub const TAG_SIZE: usize = 16;

/// Supported AEAD algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherSuite {
    /// XChaCha20-Poly1305 with 24-byte salted nonces
    XChaCha20Poly1305,
    /// AES-256-GCM with 12-byte nonces
    Aes256Gcm,
}

impl CipherSuite {
    /// Every supported suite, in default preference order.
    pub const ALL: [Self; 2] = [Self::XChaCha20Poly1305, Self::Aes256Gcm];

    /// Wire identifier.
    pub const fn id(self) -> u8 {
        match self {
            Self::XChaCha20Poly1305 => 0x01,
            Self::Aes256Gcm => 0x02,
        }
    }

    /// Parse a wire identifier.
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::XChaCha20Poly1305),
            0x02 => Some(Self::Aes256Gcm),
            _ => None,
        }
    }

    /// Nonce length in bytes.
    pub const fn nonce_len(self) -> usize {
        match self {
            Self::XChaCha20Poly1305 => 24,
            Self::Aes256Gcm => 12,
        }
    }

    /// Pick the first suite in `ours` (our preference order) that the peer
    /// offered.
    ///
    /// Unknown peer identifiers are ignored.
    pub fn negotiate(ours: &[Self], theirs: &[u8]) -> Result<Self, HandshakeError> {
        ours.iter()
            .copied()
            .find(|suite| theirs.contains(&suite.id()))
            .ok_or(HandshakeError::NoCommonCipherSuite)
    }
}

type SealFn = fn(&[u8; 32], &[u8], &[u8], &mut [u8]) -> [u8; TAG_SIZE];
type OpenFn = fn(&[u8; 32], &[u8], &[u8], &mut [u8], &[u8; TAG_SIZE]) -> Result<(), AuthError>;

/// One encrypted chunk as produced by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Chunk position within the transfer
    pub index: u64,
    /// Plaintext length in bytes
    pub plaintext_len: u32,
    /// Nonce the chunk was sealed under
    pub nonce: DirectionalNonce,
    /// Ciphertext (same length as the plaintext)
    pub ciphertext: Vec<u8>,
    /// Detached authentication tag
    pub tag: [u8; TAG_SIZE],
}

/// Session-bound AEAD for one direction.
#[derive(Clone)]
pub struct ChunkCipher {
    suite: CipherSuite,
    salt: [u8; NONCE_SALT_SIZE],
    seal: SealFn,
    open: OpenFn,
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher").field("suite", &self.suite).finish_non_exhaustive()
    }
}

impl ChunkCipher {
    /// Resolve `suite` for a direction whose nonces are salted with `salt`.
    pub fn new(suite: CipherSuite, salt: [u8; NONCE_SALT_SIZE]) -> Self {
        let (seal, open): (SealFn, OpenFn) = match suite {
            CipherSuite::XChaCha20Poly1305 => (seal_xchacha, open_xchacha),
            CipherSuite::Aes256Gcm => (seal_aes_gcm, open_aes_gcm),
        };
        Self { suite, salt, seal, open }
    }

    /// Negotiated suite.
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Encrypt `plaintext`, returning the ciphertext and detached tag.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        key: &MessageKey,
        nonce: &DirectionalNonce,
        aad: &[u8],
    ) -> (Vec<u8>, [u8; TAG_SIZE]) {
        let nonce_bytes = nonce.to_bytes(&self.salt, self.suite.nonce_len());
        let mut buffer = plaintext.to_vec();
        let tag = (self.seal)(key.key(), &nonce_bytes[..self.suite.nonce_len()], aad, &mut buffer);
        (buffer, tag)
    }

    /// Verify and decrypt.
    ///
    /// # Errors
    ///
    /// - `AuthError::TagMismatch` if the key, nonce, AAD, ciphertext or tag
    ///   differ in any bit from what was sealed
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        tag: &[u8; TAG_SIZE],
        key: &MessageKey,
        nonce: &DirectionalNonce,
        aad: &[u8],
    ) -> Result<Vec<u8>, AuthError> {
        let nonce_bytes = nonce.to_bytes(&self.salt, self.suite.nonce_len());
        let mut scratch = Zeroizing::new(ciphertext.to_vec());
        (self.open)(key.key(), &nonce_bytes[..self.suite.nonce_len()], aad, &mut scratch, tag)?;
        Ok(std::mem::take(&mut *scratch))
    }

    /// Seal one chunk into a [`ChunkRecord`].
    pub fn seal_chunk(
        &self,
        index: u64,
        plaintext: &[u8],
        key: &MessageKey,
        nonce: DirectionalNonce,
        aad: &[u8],
    ) -> ChunkRecord {
        let (ciphertext, tag) = self.encrypt(plaintext, key, &nonce, aad);
        ChunkRecord { index, plaintext_len: plaintext.len() as u32, nonce, ciphertext, tag }
    }

    /// Open a [`ChunkRecord`].
    ///
    /// A record whose declared length disagrees with its ciphertext is
    /// rejected as an authentication failure.
    pub fn open_chunk(
        &self,
        record: &ChunkRecord,
        key: &MessageKey,
        aad: &[u8],
    ) -> Result<Vec<u8>, AuthError> {
        if record.ciphertext.len() != record.plaintext_len as usize {
            return Err(AuthError::TagMismatch);
        }
        self.decrypt(&record.ciphertext, &record.tag, key, &record.nonce, aad)
    }
}

fn seal_xchacha(key: &[u8; 32], nonce: &[u8], aad: &[u8], buffer: &mut [u8]) -> [u8; TAG_SIZE] {
    let cipher = XChaCha20Poly1305::new(key.into());
    let Ok(tag) = cipher.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail below its length limit");
    };
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&tag);
    out
}

fn open_xchacha(
    key: &[u8; 32],
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<(), AuthError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| AuthError::TagMismatch)
}

fn seal_aes_gcm(key: &[u8; 32], nonce: &[u8], aad: &[u8], buffer: &mut [u8]) -> [u8; TAG_SIZE] {
    let cipher = Aes256Gcm::new(key.into());
    let Ok(tag) = cipher.encrypt_in_place_detached(GenericArray::from_slice(nonce), aad, buffer)
    else {
        unreachable!("AES-256-GCM encryption cannot fail below its length limit");
    };
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(&tag);
    out
}

fn open_aes_gcm(
    key: &[u8; 32],
    nonce: &[u8],
    aad: &[u8],
    buffer: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<(), AuthError> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            buffer,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| AuthError::TagMismatch)
}
