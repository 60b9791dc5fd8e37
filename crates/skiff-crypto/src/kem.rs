//! X25519 and ML-KEM-768 plumbing shared by the handshake and the ratchet.
//!
//! Byte-level parsing lives here so every caller applies the same length and
//! contributory checks.

use ml_kem::{
    Ciphertext, EncodedSizeUser, KemCore, MlKem768,
    kem::{Decapsulate, Encapsulate},
};
use rand::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

/// X25519 public key size.
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// ML-KEM-768 encapsulation key size.
pub const MLKEM_PUBLIC_KEY_SIZE: usize = 1184;

/// ML-KEM-768 ciphertext size.
pub const MLKEM_CIPHERTEXT_SIZE: usize = 1088;

pub(crate) type DecapsulationKey = <MlKem768 as KemCore>::DecapsulationKey;
pub(crate) type EncapsulationKey = <MlKem768 as KemCore>::EncapsulationKey;

/// Generate an ML-KEM-768 key pair, returning the encoded public half.
pub(crate) fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> (DecapsulationKey, Vec<u8>) {
    let (dk, ek) = MlKem768::generate(rng);
    (dk, ek.as_bytes().to_vec())
}

/// Parse an encoded encapsulation key. `None` on wrong length.
pub(crate) fn parse_encapsulation_key(bytes: &[u8]) -> Option<EncapsulationKey> {
    if bytes.len() != MLKEM_PUBLIC_KEY_SIZE {
        return None;
    }
    let encoded = bytes.try_into().ok()?;
    Some(EncapsulationKey::from_bytes(&encoded))
}

/// Encapsulate to `ek`, returning `(ciphertext, shared_secret)`.
pub(crate) fn encapsulate<R: RngCore + CryptoRng>(
    ek: &EncapsulationKey,
    rng: &mut R,
) -> (Vec<u8>, Zeroizing<[u8; 32]>) {
    let Ok((ciphertext, shared)) = ek.encapsulate(rng) else {
        unreachable!("ML-KEM encapsulation is infallible");
    };

    let mut secret = Zeroizing::new([0u8; 32]);
    secret.copy_from_slice(&shared);
    (ciphertext.to_vec(), secret)
}

/// Decapsulate `ciphertext`. `None` on wrong length.
///
/// ML-KEM uses implicit rejection: a well-sized but forged ciphertext yields
/// an unrelated secret rather than an error, and the mismatch surfaces later
/// as an AEAD failure.
pub(crate) fn decapsulate(
    dk: &DecapsulationKey,
    ciphertext: &[u8],
) -> Option<Zeroizing<[u8; 32]>> {
    if ciphertext.len() != MLKEM_CIPHERTEXT_SIZE {
        return None;
    }
    let ciphertext: Ciphertext<MlKem768> = ciphertext.try_into().ok()?;
    let Ok(shared) = dk.decapsulate(&ciphertext) else {
        unreachable!("ML-KEM decapsulation is infallible");
    };

    let mut secret = Zeroizing::new([0u8; 32]);
    secret.copy_from_slice(&shared);
    Some(secret)
}

/// Accept a DH result only if it is contributory (not forced to zero by a
/// low-order peer key).
pub(crate) fn contributory(shared: &SharedSecret) -> Option<Zeroizing<[u8; 32]>> {
    shared.was_contributory().then(|| Zeroizing::new(shared.to_bytes()))
}

/// Whether `public` can yield a contributory DH result.
///
/// Clamped X25519 scalars are multiples of the cofactor, so a point of small
/// order maps to zero under every secret. One trial multiplication with a
/// fixed scalar therefore rejects it before any real secret touches it.
pub(crate) fn x25519_public_is_contributory(public: &[u8; X25519_PUBLIC_KEY_SIZE]) -> bool {
    let trial = StaticSecret::from([0x5A; 32]);
    trial.diffie_hellman(&PublicKey::from(*public)).was_contributory()
}
