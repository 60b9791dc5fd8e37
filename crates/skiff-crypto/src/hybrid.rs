//! Hybrid X25519 + ML-KEM-768 key agreement.
//!
//! ```text
//! Initiator                                   Responder
//!   x25519 eph, ML-KEM keypair
//!   HandshakeOffer ───────────────────────────▶
//!                                              x25519 eph, DH, encapsulate
//!              ◀─────────────────────────── HandshakeAnswer
//!   DH, decapsulate
//!
//! transcript = SHA-256(label || version || context || offer keys || answer keys)
//! root       = HKDF(salt = transcript, ikm = dh || kem, info = hybrid-root label)
//! ```
//!
//! An attacker has to break both X25519 and ML-KEM to recover the root. The
//! `context` argument binds everything else the two sides agreed on (session
//! id, cipher suites, initial ratchet keys) into the transcript.
//!
//! Ephemeral secrets are consumed by the exchange. The X25519 secret is wiped
//! by `x25519-dalek` when dropped; the DH and KEM outputs live only in
//! [`Zeroizing`] buffers. Both happen on success and on every error path.

use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::{
    ct::ct_eq,
    error::HandshakeError,
    kdf::{KeySchedule, hmac, labels},
    kem::{self, DecapsulationKey, MLKEM_CIPHERTEXT_SIZE, MLKEM_PUBLIC_KEY_SIZE},
    nonce::Direction,
};

/// Protocol version carried in both handshake messages.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the session root secret.
pub const ROOT_SECRET_SIZE: usize = 32;

/// Handshake role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sends the offer
    Initiator,
    /// Answers the offer
    Responder,
}

impl Role {
    /// Direction of frames this role sends.
    pub const fn send_direction(self) -> Direction {
        match self {
            Self::Initiator => Direction::InitiatorToResponder,
            Self::Responder => Direction::ResponderToInitiator,
        }
    }

    /// Direction of frames this role receives.
    pub const fn receive_direction(self) -> Direction {
        self.send_direction().reverse()
    }

    /// The peer's role.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }
}

/// First handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOffer {
    /// Protocol version
    pub version: u8,
    /// Initiator's ephemeral X25519 public key
    pub x25519_public: [u8; 32],
    /// Initiator's ephemeral ML-KEM-768 encapsulation key
    pub mlkem_public: Vec<u8>,
}

/// Second handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAnswer {
    /// Protocol version
    pub version: u8,
    /// Responder's ephemeral X25519 public key
    pub x25519_public: [u8; 32],
    /// ML-KEM-768 ciphertext encapsulated to the offer's key
    pub mlkem_ciphertext: Vec<u8>,
}

/// Output of the hybrid key agreement.
///
/// Deliberately not `Clone`. The bytes are wiped on drop and are never
/// printed.
pub struct SessionRootSecret {
    bytes: Zeroizing<[u8; ROOT_SECRET_SIZE]>,
    transcript: [u8; 32],
}

impl std::fmt::Debug for SessionRootSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRootSecret").field("bytes", &"[REDACTED]").finish()
    }
}

impl SessionRootSecret {
    /// Handshake transcript hash this root is bound to.
    pub fn transcript(&self) -> &[u8; 32] {
        &self.transcript
    }

    /// Key-confirmation tag proving possession of the root as `role`.
    pub fn confirmation_tag(&self, role: Role) -> [u8; 32] {
        let label = match role {
            Role::Initiator => labels::CONFIRM_INITIATOR,
            Role::Responder => labels::CONFIRM_RESPONDER,
        };
        hmac(&*self.bytes, &[label, &self.transcript])
    }

    /// Check the peer's confirmation tag in constant time.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::KeyConfirmationFailed` if the tag does not match
    pub fn verify_confirmation(&self, peer: Role, tag: &[u8]) -> Result<(), HandshakeError> {
        if ct_eq(&self.confirmation_tag(peer), tag) {
            Ok(())
        } else {
            Err(HandshakeError::KeyConfirmationFailed)
        }
    }

    /// Six-digit code for out-of-band comparison by the two users.
    pub fn short_auth_code(&self) -> String {
        let mac = hmac(&*self.bytes, &[labels::SHORT_AUTH, &self.transcript]);
        let value = u32::from_be_bytes([mac[0], mac[1], mac[2], mac[3]]) % 1_000_000;
        format!("{value:06}")
    }

    /// Open the session key schedule. Consumes the root.
    pub(crate) fn into_schedule(self) -> KeySchedule {
        KeySchedule::new(Some(&self.transcript), &*self.bytes)
    }

    #[cfg(test)]
    pub(crate) fn expose(&self) -> &[u8; ROOT_SECRET_SIZE] {
        &self.bytes
    }
}

/// Initiator half of the handshake, holding the ephemeral secrets.
pub struct HybridInitiator {
    dh_secret: EphemeralSecret,
    kem_secret: DecapsulationKey,
    offer: HandshakeOffer,
}

impl std::fmt::Debug for HybridInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridInitiator").field("offer", &self.offer).finish_non_exhaustive()
    }
}

impl HybridInitiator {
    /// Generate fresh ephemeral key pairs.
    pub fn new<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let dh_secret = EphemeralSecret::random_from_rng(&mut *rng);
        let x25519_public = PublicKey::from(&dh_secret).to_bytes();
        let (kem_secret, mlkem_public) = kem::generate(rng);

        Self {
            dh_secret,
            kem_secret,
            offer: HandshakeOffer { version: PROTOCOL_VERSION, x25519_public, mlkem_public },
        }
    }

    /// The message to send to the responder.
    pub fn offer(&self) -> &HandshakeOffer {
        &self.offer
    }

    /// Complete the exchange with the responder's answer.
    ///
    /// Consumes the ephemeral secrets whether or not it succeeds.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::VersionMismatch` if the answer speaks another version
    /// - `HandshakeError::InvalidPeerKey` on malformed key material
    /// - `HandshakeError::NonContributory` on a low-order X25519 key
    pub fn finish(
        self,
        answer: &HandshakeAnswer,
        context: &[u8],
    ) -> Result<SessionRootSecret, HandshakeError> {
        let Self { dh_secret, kem_secret, offer } = self;

        check_version(answer.version)?;
        let peer_public = PublicKey::from(answer.x25519_public);
        let Some(kem_shared) = kem::decapsulate(&kem_secret, &answer.mlkem_ciphertext) else {
            return Err(HandshakeError::InvalidPeerKey {
                component: "ml-kem",
                reason: format!(
                    "ciphertext is {} bytes, expected {MLKEM_CIPHERTEXT_SIZE}",
                    answer.mlkem_ciphertext.len()
                ),
            });
        };
        drop(kem_secret);

        let shared = dh_secret.diffie_hellman(&peer_public);
        let dh_shared = kem::contributory(&shared).ok_or(HandshakeError::NonContributory)?;

        let transcript = transcript_hash(&offer, answer, context);
        Ok(combine(&dh_shared, &kem_shared, transcript))
    }
}

/// Answer an offer as responder.
///
/// # Errors
///
/// - `HandshakeError::VersionMismatch` if the offer speaks another version
/// - `HandshakeError::InvalidPeerKey` on malformed key material
/// - `HandshakeError::NonContributory` on a low-order X25519 key
pub fn respond<R: RngCore + CryptoRng>(
    offer: &HandshakeOffer,
    context: &[u8],
    rng: &mut R,
) -> Result<(HandshakeAnswer, SessionRootSecret), HandshakeError> {
    check_version(offer.version)?;

    let Some(peer_kem) = kem::parse_encapsulation_key(&offer.mlkem_public) else {
        return Err(HandshakeError::InvalidPeerKey {
            component: "ml-kem",
            reason: format!(
                "encapsulation key is {} bytes, expected {MLKEM_PUBLIC_KEY_SIZE}",
                offer.mlkem_public.len()
            ),
        });
    };
    let peer_public = PublicKey::from(offer.x25519_public);

    let dh_secret = EphemeralSecret::random_from_rng(&mut *rng);
    let x25519_public = PublicKey::from(&dh_secret).to_bytes();
    let shared = dh_secret.diffie_hellman(&peer_public);
    let dh_shared = kem::contributory(&shared).ok_or(HandshakeError::NonContributory)?;

    let (mlkem_ciphertext, kem_shared) = kem::encapsulate(&peer_kem, rng);

    let answer = HandshakeAnswer { version: PROTOCOL_VERSION, x25519_public, mlkem_ciphertext };
    let transcript = transcript_hash(offer, &answer, context);
    let root = combine(&dh_shared, &kem_shared, transcript);

    Ok((answer, root))
}

fn check_version(peer: u8) -> Result<(), HandshakeError> {
    if peer == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(HandshakeError::VersionMismatch { local: PROTOCOL_VERSION, peer })
    }
}

fn transcript_hash(offer: &HandshakeOffer, answer: &HandshakeAnswer, context: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(labels::TRANSCRIPT);
    hasher.update([PROTOCOL_VERSION]);
    hasher.update((context.len() as u64).to_be_bytes());
    hasher.update(context);
    hasher.update(offer.x25519_public);
    hasher.update(&offer.mlkem_public);
    hasher.update(answer.x25519_public);
    hasher.update(&answer.mlkem_ciphertext);

    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn combine(dh_shared: &[u8; 32], kem_shared: &[u8; 32], transcript: [u8; 32]) -> SessionRootSecret {
    let mut ikm = Zeroizing::new([0u8; 64]);
    ikm[..32].copy_from_slice(dh_shared);
    ikm[32..].copy_from_slice(kem_shared);

    let bytes = KeySchedule::new(Some(&transcript), &*ikm).derive(labels::HYBRID_ROOT, &[]);
    SessionRootSecret { bytes, transcript }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    fn handshake(seed: u64) -> (SessionRootSecret, SessionRootSecret) {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let initiator = HybridInitiator::new(&mut rng);
        let (answer, responder_root) = respond(initiator.offer(), b"ctx", &mut rng).unwrap();
        let initiator_root = initiator.finish(&answer, b"ctx").unwrap();
        (initiator_root, responder_root)
    }

    #[test]
    fn both_sides_agree() {
        let (a, b) = handshake(1);
        assert_eq!(a.expose(), b.expose());
        assert_eq!(a.transcript(), b.transcript());
        assert_eq!(a.short_auth_code(), b.short_auth_code());
    }

    #[test]
    fn different_runs_differ() {
        let (a, _) = handshake(1);
        let (b, _) = handshake(2);
        assert_ne!(a.expose(), b.expose());
    }

    #[test]
    fn context_mismatch_changes_root() {
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let initiator = HybridInitiator::new(&mut rng);
        let (answer, responder_root) = respond(initiator.offer(), b"one", &mut rng).unwrap();
        let initiator_root = initiator.finish(&answer, b"two").unwrap();
        assert_ne!(initiator_root.expose(), responder_root.expose());
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(6);
        let initiator = HybridInitiator::new(&mut rng);
        let mut offer = initiator.offer().clone();
        offer.version = 9;
        assert_eq!(
            respond(&offer, b"", &mut rng).unwrap_err(),
            HandshakeError::VersionMismatch { local: PROTOCOL_VERSION, peer: 9 }
        );
    }

    #[test]
    fn truncated_mlkem_key_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let initiator = HybridInitiator::new(&mut rng);
        let mut offer = initiator.offer().clone();
        offer.mlkem_public.truncate(1000);
        assert!(matches!(
            respond(&offer, b"", &mut rng),
            Err(HandshakeError::InvalidPeerKey { component: "ml-kem", .. })
        ));
    }

    #[test]
    fn truncated_ciphertext_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let initiator = HybridInitiator::new(&mut rng);
        let (mut answer, _) = respond(initiator.offer(), b"", &mut rng).unwrap();
        answer.mlkem_ciphertext.pop();
        assert!(matches!(
            initiator.finish(&answer, b""),
            Err(HandshakeError::InvalidPeerKey { component: "ml-kem", .. })
        ));
    }

    #[test]
    fn zero_x25519_key_rejected() {
        let mut rng = ChaCha20Rng::seed_from_u64(9);
        let initiator = HybridInitiator::new(&mut rng);
        let mut offer = initiator.offer().clone();
        offer.x25519_public = [0u8; 32];
        assert_eq!(respond(&offer, b"", &mut rng).unwrap_err(), HandshakeError::NonContributory);
    }

    #[test]
    fn confirmation_tags_are_role_bound() {
        let (a, b) = handshake(10);
        let tag = a.confirmation_tag(Role::Initiator);
        b.verify_confirmation(Role::Initiator, &tag).unwrap();
        assert_eq!(
            b.verify_confirmation(Role::Responder, &tag),
            Err(HandshakeError::KeyConfirmationFailed)
        );
    }

    #[test]
    fn short_auth_code_is_six_digits() {
        let (a, _) = handshake(11);
        let code = a.short_auth_code();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn debug_redacts_root() {
        let (a, _) = handshake(12);
        assert!(format!("{a:?}").contains("REDACTED"));
    }
}
