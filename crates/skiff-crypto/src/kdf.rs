//! Key derivation with explicit domain separation.
//!
//! Every derived value has its own label; no raw DH, KEM or hash output is
//! ever used as a key directly. A session owns exactly one [`KeySchedule`]
//! (one HKDF-SHA256 instance keyed by the session root) and derives all of its
//! per-direction roots and nonce salts from it. Ratchet steps chain through
//! [`root_step`], which re-keys HKDF with the current root as salt.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Domain-separation labels.
pub(crate) mod labels {
    pub(crate) const TRANSCRIPT: &[u8] = b"skiff v1 handshake transcript";
    pub(crate) const HYBRID_ROOT: &[u8] = b"skiff v1 hybrid root";
    pub(crate) const CONFIRM_INITIATOR: &[u8] = b"skiff v1 key confirm initiator";
    pub(crate) const CONFIRM_RESPONDER: &[u8] = b"skiff v1 key confirm responder";
    pub(crate) const SHORT_AUTH: &[u8] = b"skiff v1 short auth code";
    pub(crate) const DIRECTION_ROOT: &[u8] = b"skiff v1 direction root";
    pub(crate) const NONCE_SALT: &[u8] = b"skiff v1 nonce salt";
    pub(crate) const INITIAL_CHAIN: &[u8] = b"skiff v1 initial chain";
    pub(crate) const RATCHET_STEP: &[u8] = b"skiff v1 ratchet step";
    pub(crate) const ROOT_FINGERPRINT: &[u8] = b"skiff v1 root fingerprint";
    pub(crate) const CHAIN: &[u8] = b"chain";
    pub(crate) const MESSAGE: &[u8] = b"message";
}

/// The single keyed KDF of a session.
///
/// Built from the session root secret; the root bytes are not retained.
pub(crate) struct KeySchedule {
    hkdf: Hkdf<Sha256>,
}

impl KeySchedule {
    /// Extract a schedule from `secret` with `salt` (or the zero salt).
    pub(crate) fn new(salt: Option<&[u8]>, secret: &[u8]) -> Self {
        Self { hkdf: Hkdf::<Sha256>::new(salt, secret) }
    }

    /// Derive `N` bytes for `label`, bound to `context`.
    pub(crate) fn derive<const N: usize>(
        &self,
        label: &[u8],
        context: &[u8],
    ) -> Zeroizing<[u8; N]> {
        let mut info = Vec::with_capacity(label.len() + context.len());
        info.extend_from_slice(label);
        info.extend_from_slice(context);

        let mut out = Zeroizing::new([0u8; N]);
        let Ok(()) = self.hkdf.expand(&info, &mut out[..]) else {
            unreachable!("HKDF-SHA256 output lengths used here are far below 255 * 32");
        };
        out
    }
}

/// HMAC-SHA256 over the concatenation of `parts`.
pub(crate) fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    for part in parts {
        mac.update(part);
    }
    let result = mac.finalize().into_bytes();

    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// One root-chain step: mix fresh DH (and optionally KEM) output into the
/// current root.
///
/// Returns `(next_root, chain_key)`. `kind` separates DH-only steps from
/// DH+PQ steps so the two can never derive the same keys.
pub(crate) fn root_step(
    root: &[u8; 32],
    dh_secret: &[u8; 32],
    pq_secret: Option<&[u8]>,
    epoch: u32,
    kind: u8,
) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let mut ikm = Zeroizing::new(Vec::with_capacity(64));
    ikm.extend_from_slice(dh_secret);
    if let Some(pq) = pq_secret {
        ikm.extend_from_slice(pq);
    }

    let schedule = KeySchedule::new(Some(root), &ikm);
    let mut context = [0u8; 5];
    context[..4].copy_from_slice(&epoch.to_be_bytes());
    context[4] = kind;
    let okm = schedule.derive::<64>(labels::RATCHET_STEP, &context);

    let mut next_root = Zeroizing::new([0u8; 32]);
    let mut chain_key = Zeroizing::new([0u8; 32]);
    next_root.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    (next_root, chain_key)
}

/// Short public fingerprint of a root key, for observing ratchet progress.
pub(crate) fn root_fingerprint(root: &[u8; 32]) -> [u8; 16] {
    let full = hmac(root, &[labels::ROOT_FINGERPRINT]);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    out
}
