//! The triple ratchet: symmetric chains, sender-driven DH steps and sparse
//! post-quantum steps.
//!
//! Each direction has its own root. The sending side decides when to step:
//!
//! ```text
//! since_pq >= pq_interval      → PostQuantum step (fresh X25519 + ML-KEM encapsulation)
//! chain.counter >= dh_interval → Dh step (fresh X25519)
//! otherwise                    → next key from the current chain
//! ```
//!
//! A step is always made against the peer's advertised receive key set, and
//! the header of every message in the new epoch carries everything the
//! receiver needs to mirror it. Losing the first message of an epoch therefore
//! does not desynchronize the two sides.
//!
//! Receiving is two-phase. [`RatchetEngine::stage_receive`] derives the message
//! key and the would-be state without touching `self`; the caller verifies the
//! AEAD tag (and anything else) and only then calls
//! [`RatchetEngine::commit`]. A forged or corrupted message never moves the
//! ratchet.

use std::collections::VecDeque;

use rand::{CryptoRng, RngCore};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::{
    chain::{ChainKey, MessageKey},
    header::{KeyAdvert, RatchetHeader, StepKind},
    skipped::SkippedKeys,
};
use crate::{
    error::{CryptoError, RatchetError, ResourceError},
    hybrid::{Role, SessionRootSecret},
    kdf::{labels, root_fingerprint, root_step},
    kem::{self, DecapsulationKey, MLKEM_PUBLIC_KEY_SIZE},
    nonce::{Direction, NONCE_SALT_SIZE},
};

/// Default number of messages per chain before a DH step.
pub const DEFAULT_DH_INTERVAL: u32 = 64;

/// Default number of messages between post-quantum steps.
pub const DEFAULT_PQ_INTERVAL: u32 = 256;

/// Default maximum keys skipped in one chain (and cache distance bound).
pub const DEFAULT_MAX_SKIP: u32 = 1000;

/// Default maximum number of cached skipped keys.
pub const DEFAULT_MAX_CACHED_KEYS: usize = 2000;

/// Default number of own receive key sets retained.
pub const DEFAULT_MAX_KEYSETS: usize = 4;

/// Ratchet policy parameters.
///
/// These are policy, not protocol: peers may run with different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetConfig {
    /// Messages per chain before the sender performs a DH step
    pub dh_interval: u32,
    /// Messages between post-quantum steps
    pub pq_interval: u32,
    /// Maximum keys derived ahead in one chain, and the cache distance bound
    pub max_skip: u32,
    /// Maximum number of cached skipped keys
    pub max_cached_keys: usize,
    /// Own receive key sets retained for late peer steps
    pub max_keysets: usize,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            dh_interval: DEFAULT_DH_INTERVAL,
            pq_interval: DEFAULT_PQ_INTERVAL,
            max_skip: DEFAULT_MAX_SKIP,
            max_cached_keys: DEFAULT_MAX_CACHED_KEYS,
            max_keysets: DEFAULT_MAX_KEYSETS,
        }
    }
}

/// Own key material the peer steps against.
pub struct ReceiveKeyset {
    generation: u32,
    dh_secret: StaticSecret,
    dh_public: [u8; 32],
    pq_secret: DecapsulationKey,
    pq_public: Vec<u8>,
}

impl std::fmt::Debug for ReceiveKeyset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveKeyset")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl ReceiveKeyset {
    /// Generate a fresh X25519 + ML-KEM-768 key set.
    pub fn generate<R: RngCore + CryptoRng>(generation: u32, rng: &mut R) -> Self {
        let dh_secret = StaticSecret::random_from_rng(&mut *rng);
        let dh_public = PublicKey::from(&dh_secret).to_bytes();
        let (pq_secret, pq_public) = kem::generate(rng);
        Self { generation, dh_secret, dh_public, pq_secret, pq_public }
    }

    /// Generation number.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Public half, as sent to the peer.
    pub fn advert(&self) -> KeyAdvert {
        KeyAdvert {
            generation: self.generation,
            dh_public: self.dh_public,
            pq_public: self.pq_public.clone(),
        }
    }
}

/// The peer's current receive key set, as learned from an advert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerKeyset {
    /// Generation number
    pub generation: u32,
    /// X25519 public key
    pub dh_public: [u8; 32],
    /// ML-KEM-768 encapsulation key
    pub pq_public: Vec<u8>,
}

impl PeerKeyset {
    /// Validate an advert.
    ///
    /// # Errors
    ///
    /// - `RatchetError::InvalidRatchetKey` if the encapsulation key has the
    ///   wrong length
    /// - `RatchetError::NonContributory` if the DH key has small order, so no
    ///   step against it could ever produce a usable secret
    pub fn from_advert(advert: &KeyAdvert) -> Result<Self, RatchetError> {
        check_encapsulation_key(&advert.pq_public)?;
        if !kem::x25519_public_is_contributory(&advert.dh_public) {
            return Err(RatchetError::NonContributory);
        }
        Ok(Self {
            generation: advert.generation,
            dh_public: advert.dh_public,
            pq_public: advert.pq_public.clone(),
        })
    }
}

fn check_encapsulation_key(bytes: &[u8]) -> Result<(), RatchetError> {
    if bytes.len() == MLKEM_PUBLIC_KEY_SIZE {
        return Ok(());
    }
    let len = bytes.len();
    Err(RatchetError::InvalidRatchetKey {
        reason: format!("encapsulation key is {len} bytes, expected {MLKEM_PUBLIC_KEY_SIZE}"),
    })
}

/// Observable ratchet progress for one direction.
///
/// Contains only public values: the root appears as a one-way fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetSnapshot {
    /// Direction described
    pub direction: Direction,
    /// Current epoch
    pub epoch: u32,
    /// Next chain counter
    pub counter: u32,
    /// Fingerprint of the current root key
    pub root_fingerprint: [u8; 16],
    /// DH-only steps taken
    pub dh_steps: u64,
    /// Post-quantum steps taken
    pub pq_steps: u64,
    /// Kind of the most recent step
    pub last_step: Option<StepKind>,
    /// Skipped keys currently cached (receive side only)
    pub cached_keys: usize,
}

struct SendingRatchet {
    root: Zeroizing<[u8; 32]>,
    chain: ChainKey,
    epoch: u32,
    prev_chain_len: u32,
    dh_public: [u8; 32],
    target_generation: u32,
    pq_ciphertext: Option<Vec<u8>>,
    peer: PeerKeyset,
    since_pq: u32,
    dh_steps: u64,
    pq_steps: u64,
    last_step: Option<StepKind>,
}

impl SendingRatchet {
    fn due_step(&self, config: &RatchetConfig) -> Option<StepKind> {
        if self.since_pq >= config.pq_interval {
            Some(StepKind::PostQuantum)
        } else if self.chain.counter() >= config.dh_interval {
            Some(StepKind::Dh)
        } else {
            None
        }
    }

    fn step<R: RngCore + CryptoRng>(
        &mut self,
        kind: StepKind,
        rng: &mut R,
    ) -> Result<(), RatchetError> {
        let epoch = self.epoch.checked_add(1).ok_or(RatchetError::EpochOverflow)?;

        let secret = EphemeralSecret::random_from_rng(&mut *rng);
        let public = PublicKey::from(&secret).to_bytes();
        let shared = secret.diffie_hellman(&PublicKey::from(self.peer.dh_public));
        let dh = kem::contributory(&shared).ok_or(RatchetError::NonContributory)?;

        let (ciphertext, pq_secret) = match kind {
            StepKind::Dh => (None, None),
            StepKind::PostQuantum => {
                let ek = kem::parse_encapsulation_key(&self.peer.pq_public).ok_or_else(|| {
                    RatchetError::InvalidRatchetKey {
                        reason: "peer encapsulation key has the wrong length".to_string(),
                    }
                })?;
                let (ct, secret) = kem::encapsulate(&ek, rng);
                (Some(ct), Some(secret))
            },
        };

        let (root, chain_seed) = root_step(
            &self.root,
            &dh,
            pq_secret.as_ref().map(|secret| secret.as_slice()),
            epoch,
            kind as u8,
        );

        self.prev_chain_len = self.chain.counter();
        self.root = root;
        self.chain = ChainKey::from_secret(&chain_seed);
        self.epoch = epoch;
        self.dh_public = public;
        self.target_generation = self.peer.generation;
        self.pq_ciphertext = ciphertext;
        self.last_step = Some(kind);
        match kind {
            StepKind::Dh => self.dh_steps += 1,
            StepKind::PostQuantum => {
                self.pq_steps += 1;
                self.since_pq = 0;
            },
        }
        Ok(())
    }
}

struct ReceivingRatchet {
    root: Zeroizing<[u8; 32]>,
    chain: ChainKey,
    epoch: u32,
    /// Derivations performed so far; the skipped-key distance bound is
    /// measured against this.
    ordinal: u64,
    skipped: SkippedKeys,
    dh_steps: u64,
    pq_steps: u64,
    last_step: Option<StepKind>,
}

struct StagedStep {
    root: Zeroizing<[u8; 32]>,
    epoch: u32,
    kind: StepKind,
    target_generation: u32,
}

enum StagePlan {
    Cached { epoch: u32, counter: u32 },
    Chain { step: Option<StagedStep>, chain: ChainKey, skipped: Vec<MessageKey> },
}

/// A derived receive key plus the state change that accepting it implies.
///
/// Dropping a stage discards it; nothing changes until
/// [`RatchetEngine::commit`].
pub struct ReceiveStage {
    key: MessageKey,
    plan: StagePlan,
    advert: Option<PeerKeyset>,
}

impl std::fmt::Debug for ReceiveStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveStage").field("key", &self.key).finish_non_exhaustive()
    }
}

impl ReceiveStage {
    /// Key to open the message with.
    pub fn message_key(&self) -> &MessageKey {
        &self.key
    }

    /// Kind of asymmetric step this message would apply, if any.
    pub fn step_kind(&self) -> Option<StepKind> {
        match &self.plan {
            StagePlan::Chain { step: Some(step), .. } => Some(step.kind),
            _ => None,
        }
    }
}

impl ReceivingRatchet {
    fn stage(
        &self,
        header: &RatchetHeader,
        keysets: &VecDeque<ReceiveKeyset>,
        config: &RatchetConfig,
    ) -> Result<(MessageKey, StagePlan), CryptoError> {
        if let Some(key) = self.skipped.get(header.epoch, header.counter) {
            let plan = StagePlan::Cached { epoch: header.epoch, counter: header.counter };
            return Ok((key.clone(), plan));
        }

        let expired = RatchetError::KeyExpired { epoch: header.epoch, counter: header.counter };
        if header.epoch < self.epoch {
            return Err(expired.into());
        }

        if header.epoch == self.epoch {
            if header.counter < self.chain.counter() {
                return Err(expired.into());
            }
            let mut chain = self.chain.clone();
            let (key, skipped) = walk(&mut chain, header.epoch, header.counter, config.max_skip)?;
            return Ok((key, StagePlan::Chain { step: None, chain, skipped }));
        }

        if header.epoch - self.epoch > 1 {
            return Err(RatchetError::EpochAhead { epoch: header.epoch, current: self.epoch }.into());
        }

        // Keys left in the old chain are kept for late arrivals, unless the
        // claimed remainder is beyond the skip window.
        let mut skipped = Vec::new();
        let remaining = header.prev_chain_len.saturating_sub(self.chain.counter());
        if remaining <= config.max_skip {
            let mut old = self.chain.clone();
            for _ in 0..remaining {
                skipped.push(old.advance(self.epoch)?);
            }
        }

        let keyset = keysets
            .iter()
            .find(|keyset| keyset.generation == header.target_generation)
            .ok_or(RatchetError::UnknownKeyset { generation: header.target_generation })?;

        let shared = keyset.dh_secret.diffie_hellman(&PublicKey::from(header.dh_public));
        let dh = kem::contributory(&shared).ok_or(RatchetError::NonContributory)?;

        let pq_secret = match &header.pq_ciphertext {
            Some(ct) => Some(kem::decapsulate(&keyset.pq_secret, ct).ok_or_else(|| {
                RatchetError::InvalidRatchetKey {
                    reason: format!("ciphertext is {} bytes", ct.len()),
                }
            })?),
            None => None,
        };
        let kind = if pq_secret.is_some() { StepKind::PostQuantum } else { StepKind::Dh };

        let (root, chain_seed) = root_step(
            &self.root,
            &dh,
            pq_secret.as_ref().map(|secret| secret.as_slice()),
            header.epoch,
            kind as u8,
        );

        let mut chain = ChainKey::from_secret(&chain_seed);
        let (key, more) = walk(&mut chain, header.epoch, header.counter, config.max_skip)?;
        skipped.extend(more);

        let step = StagedStep {
            root,
            epoch: header.epoch,
            kind,
            target_generation: header.target_generation,
        };
        Ok((key, StagePlan::Chain { step: Some(step), chain, skipped }))
    }

    fn apply(&mut self, plan: StagePlan) -> Option<(StepKind, u32)> {
        match plan {
            StagePlan::Cached { epoch, counter } => {
                self.skipped.take(epoch, counter);
                None
            },
            StagePlan::Chain { step, chain, skipped } => {
                let applied = step.map(|step| {
                    self.root = step.root;
                    self.epoch = step.epoch;
                    self.last_step = Some(step.kind);
                    match step.kind {
                        StepKind::Dh => self.dh_steps += 1,
                        StepKind::PostQuantum => self.pq_steps += 1,
                    }
                    (step.kind, step.target_generation)
                });
                self.chain = chain;

                let base = self.ordinal;
                let frontier = base + skipped.len() as u64 + 1;
                for (offset, key) in skipped.into_iter().enumerate() {
                    self.skipped.insert(key, base + offset as u64, frontier);
                }
                self.ordinal = frontier;
                self.skipped.evict(frontier);

                applied
            },
        }
    }
}

/// Advance `chain` to `target`, returning the target key and every key
/// skipped on the way.
fn walk(
    chain: &mut ChainKey,
    epoch: u32,
    target: u32,
    max_skip: u32,
) -> Result<(MessageKey, Vec<MessageKey>), CryptoError> {
    let skip = target - chain.counter();
    if skip > max_skip {
        let requested = u64::from(skip);
        return Err(ResourceError::SkipWindowExceeded { requested, max_skip }.into());
    }

    let mut skipped = Vec::with_capacity(skip as usize);
    while chain.counter() < target {
        skipped.push(chain.advance(epoch)?);
    }
    Ok((chain.advance(epoch)?, skipped))
}

/// Per-session ratchet state for both directions.
///
/// Owned by exactly one session and mutated only through `&mut self`.
pub struct RatchetEngine {
    role: Role,
    config: RatchetConfig,
    sending: SendingRatchet,
    receiving: ReceivingRatchet,
    keysets: VecDeque<ReceiveKeyset>,
    /// Highest own generation the peer has stepped against
    acknowledged: u32,
    send_salt: [u8; NONCE_SALT_SIZE],
    receive_salt: [u8; NONCE_SALT_SIZE],
}

impl std::fmt::Debug for RatchetEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetEngine")
            .field("role", &self.role)
            .field("send_epoch", &self.sending.epoch)
            .field("receive_epoch", &self.receiving.epoch)
            .finish_non_exhaustive()
    }
}

impl RatchetEngine {
    /// Seed both directions from the session root.
    ///
    /// Takes ownership of the root; it is wiped once the per-direction keys
    /// exist. `own` is the receive key set advertised in the handshake and
    /// `peer` is the one the peer advertised.
    ///
    /// # Errors
    ///
    /// - `RatchetError::InvalidRatchetKey` if `peer` is malformed
    pub fn new(
        root: SessionRootSecret,
        role: Role,
        own: ReceiveKeyset,
        peer: PeerKeyset,
        config: RatchetConfig,
    ) -> Result<Self, RatchetError> {
        check_encapsulation_key(&peer.pq_public)?;

        let schedule = root.into_schedule();
        let send_ctx = [role.send_direction().as_byte()];
        let receive_ctx = [role.receive_direction().as_byte()];

        let send_salt = *schedule.derive::<NONCE_SALT_SIZE>(labels::NONCE_SALT, &send_ctx);
        let receive_salt = *schedule.derive::<NONCE_SALT_SIZE>(labels::NONCE_SALT, &receive_ctx);

        let sending = SendingRatchet {
            root: schedule.derive(labels::DIRECTION_ROOT, &send_ctx),
            chain: ChainKey::from_secret(&schedule.derive(labels::INITIAL_CHAIN, &send_ctx)),
            epoch: 0,
            prev_chain_len: 0,
            dh_public: [0; 32],
            target_generation: peer.generation,
            pq_ciphertext: None,
            peer,
            since_pq: 0,
            dh_steps: 0,
            pq_steps: 0,
            last_step: None,
        };

        let receiving = ReceivingRatchet {
            root: schedule.derive(labels::DIRECTION_ROOT, &receive_ctx),
            chain: ChainKey::from_secret(&schedule.derive(labels::INITIAL_CHAIN, &receive_ctx)),
            epoch: 0,
            ordinal: 0,
            skipped: SkippedKeys::new(config.max_cached_keys, u64::from(config.max_skip)),
            dh_steps: 0,
            pq_steps: 0,
            last_step: None,
        };

        let acknowledged = own.generation;
        let mut keysets = VecDeque::with_capacity(config.max_keysets.max(1));
        keysets.push_back(own);

        Ok(Self {
            role,
            config,
            sending,
            receiving,
            keysets,
            acknowledged,
            send_salt,
            receive_salt,
        })
    }

    /// Our handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Policy in effect.
    pub fn config(&self) -> &RatchetConfig {
        &self.config
    }

    /// Nonce salt for `direction`.
    pub fn nonce_salt(&self, direction: Direction) -> [u8; NONCE_SALT_SIZE] {
        if direction == self.role.send_direction() { self.send_salt } else { self.receive_salt }
    }

    /// Derive the key for the next outgoing message, stepping first if due.
    ///
    /// Keys come out strictly in order: the N-th call always yields the key for
    /// the N-th message.
    pub fn next_send<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<(RatchetHeader, MessageKey), CryptoError> {
        if let Some(kind) = self.sending.due_step(&self.config) {
            self.sending.step(kind, rng)?;
        }

        let key = self.sending.chain.advance(self.sending.epoch)?;
        self.sending.since_pq = self.sending.since_pq.saturating_add(1);

        let header = RatchetHeader {
            epoch: self.sending.epoch,
            counter: key.counter(),
            prev_chain_len: self.sending.prev_chain_len,
            dh_public: self.sending.dh_public,
            target_generation: self.sending.target_generation,
            pq_ciphertext: self.sending.pq_ciphertext.clone(),
            advert: self.pending_advert(),
        };
        Ok((header, key))
    }

    /// Derive the key for an incoming message without changing any state.
    ///
    /// # Errors
    ///
    /// - `RatchetError::KeyExpired` if the key was consumed or evicted
    /// - `RatchetError::EpochAhead` if the message skips a whole epoch
    /// - `RatchetError::UnknownKeyset`, `NonContributory`,
    ///   `InvalidRatchetKey` on a step that cannot be mirrored
    /// - `ResourceError::SkipWindowExceeded` on a gap larger than `max_skip`
    pub fn stage_receive(&self, header: &RatchetHeader) -> Result<ReceiveStage, CryptoError> {
        let advert = match &header.advert {
            Some(advert) if advert.generation > self.sending.peer.generation => {
                Some(PeerKeyset::from_advert(advert)?)
            },
            _ => None,
        };
        let (key, plan) = self.receiving.stage(header, &self.keysets, &self.config)?;
        Ok(ReceiveStage { key, plan, advert })
    }

    /// Apply a stage after the message authenticated.
    ///
    /// Returns the step kind if the message opened a new epoch.
    pub fn commit<R: RngCore + CryptoRng>(
        &mut self,
        stage: ReceiveStage,
        rng: &mut R,
    ) -> Option<StepKind> {
        let ReceiveStage { key, plan, advert } = stage;
        drop(key);

        if let Some(peer) = advert {
            self.sending.peer = peer;
        }

        let (kind, generation) = self.receiving.apply(plan)?;
        if generation >= self.newest_generation() {
            self.rotate(rng);
        }
        self.acknowledged = self.acknowledged.max(generation);
        Some(kind)
    }

    /// Sending-direction progress.
    pub fn send_snapshot(&self) -> RatchetSnapshot {
        let sending = &self.sending;
        RatchetSnapshot {
            direction: self.role.send_direction(),
            epoch: sending.epoch,
            counter: sending.chain.counter(),
            root_fingerprint: root_fingerprint(&sending.root),
            dh_steps: sending.dh_steps,
            pq_steps: sending.pq_steps,
            last_step: sending.last_step,
            cached_keys: 0,
        }
    }

    /// Receiving-direction progress.
    pub fn receive_snapshot(&self) -> RatchetSnapshot {
        let receiving = &self.receiving;
        RatchetSnapshot {
            direction: self.role.receive_direction(),
            epoch: receiving.epoch,
            counter: receiving.chain.counter(),
            root_fingerprint: root_fingerprint(&receiving.root),
            dh_steps: receiving.dh_steps,
            pq_steps: receiving.pq_steps,
            last_step: receiving.last_step,
            cached_keys: receiving.skipped.len(),
        }
    }

    /// Generation of our newest receive key set.
    pub fn newest_generation(&self) -> u32 {
        self.keysets.back().map_or(0, ReceiveKeyset::generation)
    }

    /// Generation of the peer key set our sending steps target.
    pub fn peer_generation(&self) -> u32 {
        self.sending.peer.generation
    }

    fn pending_advert(&self) -> Option<KeyAdvert> {
        let newest = self.keysets.back()?;
        (newest.generation > self.acknowledged).then(|| newest.advert())
    }

    fn rotate<R: RngCore + CryptoRng>(&mut self, rng: &mut R) {
        let Some(generation) = self.newest_generation().checked_add(1) else {
            return;
        };
        self.keysets.push_back(ReceiveKeyset::generate(generation, rng));
        while self.keysets.len() > self.config.max_keysets.max(1) {
            self.keysets.pop_front();
        }
    }
}
