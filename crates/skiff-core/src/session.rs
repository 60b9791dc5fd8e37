//! Session controller.
//!
//! Owns every piece of per-session cryptographic state and drives it from
//! frames and local requests. Uses the action pattern: methods consume input
//! and return [`SessionAction`]s for the driver to execute, so the state
//! machine performs no I/O.
//!
//! # State Machine
//!
//! ```text
//! ┌───────────────┐ start ┌─────────────┐ root agreed ┌────────────┐
//! │ Uninitialized │──────>│ Handshaking │────────────>│ Ratcheting │
//! └───────────────┘       └─────────────┘             └────────────┘
//!         │                      │                          │ chains seeded
//!         │                      │                          ↓
//!         │                      │                   ┌──────────────┐ manifest  ┌───────────┐
//!         │                      │                   │ Transferring │──────────>│ Completed │
//!         │                      │                   └──────────────┘ verified  └───────────┘
//!         │                      │                          │
//!         └──────────────────────┴──────────────────────────┴───> Failed
//! ```
//!
//! `Completed` and `Failed` are terminal. Entering `Failed` drops the ratchet,
//! ciphers and any pending handshake secrets, which wipes them.
//!
//! # Wire Exchange
//!
//! ```text
//! Initiator                                     Responder
//!   Hello (offer, suites, keyset) ──────────────▶
//!                 ◀────────────── HelloReply (answer, suite, keyset, confirm)
//!   Chunk 0..n ─────────────────────────────────▶
//!   Finish (sealed manifest summary) ───────────▶
//!                 ◀────────────── Receipt (sealed verified summary)
//! ```
//!
//! Transfers run in either direction over the same session. The session
//! completes once every direction that carried data has been finished and
//! acknowledged.
//!
//! # Receive Path
//!
//! A sealed frame is processed in this order, and nothing is changed until
//! the AEAD tag verified:
//!
//! 1. session id and (for chunks) duplicate index
//! 2. ratchet key staged without mutation
//! 3. AEAD open under the staged key
//! 4. nonce counter reserved (replay check)
//! 5. ratchet commit
//! 6. manifest hash chain, which releases chunks in index order

use skiff_crypto::{
    ChunkCipher, CipherSuite, CryptoError, Direction, HandshakeAnswer, HandshakeError,
    HandshakeOffer, HybridInitiator, IntegrityError, IntegrityVerifier, ManifestEntry,
    ManifestSummary, NonceAllocator, PeerKeyset, RatchetEngine, RatchetSnapshot, ReceiveKeyset,
    ReceiveStage,
    Role, SessionRootSecret, TransferManifest, ct::ct_eq_32, integrity::content_hash, respond,
};
use skiff_proto::{
    Frame, FrameFlags, FrameHeader, Opcode, Payload,
    payloads::{
        handshake::{Abort, Hello, HelloReply},
        transfer::{KeyAdvertWire, RatchetHeaderWire, SealedChunk, SealedControl},
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    env::{EnvRng, Environment},
    envelope,
    error::SessionError,
    pipeline::{self, PreparedChunk},
    status::{ChunkFault, FailureLayer, ManifestStatus},
};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, nothing sent
    Uninitialized,
    /// Hybrid key agreement in progress
    Handshaking,
    /// Root agreed, ratchet being seeded
    Ratcheting,
    /// Chunks may flow
    Transferring,
    /// Every started transfer verified and acknowledged
    Completed,
    /// A fatal error occurred; all keys are gone
    Failed,
}

impl SessionState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Uninitialized, Self::Handshaking)
            | (Self::Handshaking, Self::Ratcheting)
            | (Self::Ratcheting, Self::Transferring)
            | (Self::Transferring, Self::Completed) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Actions returned by the session for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send this frame to the peer
    SendFrame(Frame),

    /// Hand verified plaintext to the application
    ///
    /// Emitted only after the chunk authenticated and its position in the
    /// hash chain verified, and always in index order.
    DeliverChunk {
        /// Chunk index
        index: u64,
        /// Verified plaintext
        plaintext: Vec<u8>,
    },

    /// The session changed state
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },

    /// Manifest status changed in a way the application should surface
    Status(ManifestStatus),
}

/// Live key material. Dropping it wipes every key.
struct SessionKeys {
    engine: RatchetEngine,
    send_cipher: ChunkCipher,
    receive_cipher: ChunkCipher,
    send_nonces: NonceAllocator,
    receive_nonces: NonceAllocator,
}

impl SessionKeys {
    fn new(engine: RatchetEngine, suite: CipherSuite, config: &SessionConfig) -> Self {
        let role = engine.role();
        let send = role.send_direction();
        let receive = role.receive_direction();

        Self {
            send_cipher: ChunkCipher::new(suite, engine.nonce_salt(send)),
            receive_cipher: ChunkCipher::new(suite, engine.nonce_salt(receive)),
            send_nonces: NonceAllocator::with_limits(send, config.replay_window, config.nonce_limit),
            receive_nonces: NonceAllocator::with_limits(
                receive,
                config.replay_window,
                config.nonce_limit,
            ),
            engine,
        }
    }
}

/// Initiator secrets held between Hello and HelloReply.
struct PendingHandshake {
    initiator: HybridInitiator,
    keyset: ReceiveKeyset,
}

/// Outgoing file.
struct Outgoing {
    manifest: TransferManifest,
    /// Summary sealed into Finish, once sent
    finished: Option<ManifestSummary>,
    /// Peer's receipt matched the summary
    acknowledged: bool,
}

impl Outgoing {
    fn started(&self) -> bool {
        self.manifest.chunk_count() > 0 || self.finished.is_some()
    }
}

/// Incoming file.
struct Incoming {
    verifier: IntegrityVerifier,
    receipt_sent: bool,
    rejected: Option<ChunkFault>,
}

impl Incoming {
    fn started(&self) -> bool {
        self.verifier.verified_chunks() > 0
            || self.verifier.pending_chunks() > 0
            || self.verifier.expected_chunks().is_some()
    }

    fn done(&self) -> bool {
        self.verifier.verify_manifest_complete() && self.receipt_sent
    }
}

struct Transfer {
    outgoing: Outgoing,
    incoming: Incoming,
}

/// A sealed frame that authenticated but has not yet spent its key or nonce.
struct Opened {
    plaintext: Vec<u8>,
    stage: ReceiveStage,
    sequence: u64,
    epoch: u32,
}

/// One end of a secure transfer session.
///
/// Sans-IO: the caller feeds frames in through [`handle_frame`] and executes
/// the returned actions. All state is owned and mutated through `&mut self`;
/// see [`SharedSession`](crate::SharedSession) for use across threads.
///
/// Errors come in two kinds. A fatal error is never returned as `Err`: the
/// session moves to [`SessionState::Failed`] and the returned actions carry
/// the transition, the failure status and an Abort frame for the peer. An
/// `Err` means one frame or request was refused and the session is unchanged.
///
/// [`handle_frame`]: Session::handle_frame
pub struct Session<E: Environment> {
    role: Role,
    config: SessionConfig,
    env: E,
    state: SessionState,
    session_id: Option<[u8; 16]>,
    suite: Option<CipherSuite>,
    handshake: Option<PendingHandshake>,
    keys: Option<SessionKeys>,
    transfer: Option<Transfer>,
    verification_code: Option<String>,
    failure: Option<(ChunkFault, SessionError)>,
}

impl<E: Environment> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("suite", &self.suite)
            .finish_non_exhaustive()
    }
}

impl<E: Environment> Session<E> {
    /// Create a session in [`SessionState::Uninitialized`].
    ///
    /// # Errors
    ///
    /// - `SessionError::Config` if `config` does not validate
    pub fn new(role: Role, config: SessionConfig, env: E) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            role,
            config,
            env,
            state: SessionState::Uninitialized,
            session_id: None,
            suite: None,
            handshake: None,
            keys: None,
            transfer: None,
            verification_code: None,
            failure: None,
        })
    }

    /// Handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Policy in effect.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session id, once chosen (initiator) or learned (responder).
    pub fn session_id(&self) -> Option<[u8; 16]> {
        self.session_id
    }

    /// Negotiated cipher suite.
    pub fn cipher_suite(&self) -> Option<CipherSuite> {
        self.suite
    }

    /// Six-digit code both users can compare out of band.
    ///
    /// Available once the key agreement completed; stays available after the
    /// keys are gone.
    pub fn verification_code(&self) -> Option<&str> {
        self.verification_code.as_deref()
    }

    /// Ratchet progress for `direction`, while keys are live.
    pub fn ratchet_snapshot(&self, direction: Direction) -> Option<RatchetSnapshot> {
        let keys = self.keys.as_ref()?;
        if direction == self.role.send_direction() {
            Some(keys.engine.send_snapshot())
        } else {
            Some(keys.engine.receive_snapshot())
        }
    }

    /// The error that failed the session.
    ///
    /// For diagnostics only; show [`SessionError::user_message`] to users.
    pub fn failure(&self) -> Option<&SessionError> {
        self.failure.as_ref().map(|(_, err)| err)
    }

    /// Index of the first incoming chunk not yet verified.
    pub fn next_missing_chunk(&self) -> Option<u64> {
        let transfer = self.transfer.as_ref()?;
        Some(transfer.incoming.verifier.next_missing())
    }

    /// Whether an incoming transfer has been fully verified.
    pub fn verify_manifest_complete(&self) -> bool {
        self.transfer
            .as_ref()
            .is_some_and(|transfer| transfer.incoming.verifier.verify_manifest_complete())
    }

    /// Status of the transfer.
    pub fn status(&self) -> ManifestStatus {
        if let Some((fault, _)) = &self.failure {
            return ManifestStatus::Failed(*fault);
        }

        let Some(transfer) = &self.transfer else {
            return ManifestStatus::InProgress {
                verified_chunks: 0,
                expected_chunks: None,
                rejected: None,
            };
        };

        if self.state == SessionState::Completed {
            let summary = if transfer.incoming.started() {
                transfer.incoming.verifier.summary()
            } else {
                transfer.outgoing.manifest.summary()
            };
            return ManifestStatus::Completed {
                chunk_count: summary.chunk_count,
                total_bytes: summary.total_bytes,
            };
        }

        let verifier = &transfer.incoming.verifier;
        ManifestStatus::InProgress {
            verified_chunks: verifier.verified_chunks(),
            expected_chunks: verifier.expected_chunks(),
            rejected: transfer.incoming.rejected,
        }
    }

    /// Begin the session.
    ///
    /// The initiator picks a session id and sends Hello; the responder starts
    /// waiting for one.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` unless `Uninitialized`
    /// - `SessionError::Protocol` if the Hello cannot be encoded
    pub fn start(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        self.require(SessionState::Uninitialized, "start")?;

        let mut actions = Vec::new();
        if self.role == Role::Responder {
            actions.push(self.transition(SessionState::Handshaking));
            return Ok(actions);
        }

        let env = self.env.clone();
        let mut rng = EnvRng::new(&env);
        let session_id = env.random_u128().to_be_bytes();
        let initiator = HybridInitiator::new(&mut rng);
        let keyset = ReceiveKeyset::generate(0, &mut rng);

        let offer = initiator.offer();
        let hello = Payload::Hello(Hello {
            version: offer.version,
            x25519_public: offer.x25519_public,
            mlkem_public: offer.mlkem_public.clone(),
            cipher_suites: self.offered_suites(),
            keyset: envelope::advert_to_wire(&keyset.advert()),
        });

        self.session_id = Some(session_id);
        let frame = hello.into_frame(self.frame_header(Opcode::Hello))?;

        self.handshake = Some(PendingHandshake { initiator, keyset });
        actions.push(self.transition(SessionState::Handshaking));
        actions.push(SessionAction::SendFrame(frame));
        Ok(actions)
    }

    /// Process a frame from the peer.
    ///
    /// # Errors
    ///
    /// Any error returned leaves the session as it was:
    ///
    /// - `SessionError::InvalidState` in a terminal state
    /// - `SessionError::UnexpectedFrame` for an opcode the state does not allow
    /// - `SessionError::SessionMismatch` for another session's frame
    /// - `SessionError::Protocol` if the payload does not decode
    /// - `SessionError::Crypto` for a rejected chunk (ratchet window, AEAD,
    ///   replay, duplicate); see [`SessionError::is_transient`]
    pub fn handle_frame(&mut self, frame: &Frame) -> Result<Vec<SessionAction>, SessionError> {
        if self.state.is_terminal() {
            return Err(SessionError::InvalidState { state: self.state, operation: "handle_frame" });
        }

        let Some(opcode) = frame.header.opcode_enum() else {
            return Err(SessionError::UnexpectedFrame {
                state: self.state,
                opcode: frame.header.opcode(),
            });
        };

        // The session id travels in the clear; matching it only routes the
        // frame to this session and proves nothing about the sender.
        if self.session_id.is_some_and(|id| &id != frame.header.session_id()) {
            return Err(SessionError::SessionMismatch);
        }

        match (self.state, self.role, opcode) {
            // Unauthenticated: anyone who can see the session id can end it,
            // as anyone on the path could by dropping its frames.
            (_, _, Opcode::Abort) => {
                let Payload::Abort(Abort { code }) = Payload::from_frame(frame)? else {
                    unreachable!("payload type follows the opcode");
                };
                Ok(self.fail(None, SessionError::PeerAborted { code }))
            },
            (SessionState::Handshaking, Role::Responder, Opcode::Hello) => {
                let Payload::Hello(hello) = Payload::from_frame(frame)? else {
                    unreachable!("payload type follows the opcode");
                };
                let session_id = *frame.header.session_id();
                let result = self.handle_hello(session_id, &hello);
                self.settle(None, result)
            },
            (SessionState::Handshaking, Role::Initiator, Opcode::HelloReply) => {
                let Payload::HelloReply(reply) = Payload::from_frame(frame)? else {
                    unreachable!("payload type follows the opcode");
                };
                let result = self.handle_reply(&reply);
                self.settle(None, result)
            },
            (SessionState::Transferring, _, Opcode::Chunk) => {
                let Payload::Chunk(chunk) = Payload::from_frame(frame)? else {
                    unreachable!("payload type follows the opcode");
                };
                let index = chunk.index;
                let result = self.receive_chunk(&frame.header, chunk);
                self.settle(Some(index), result)
            },
            (SessionState::Transferring, _, Opcode::Finish) => {
                let Payload::Finish(control) = Payload::from_frame(frame)? else {
                    unreachable!("payload type follows the opcode");
                };
                let result = self.receive_finish(&frame.header, &control);
                self.settle(None, result)
            },
            (SessionState::Transferring, _, Opcode::Receipt) => {
                let Payload::Receipt(control) = Payload::from_frame(frame)? else {
                    unreachable!("payload type follows the opcode");
                };
                let result = self.receive_receipt(&frame.header, &control);
                self.settle(None, result)
            },
            (state, _, opcode) => {
                Err(SessionError::UnexpectedFrame { state, opcode: opcode.to_u16() })
            },
        }
    }

    /// Seal the next chunk of the outgoing file.
    ///
    /// Chunks are numbered in call order from 0.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` unless transferring, or after
    ///   [`finish`](Self::finish)
    /// - `SessionError::ChunkTooLarge` above `max_chunk_size`
    pub fn send_chunk(&mut self, plaintext: &[u8]) -> Result<Vec<SessionAction>, SessionError> {
        self.send_chunks(&[plaintext])
    }

    /// Seal several chunks at once.
    ///
    /// Keys, nonces and manifest links are assigned in slice order before any
    /// encryption starts; the AEAD work then runs on the rayon pool. Frames
    /// are returned in slice order.
    ///
    /// # Errors
    ///
    /// As for [`send_chunk`](Self::send_chunk). Size limits are checked for
    /// the whole batch before anything is sealed.
    pub fn send_chunks<P>(&mut self, chunks: &[P]) -> Result<Vec<SessionAction>, SessionError>
    where
        P: AsRef<[u8]> + Sync,
    {
        self.require_open_outgoing("send_chunk")?;
        for chunk in chunks {
            self.check_chunk_size(chunk.as_ref())?;
        }

        let env = self.env.clone();
        let mut rng = EnvRng::new(&env);
        let mut prepared = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match self.prepare_chunk(chunk.as_ref(), None, &mut rng) {
                Ok(chunk) => prepared.push(chunk),
                Err(err) => return self.settle_send(None, Err(err)),
            }
        }

        let Some(keys) = &self.keys else {
            return Err(self.invalid("send_chunk"));
        };
        let frames = pipeline::seal_all(&keys.send_cipher, prepared)?;
        debug!(count = frames.len(), "sealed chunks");

        Ok(frames.into_iter().map(SessionAction::SendFrame).collect())
    }

    /// Seal an already-sent chunk again under a fresh key and nonce.
    ///
    /// The plaintext must be the one originally sent at `index`; the manifest
    /// link it carries is unchanged, so the receiver verifies it like the
    /// original.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` unless transferring
    /// - `SessionError::UnknownChunk` if `index` was never sent or the
    ///   plaintext differs
    pub fn resend_chunk(
        &mut self,
        index: u64,
        plaintext: &[u8],
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.require(SessionState::Transferring, "resend_chunk")?;

        let entry = self
            .transfer
            .as_ref()
            .and_then(|transfer| transfer.outgoing.manifest.entry(index).copied())
            .ok_or(SessionError::UnknownChunk { index })?;
        if !ct_eq_32(&entry.content_hash, &content_hash(index, plaintext)) {
            return Err(SessionError::UnknownChunk { index });
        }

        let env = self.env.clone();
        let mut rng = EnvRng::new(&env);
        let prepared = match self.prepare_chunk(plaintext, Some(entry), &mut rng) {
            Ok(prepared) => prepared,
            Err(err) => return self.settle_send(Some(index), Err(err)),
        };

        let Some(keys) = &self.keys else {
            return Err(self.invalid("resend_chunk"));
        };
        let frame = prepared.seal(&keys.send_cipher)?;
        debug!(index, "resealed chunk");

        Ok(vec![SessionAction::SendFrame(frame)])
    }

    /// Close the outgoing file by sending its sealed manifest summary.
    ///
    /// May be called again to resend the summary while waiting for the
    /// receipt.
    ///
    /// # Errors
    ///
    /// - `SessionError::InvalidState` unless transferring, or once the
    ///   receipt has been accepted
    pub fn finish(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        self.require(SessionState::Transferring, "finish")?;

        let Some(transfer) = self.transfer.as_mut() else {
            return Err(self.invalid("finish"));
        };
        if transfer.outgoing.acknowledged {
            return Err(self.invalid("finish"));
        }

        let summary = transfer.outgoing.manifest.summary();
        transfer.outgoing.finished = Some(summary);
        info!(chunks = summary.chunk_count, bytes = summary.total_bytes, "sending manifest");

        let result = self.seal_control(Opcode::Finish, &summary.to_bytes());
        self.settle_send(None, result.map(|frame| vec![SessionAction::SendFrame(frame)]))
    }

    /// Cancel the session.
    ///
    /// Wipes all keys at once and returns an Abort frame for the peer. A
    /// session that already ended is left alone.
    pub fn abort(&mut self) -> Vec<SessionAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.fail(None, SessionError::Cancelled)
    }

    fn handle_hello(
        &mut self,
        session_id: [u8; 16],
        hello: &Hello,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let env = self.env.clone();
        let mut rng = EnvRng::new(&env);

        let suite = CipherSuite::negotiate(&self.config.cipher_suites, &hello.cipher_suites)
            .map_err(CryptoError::from)?;
        let peer = peer_keyset(&hello.keyset)?;
        let own = ReceiveKeyset::generate(0, &mut rng);
        let own_advert = envelope::advert_to_wire(&own.advert());

        let context =
            handshake_context(&session_id, &hello.cipher_suites, suite, &hello.keyset, &own_advert);
        let offer = HandshakeOffer {
            version: hello.version,
            x25519_public: hello.x25519_public,
            mlkem_public: hello.mlkem_public.clone(),
        };
        let (answer, root) = respond(&offer, &context, &mut rng).map_err(CryptoError::from)?;
        let confirmation = root.confirmation_tag(Role::Responder);

        self.session_id = Some(session_id);
        let mut actions = self.establish(root, suite, own, peer)?;

        let reply = Payload::HelloReply(HelloReply {
            version: answer.version,
            x25519_public: answer.x25519_public,
            mlkem_ciphertext: answer.mlkem_ciphertext,
            cipher_suite: suite.id(),
            keyset: own_advert,
            confirmation,
        });
        let header = self.frame_header(Opcode::HelloReply);
        actions.push(SessionAction::SendFrame(reply.into_frame(header)?));
        Ok(actions)
    }

    fn handle_reply(&mut self, reply: &HelloReply) -> Result<Vec<SessionAction>, SessionError> {
        let Some(PendingHandshake { initiator, keyset }) = self.handshake.take() else {
            return Err(self.invalid("handle HelloReply"));
        };

        let suite = CipherSuite::from_id(reply.cipher_suite)
            .filter(|suite| self.config.cipher_suites.contains(suite))
            .ok_or(HandshakeError::UnofferedCipherSuite { suite_id: reply.cipher_suite })
            .map_err(CryptoError::from)?;
        let peer = peer_keyset(&reply.keyset)?;

        let session_id = self.session_id.unwrap_or_default();
        let own_advert = envelope::advert_to_wire(&keyset.advert());
        let context = handshake_context(
            &session_id,
            &self.offered_suites(),
            suite,
            &own_advert,
            &reply.keyset,
        );
        let answer = HandshakeAnswer {
            version: reply.version,
            x25519_public: reply.x25519_public,
            mlkem_ciphertext: reply.mlkem_ciphertext.clone(),
        };

        let root = initiator.finish(&answer, &context).map_err(CryptoError::from)?;
        root.verify_confirmation(Role::Responder, &reply.confirmation)
            .map_err(CryptoError::from)?;

        self.establish(root, suite, keyset, peer)
    }

    /// Seed the ratchet from an agreed root and open the transfer.
    fn establish(
        &mut self,
        root: SessionRootSecret,
        suite: CipherSuite,
        own: ReceiveKeyset,
        peer: PeerKeyset,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let mut actions = vec![self.transition(SessionState::Ratcheting)];

        let code = root.short_auth_code();
        let engine = RatchetEngine::new(root, self.role, own, peer, self.config.ratchet_config())
            .map_err(|err| invalid_peer_key("ratchet keyset", &err))?;
        self.verification_code = Some(code);

        let session_id = self.session_id.unwrap_or_default();
        let send = self.role.send_direction();
        let receive = self.role.receive_direction();

        self.keys = Some(SessionKeys::new(engine, suite, &self.config));
        self.suite = Some(suite);
        self.transfer = Some(Transfer {
            outgoing: Outgoing {
                manifest: TransferManifest::new(&session_id, send),
                finished: None,
                acknowledged: false,
            },
            incoming: Incoming {
                verifier: IntegrityVerifier::new(
                    &session_id,
                    receive,
                    self.config.max_pending_chunks,
                ),
                receipt_sent: false,
                rejected: None,
            },
        });
        info!(role = ?self.role, ?suite, "session keys established");

        actions.push(self.transition(SessionState::Transferring));
        Ok(actions)
    }

    fn receive_chunk(
        &mut self,
        header: &FrameHeader,
        chunk: SealedChunk,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let SealedChunk { ratchet, index, prev_link, ciphertext, tag } = chunk;

        if let Some(transfer) = &self.transfer {
            if let Err(err @ IntegrityError::DuplicateChunk { .. }) =
                transfer.incoming.verifier.check_index(index)
            {
                return Err(CryptoError::from(err).into());
            }
        }
        if ciphertext.len() > self.config.max_chunk_size {
            return Err(SessionError::ChunkTooLarge {
                size: ciphertext.len(),
                max: self.config.max_chunk_size,
            });
        }

        let opened =
            self.open_sealed(header, &ratchet, &ciphertext, &tag, Some((index, &prev_link)))?;

        // A chunk the verifier would refuse must not consume its key or nonce,
        // or the same frame could never be accepted later.
        let Some(transfer) = self.transfer.as_ref() else {
            return Err(self.invalid("receive chunk"));
        };
        transfer.incoming.verifier.admit(index)?;
        let plaintext = self.commit_opened(opened)?;

        let Some(transfer) = self.transfer.as_mut() else {
            return Err(self.invalid("receive chunk"));
        };
        let verified = transfer.incoming.verifier.accept(index, &prev_link, plaintext)?;

        let mut actions: Vec<SessionAction> = verified
            .into_iter()
            .map(|chunk| SessionAction::DeliverChunk {
                index: chunk.index,
                plaintext: chunk.plaintext,
            })
            .collect();

        let incoming = &transfer.incoming;
        if incoming.verifier.verify_manifest_complete() && !incoming.receipt_sent {
            actions.extend(self.acknowledge_incoming()?);
        }
        Ok(actions)
    }

    fn receive_finish(
        &mut self,
        header: &FrameHeader,
        control: &SealedControl,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let opened =
            self.open_sealed(header, &control.ratchet, &control.ciphertext, &control.tag, None)?;
        let plaintext = self.commit_opened(opened)?;
        let summary = ManifestSummary::from_bytes(&plaintext).map_err(CryptoError::from)?;

        let Some(transfer) = self.transfer.as_mut() else {
            return Err(self.invalid("receive Finish"));
        };
        let complete = transfer.incoming.verifier.finish(summary).map_err(CryptoError::from)?;
        info!(chunks = summary.chunk_count, complete, "manifest received");

        if complete {
            return self.acknowledge_incoming();
        }
        Ok(Vec::new())
    }

    fn receive_receipt(
        &mut self,
        header: &FrameHeader,
        control: &SealedControl,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let waiting = self
            .transfer
            .as_ref()
            .is_some_and(|t| t.outgoing.finished.is_some() && !t.outgoing.acknowledged);
        if !waiting {
            return Err(SessionError::UnexpectedFrame {
                state: self.state,
                opcode: Opcode::Receipt.to_u16(),
            });
        }

        let opened =
            self.open_sealed(header, &control.ratchet, &control.ciphertext, &control.tag, None)?;
        let plaintext = self.commit_opened(opened)?;
        let receipt = ManifestSummary::from_bytes(&plaintext).map_err(CryptoError::from)?;

        let Some(transfer) = self.transfer.as_mut() else {
            return Err(self.invalid("receive Receipt"));
        };
        let matches = transfer.outgoing.finished.is_some_and(|sent| sent.ct_matches(&receipt));
        if !matches {
            return Err(CryptoError::from(IntegrityError::ConflictingManifest).into());
        }

        transfer.outgoing.acknowledged = true;
        info!(chunks = receipt.chunk_count, "receipt accepted");
        Ok(self.complete_if_done())
    }

    /// Send a receipt for the verified incoming file.
    fn acknowledge_incoming(&mut self) -> Result<Vec<SessionAction>, SessionError> {
        let Some(transfer) = self.transfer.as_ref() else {
            return Err(self.invalid("send Receipt"));
        };
        let summary = transfer.incoming.verifier.summary();

        let frame = match self.seal_control(Opcode::Receipt, &summary.to_bytes()) {
            Ok(frame) => frame,
            Err(err) => return self.settle_send(None, Err(err)),
        };
        if let Some(transfer) = self.transfer.as_mut() {
            transfer.incoming.receipt_sent = true;
        }
        info!(chunks = summary.chunk_count, bytes = summary.total_bytes, "manifest verified");

        let mut actions = vec![SessionAction::SendFrame(frame)];
        actions.extend(self.complete_if_done());
        Ok(actions)
    }

    /// Move to `Completed` once every started direction is done.
    fn complete_if_done(&mut self) -> Vec<SessionAction> {
        let Some(transfer) = &self.transfer else {
            return Vec::new();
        };

        let outgoing = transfer.outgoing.started();
        let incoming = transfer.incoming.started();
        let done = (outgoing || incoming)
            && (!outgoing || transfer.outgoing.acknowledged)
            && (!incoming || transfer.incoming.done());
        if !done {
            return Vec::new();
        }

        self.keys = None;
        let from = self.state;
        let changed = self.transition(SessionState::Completed);
        debug!(?from, "keys wiped on completion");
        vec![changed, SessionAction::Status(self.status())]
    }

    /// Authenticate and decrypt a sealed frame without changing any state.
    fn open_sealed(
        &self,
        header: &FrameHeader,
        ratchet: &RatchetHeaderWire,
        ciphertext: &[u8],
        tag: &[u8; 16],
        chunk: Option<(u64, &[u8; 32])>,
    ) -> Result<Opened, SessionError> {
        let sequence = header.sequence();
        if sequence >= self.config.nonce_limit {
            return Err(SessionError::SequenceOutOfRange { sequence });
        }
        let Some(keys) = self.keys.as_ref() else {
            return Err(self.invalid("open sealed frame"));
        };

        let ratchet = envelope::ratchet_from_wire(ratchet);
        let stage = keys.engine.stage_receive(&ratchet)?;

        let nonce = skiff_crypto::DirectionalNonce {
            direction: keys.receive_nonces.direction(),
            counter: sequence,
        };
        let aad = envelope::frame_aad(header, &ratchet, chunk);
        let plaintext = keys
            .receive_cipher
            .decrypt(ciphertext, tag, stage.message_key(), &nonce, &aad)
            .map_err(CryptoError::from)?;

        Ok(Opened { plaintext, stage, sequence, epoch: ratchet.epoch })
    }

    /// Spend the nonce and roll the receive ratchet forward for a frame that
    /// is about to be processed.
    fn commit_opened(&mut self, opened: Opened) -> Result<Vec<u8>, SessionError> {
        let env = self.env.clone();
        let mut rng = EnvRng::new(&env);
        let Some(keys) = self.keys.as_mut() else {
            return Err(self.invalid("commit sealed frame"));
        };

        keys.receive_nonces.reserve(opened.sequence).map_err(CryptoError::from)?;
        if let Some(kind) = keys.engine.commit(opened.stage, &mut rng) {
            debug!(?kind, epoch = opened.epoch, "receive ratchet stepped");
        }
        Ok(opened.plaintext)
    }

    /// Derive key, nonce and manifest link for one outgoing chunk.
    ///
    /// `resend` carries the original manifest entry for a retransmission;
    /// otherwise the chunk is appended to the manifest.
    fn prepare_chunk<'a>(
        &mut self,
        plaintext: &'a [u8],
        resend: Option<ManifestEntry>,
        rng: &mut EnvRng<'_, E>,
    ) -> Result<PreparedChunk<'a>, SessionError> {
        let state = self.state;
        let (Some(keys), Some(transfer)) = (self.keys.as_mut(), self.transfer.as_mut()) else {
            return Err(SessionError::InvalidState { state, operation: "send_chunk" });
        };

        let (ratchet, key) = keys.engine.next_send(rng)?;
        let nonce = keys.send_nonces.allocate().map_err(CryptoError::from)?;
        let entry = match resend {
            Some(entry) => entry,
            None => transfer.outgoing.manifest.append(plaintext),
        };

        let mut flags = envelope::step_flags(&ratchet);
        if flags.contains(FrameFlags::RATCHET_STEP) {
            let pq = ratchet.pq_ciphertext.is_some();
            debug!(epoch = ratchet.epoch, pq, "send ratchet stepped");
        }
        if resend.is_some() {
            flags = flags.with(FrameFlags::RETRANSMIT);
        }

        let mut header = FrameHeader::new(Opcode::Chunk);
        header.set_session_id(self.session_id.unwrap_or_default());
        header.set_sequence(nonce.counter);
        header.set_flags(flags);

        Ok(PreparedChunk {
            header,
            ratchet,
            key,
            nonce,
            index: entry.index,
            prev_link: entry.prev_link,
            plaintext,
        })
    }

    /// Seal a Finish or Receipt carrying `plaintext`.
    fn seal_control(&mut self, opcode: Opcode, plaintext: &[u8]) -> Result<Frame, SessionError> {
        let env = self.env.clone();
        let mut rng = EnvRng::new(&env);
        let mut header = self.frame_header(opcode);

        let Some(keys) = self.keys.as_mut() else {
            return Err(self.invalid("seal control frame"));
        };
        let (ratchet, key) = keys.engine.next_send(&mut rng)?;
        let nonce = keys.send_nonces.allocate().map_err(CryptoError::from)?;

        header.set_sequence(nonce.counter);
        header.set_flags(envelope::step_flags(&ratchet));
        let aad = envelope::frame_aad(&header, &ratchet, None);
        let (ciphertext, tag) = keys.send_cipher.encrypt(plaintext, &key, &nonce, &aad);

        let control =
            SealedControl { ratchet: envelope::ratchet_to_wire(&ratchet), ciphertext, tag };
        let payload = match opcode {
            Opcode::Receipt => Payload::Receipt(control),
            _ => Payload::Finish(control),
        };
        Ok(payload.into_frame(header)?)
    }

    /// Route an error: fatal ones fail the session, per-chunk rejections are
    /// recorded, everything else is handed back.
    fn settle(
        &mut self,
        index: Option<u64>,
        result: Result<Vec<SessionAction>, SessionError>,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let err = match result {
            Ok(actions) => return Ok(actions),
            Err(err) => err,
        };

        if err.is_fatal() {
            return Ok(self.fail(index, err));
        }

        let duplicate = matches!(
            err,
            SessionError::Crypto(CryptoError::Integrity(IntegrityError::DuplicateChunk { .. }))
        );
        if err.is_transient() && !duplicate {
            let fault = ChunkFault::new(index, &err);
            warn!(index = ?fault.index, layer = ?fault.layer, "frame rejected");
            if let Some(transfer) = self.transfer.as_mut() {
                transfer.incoming.rejected = Some(fault);
            }
        }
        Err(err)
    }

    /// Route an error from the sending side.
    ///
    /// By the time sealing fails, ratchet keys, nonces and manifest entries
    /// may already be spent on frames that will never leave, so the outgoing
    /// stream cannot continue: any cryptographic error ends the session.
    /// Nothing here is recorded as an incoming rejection.
    fn settle_send(
        &mut self,
        index: Option<u64>,
        result: Result<Vec<SessionAction>, SessionError>,
    ) -> Result<Vec<SessionAction>, SessionError> {
        match result {
            Err(err @ SessionError::Crypto(_)) => Ok(self.fail(index, err)),
            other => other,
        }
    }

    /// Enter `Failed`, wiping all key material.
    fn fail(&mut self, index: Option<u64>, err: SessionError) -> Vec<SessionAction> {
        let fault = ChunkFault::new(index, &err);
        warn!(index = ?fault.index, layer = ?fault.layer, "session failed");

        self.keys = None;
        self.handshake = None;

        let abort_code = match fault.layer {
            FailureLayer::Peer => None,
            FailureLayer::Cancelled => Some(Abort::CANCELLED),
            FailureLayer::Resource => Some(Abort::RESOURCE_EXHAUSTED),
            FailureLayer::Protocol => Some(Abort::PROTOCOL_VIOLATION),
            FailureLayer::Handshake
            | FailureLayer::Ratchet
            | FailureLayer::Aead
            | FailureLayer::HashChain => Some(Abort::VERIFICATION_FAILED),
        };

        self.failure = Some((fault, err));
        let mut actions = vec![self.transition(SessionState::Failed)];
        actions.push(SessionAction::Status(ManifestStatus::Failed(fault)));

        if let Some(code) = abort_code {
            let header = self.frame_header(Opcode::Abort);
            if let Ok(frame) = Payload::Abort(Abort { code }).into_frame(header) {
                actions.push(SessionAction::SendFrame(frame));
            }
        }
        actions
    }

    /// The single place where the state changes.
    fn transition(&mut self, to: SessionState) -> SessionAction {
        let from = self.state;
        debug_assert!(from.can_transition_to(to), "illegal transition {from:?} -> {to:?}");
        self.state = to;
        info!(?from, ?to, "session state changed");
        SessionAction::StateChanged { from, to }
    }

    fn require(&self, state: SessionState, operation: &'static str) -> Result<(), SessionError> {
        if self.state == state { Ok(()) } else { Err(self.invalid(operation)) }
    }

    fn require_open_outgoing(&self, operation: &'static str) -> Result<(), SessionError> {
        self.require(SessionState::Transferring, operation)?;
        let finished = self.transfer.as_ref().is_some_and(|t| t.outgoing.finished.is_some());
        if finished { Err(self.invalid(operation)) } else { Ok(()) }
    }

    fn invalid(&self, operation: &'static str) -> SessionError {
        SessionError::InvalidState { state: self.state, operation }
    }

    fn check_chunk_size(&self, chunk: &[u8]) -> Result<(), SessionError> {
        if chunk.len() > self.config.max_chunk_size {
            return Err(SessionError::ChunkTooLarge {
                size: chunk.len(),
                max: self.config.max_chunk_size,
            });
        }
        Ok(())
    }

    fn frame_header(&self, opcode: Opcode) -> FrameHeader {
        let mut header = FrameHeader::new(opcode);
        header.set_session_id(self.session_id.unwrap_or_default());
        header
    }

    fn offered_suites(&self) -> Vec<u8> {
        self.config.cipher_suites.iter().map(|suite| suite.id()).collect()
    }
}

fn invalid_peer_key(component: &'static str, err: &impl std::fmt::Display) -> SessionError {
    CryptoError::from(HandshakeError::InvalidPeerKey { component, reason: err.to_string() }).into()
}

fn peer_keyset(advert: &KeyAdvertWire) -> Result<PeerKeyset, SessionError> {
    PeerKeyset::from_advert(&envelope::advert_from_wire(advert))
        .map_err(|err| invalid_peer_key("ratchet keyset", &err))
}

/// Everything the two sides agreed on besides the ephemeral keys.
fn handshake_context(
    session_id: &[u8; 16],
    offered: &[u8],
    selected: CipherSuite,
    initiator: &KeyAdvertWire,
    responder: &KeyAdvertWire,
) -> Vec<u8> {
    fn push(out: &mut Vec<u8>, bytes: &[u8]) {
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(bytes);
    }
    fn push_advert(out: &mut Vec<u8>, advert: &KeyAdvertWire) {
        out.extend_from_slice(&advert.generation.to_be_bytes());
        out.extend_from_slice(&advert.dh_public);
        push(out, &advert.pq_public);
    }

    let mut context = Vec::with_capacity(16 + offered.len() + 2 * 1230);
    context.extend_from_slice(session_id);
    push(&mut context, offered);
    context.push(selected.id());
    push_advert(&mut context, initiator);
    push_advert(&mut context, responder);
    context
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha20Rng;
    use skiff_crypto::{AuthError, RatchetError, ResourceError, StepKind};

    use super::*;

    #[derive(Clone)]
    struct SeededEnv(Arc<Mutex<ChaCha20Rng>>);

    impl SeededEnv {
        fn new(seed: u64) -> Self {
            Self(Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))))
        }
    }

    impl Environment for SeededEnv {
        fn random_bytes(&self, buffer: &mut [u8]) {
            self.0.lock().unwrap().fill_bytes(buffer);
        }
    }

    fn frames(actions: &[SessionAction]) -> Vec<Frame> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::SendFrame(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    fn delivered(actions: &[SessionAction]) -> Vec<(u64, Vec<u8>)> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::DeliverChunk { index, plaintext } => {
                    Some((*index, plaintext.clone()))
                },
                _ => None,
            })
            .collect()
    }

    fn pair_with(config: SessionConfig) -> (Session<SeededEnv>, Session<SeededEnv>) {
        let mut alice = Session::new(Role::Initiator, config.clone(), SeededEnv::new(1)).unwrap();
        let mut bob = Session::new(Role::Responder, config, SeededEnv::new(2)).unwrap();

        bob.start().unwrap();
        let hello = frames(&alice.start().unwrap());
        let reply = frames(&bob.handle_frame(&hello[0]).unwrap());
        alice.handle_frame(&reply[0]).unwrap();
        (alice, bob)
    }

    fn pair() -> (Session<SeededEnv>, Session<SeededEnv>) {
        pair_with(SessionConfig::default())
    }

    fn send(from: &mut Session<SeededEnv>, chunk: &[u8]) -> Frame {
        frames(&from.send_chunk(chunk).unwrap()).remove(0)
    }

    #[test]
    fn handshake_reaches_transferring_on_both_sides() {
        let (alice, bob) = pair();

        assert_eq!(alice.state(), SessionState::Transferring);
        assert_eq!(bob.state(), SessionState::Transferring);
        assert_eq!(alice.session_id(), bob.session_id());
        assert_eq!(alice.cipher_suite(), Some(CipherSuite::XChaCha20Poly1305));
        assert!(alice.verification_code().is_some());
        assert_eq!(alice.verification_code(), bob.verification_code());
    }

    #[test]
    fn responder_walks_every_handshake_state() {
        let mut alice =
            Session::new(Role::Initiator, SessionConfig::default(), SeededEnv::new(1)).unwrap();
        let mut bob =
            Session::new(Role::Responder, SessionConfig::default(), SeededEnv::new(2)).unwrap();

        bob.start().unwrap();
        let hello = frames(&alice.start().unwrap());
        let actions = bob.handle_frame(&hello[0]).unwrap();

        let transitions: Vec<_> = actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::StateChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect();
        assert_eq!(transitions, vec![
            (SessionState::Handshaking, SessionState::Ratcheting),
            (SessionState::Ratcheting, SessionState::Transferring),
        ]);
    }

    #[test]
    fn chunk_round_trip_delivers_plaintext() {
        let (mut alice, mut bob) = pair();

        let frame = send(&mut alice, b"hello skiff");
        let actions = bob.handle_frame(&frame).unwrap();

        assert_eq!(delivered(&actions), vec![(0, b"hello skiff".to_vec())]);
    }

    #[test]
    fn transfer_completes_after_receipt() {
        let (mut alice, mut bob) = pair();

        for chunk in [b"one".as_slice(), b"two", b"three"] {
            let frame = send(&mut alice, chunk);
            bob.handle_frame(&frame).unwrap();
        }
        let finish = frames(&alice.finish().unwrap());
        let actions = bob.handle_frame(&finish[0]).unwrap();

        assert_eq!(bob.state(), SessionState::Completed);
        assert_eq!(bob.status(), ManifestStatus::Completed { chunk_count: 3, total_bytes: 11 });
        assert!(bob.ratchet_snapshot(Direction::InitiatorToResponder).is_none());

        let receipt = frames(&actions);
        alice.handle_frame(&receipt[0]).unwrap();
        assert_eq!(alice.state(), SessionState::Completed);
    }

    #[test]
    fn finish_before_last_chunk_waits() {
        let (mut alice, mut bob) = pair();

        let first = send(&mut alice, b"a");
        let second = send(&mut alice, b"b");
        let finish = frames(&alice.finish().unwrap());

        bob.handle_frame(&first).unwrap();
        assert!(frames(&bob.handle_frame(&finish[0]).unwrap()).is_empty());
        assert_eq!(bob.state(), SessionState::Transferring);

        let actions = bob.handle_frame(&second).unwrap();
        assert_eq!(delivered(&actions), vec![(1, b"b".to_vec())]);
        assert_eq!(bob.state(), SessionState::Completed);
        assert_eq!(frames(&actions)[0].header.opcode_enum(), Some(Opcode::Receipt));
    }

    #[test]
    fn tampered_chunk_is_rejected_and_session_survives() {
        let (mut alice, mut bob) = pair();

        let frame = send(&mut alice, b"secret");
        let mut wire = frame.to_vec().unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        let tampered = Frame::decode(&wire).unwrap();

        let err = bob.handle_frame(&tampered).unwrap_err();
        assert!(err.is_transient(), "unexpected error {err:?}");
        assert_eq!(bob.state(), SessionState::Transferring);

        let ManifestStatus::InProgress { rejected, .. } = bob.status() else {
            panic!("session should still be in progress");
        };
        assert_eq!(rejected.map(|fault| fault.index), Some(Some(0)));

        // The original still opens
        let actions = bob.handle_frame(&frame).unwrap();
        assert_eq!(delivered(&actions).len(), 1);
    }

    #[test]
    fn ciphertext_flip_is_an_aead_rejection() {
        let (mut alice, mut bob) = pair();

        let frame = send(&mut alice, &[7u8; 64]);
        let Payload::Chunk(mut chunk) = Payload::from_frame(&frame).unwrap() else {
            panic!("expected a chunk");
        };
        chunk.ciphertext[10] ^= 0xFF;
        let tampered = Payload::Chunk(chunk).into_frame(frame.header).unwrap();

        let err = bob.handle_frame(&tampered).unwrap_err();
        assert_eq!(err, SessionError::Crypto(CryptoError::Auth(AuthError::TagMismatch)));

        let ManifestStatus::InProgress { rejected, .. } = bob.status() else {
            panic!("session should still be in progress");
        };
        assert_eq!(rejected, Some(ChunkFault { index: Some(0), layer: FailureLayer::Aead }));
    }

    #[test]
    fn replayed_chunk_is_dropped() {
        let (mut alice, mut bob) = pair();

        let frame = send(&mut alice, b"once");
        bob.handle_frame(&frame).unwrap();

        let err = bob.handle_frame(&frame).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(bob.state(), SessionState::Transferring);
    }

    #[test]
    fn swapped_chunks_are_reordered() {
        let (mut alice, mut bob) = pair();

        let first = send(&mut alice, b"first");
        let second = send(&mut alice, b"second");

        assert!(delivered(&bob.handle_frame(&second).unwrap()).is_empty());
        let actions = bob.handle_frame(&first).unwrap();
        assert_eq!(delivered(&actions), vec![
            (0, b"first".to_vec()),
            (1, b"second".to_vec())
        ]);
    }

    #[test]
    fn wrong_link_fails_the_session() {
        let (mut alice, mut bob) = pair();

        // Chunk 0 sealed with a forged link: authenticates, but breaks the chain
        let _original = send(&mut alice, b"zero");
        let mut forged =
            alice.transfer.as_ref().unwrap().outgoing.manifest.entry(0).copied().unwrap();
        forged.prev_link = [0xAA; 32];
        let env = alice.env.clone();
        let mut rng = EnvRng::new(&env);
        let prepared = alice.prepare_chunk(b"zero", Some(forged), &mut rng).unwrap();
        let forged_frame = prepared.seal(&alice.keys.as_ref().unwrap().send_cipher).unwrap();

        let actions = bob.handle_frame(&forged_frame).unwrap();
        assert_eq!(bob.state(), SessionState::Failed);
        assert!(delivered(&actions).is_empty());
        assert_eq!(
            bob.status(),
            ManifestStatus::Failed(ChunkFault { index: Some(0), layer: FailureLayer::HashChain })
        );

        let abort = frames(&actions);
        assert_eq!(abort[0].header.opcode_enum(), Some(Opcode::Abort));

        alice.handle_frame(&abort[0]).unwrap();
        assert_eq!(alice.state(), SessionState::Failed);
        assert_eq!(
            alice.failure(),
            Some(&SessionError::PeerAborted { code: Abort::VERIFICATION_FAILED })
        );
    }

    #[test]
    fn duplicate_after_delivery_is_recoverable() {
        let (mut alice, mut bob) = pair();

        let frame = send(&mut alice, b"dup");
        bob.handle_frame(&frame).unwrap();
        let again = frames(&alice.resend_chunk(0, b"dup").unwrap()).remove(0);

        assert!(again.header.flags().contains(FrameFlags::RETRANSMIT));
        let err = bob.handle_frame(&again).unwrap_err();
        assert_eq!(
            err,
            SessionError::Crypto(CryptoError::Integrity(IntegrityError::DuplicateChunk {
                index: 0
            }))
        );
        assert_eq!(bob.state(), SessionState::Transferring);
    }

    #[test]
    fn resend_recovers_a_lost_chunk() {
        let (mut alice, mut bob) = pair();

        let _lost = send(&mut alice, b"lost");
        let kept = send(&mut alice, b"kept");
        bob.handle_frame(&kept).unwrap();
        assert_eq!(bob.next_missing_chunk(), Some(0));

        let again = frames(&alice.resend_chunk(0, b"lost").unwrap()).remove(0);
        let actions = bob.handle_frame(&again).unwrap();
        assert_eq!(delivered(&actions), vec![(0, b"lost".to_vec()), (1, b"kept".to_vec())]);
    }

    #[test]
    fn resend_rejects_different_plaintext() {
        let (mut alice, _bob) = pair();
        send(&mut alice, b"original");

        assert_eq!(
            alice.resend_chunk(0, b"imposter").unwrap_err(),
            SessionError::UnknownChunk { index: 0 }
        );
        assert_eq!(
            alice.resend_chunk(5, b"original").unwrap_err(),
            SessionError::UnknownChunk { index: 5 }
        );
    }

    #[test]
    fn send_after_finish_is_refused() {
        let (mut alice, _bob) = pair();
        alice.finish().unwrap();

        assert!(matches!(alice.send_chunk(b"late"), Err(SessionError::InvalidState { .. })));
    }

    #[test]
    fn operations_before_handshake_are_refused() {
        let mut alice =
            Session::new(Role::Initiator, SessionConfig::default(), SeededEnv::new(1)).unwrap();

        assert!(matches!(alice.send_chunk(b"x"), Err(SessionError::InvalidState { .. })));
        assert!(matches!(alice.finish(), Err(SessionError::InvalidState { .. })));
        alice.start().unwrap();
        assert!(matches!(alice.start(), Err(SessionError::InvalidState { .. })));
    }

    #[test]
    fn oversized_chunk_is_refused() {
        let config = SessionConfig { max_chunk_size: 16, ..SessionConfig::default() };
        let (mut alice, _bob) = pair_with(config);

        assert_eq!(
            alice.send_chunk(&[0u8; 17]).unwrap_err(),
            SessionError::ChunkTooLarge { size: 17, max: 16 }
        );
    }

    #[test]
    fn frame_from_another_session_is_ignored() {
        let (mut alice, mut bob) = pair();

        let mut frame = send(&mut alice, b"x");
        frame.header.set_session_id([0xEE; 16]);

        assert_eq!(bob.handle_frame(&frame).unwrap_err(), SessionError::SessionMismatch);
        assert_eq!(bob.state(), SessionState::Transferring);
    }

    #[test]
    fn abort_for_another_session_is_ignored() {
        let (mut alice, mut bob) = pair();

        let mut abort = frames(&bob.abort()).remove(0);
        abort.header.set_session_id([0xEE; 16]);

        assert_eq!(alice.handle_frame(&abort).unwrap_err(), SessionError::SessionMismatch);
        assert_eq!(alice.state(), SessionState::Transferring);
        assert_eq!(alice.failure(), None);
    }

    #[test]
    fn zeroed_hello_keyset_fails_the_responder() {
        let mut alice =
            Session::new(Role::Initiator, SessionConfig::default(), SeededEnv::new(1)).unwrap();
        let mut bob =
            Session::new(Role::Responder, SessionConfig::default(), SeededEnv::new(2)).unwrap();

        bob.start().unwrap();
        let hello = frames(&alice.start().unwrap()).remove(0);
        let Payload::Hello(mut payload) = Payload::from_frame(&hello).unwrap() else {
            panic!("expected Hello");
        };
        payload.keyset.dh_public = [0; 32];
        let forged = Payload::Hello(payload).into_frame(hello.header).unwrap();

        bob.handle_frame(&forged).unwrap();
        assert_eq!(bob.state(), SessionState::Failed);
        assert!(bob.keys.is_none());
        assert!(matches!(
            bob.failure(),
            Some(SessionError::Crypto(CryptoError::Handshake(HandshakeError::InvalidPeerKey {
                component: "ratchet keyset",
                ..
            })))
        ));
    }

    #[test]
    fn small_order_reply_keyset_fails_the_initiator() {
        let mut alice =
            Session::new(Role::Initiator, SessionConfig::default(), SeededEnv::new(1)).unwrap();
        let mut bob =
            Session::new(Role::Responder, SessionConfig::default(), SeededEnv::new(2)).unwrap();

        bob.start().unwrap();
        let hello = frames(&alice.start().unwrap());
        let reply = frames(&bob.handle_frame(&hello[0]).unwrap()).remove(0);

        let Payload::HelloReply(mut payload) = Payload::from_frame(&reply).unwrap() else {
            panic!("expected HelloReply");
        };
        let mut identity = [0u8; 32];
        identity[0] = 1;
        payload.keyset.dh_public = identity;
        let forged = Payload::HelloReply(payload).into_frame(reply.header).unwrap();

        alice.handle_frame(&forged).unwrap();
        assert_eq!(alice.state(), SessionState::Failed);
        assert_eq!(alice.verification_code(), None);
        assert!(matches!(
            alice.failure(),
            Some(SessionError::Crypto(CryptoError::Handshake(HandshakeError::InvalidPeerKey {
                component: "ratchet keyset",
                ..
            })))
        ));
    }

    #[test]
    fn send_side_crypto_error_ends_the_session() {
        let (mut alice, _bob) = pair();

        let err = SessionError::Crypto(CryptoError::Ratchet(RatchetError::KeyExpired {
            epoch: 0,
            counter: 0,
        }));
        assert!(!err.is_fatal());

        let actions = alice.settle_send(Some(3), Err(err.clone())).unwrap();
        assert_eq!(alice.state(), SessionState::Failed);
        assert_eq!(alice.failure(), Some(&err));
        assert!(alice.keys.is_none());
        assert_eq!(frames(&actions)[0].header.opcode_enum(), Some(Opcode::Abort));
    }

    #[test]
    fn send_side_misuse_is_passed_through() {
        let (mut alice, _bob) = pair();

        let err = SessionError::ChunkTooLarge { size: 2, max: 1 };
        assert_eq!(alice.settle_send(None, Err(err.clone())).unwrap_err(), err);
        assert_eq!(alice.state(), SessionState::Transferring);
        let rejected = alice.transfer.as_ref().and_then(|transfer| transfer.incoming.rejected);
        assert_eq!(rejected, None);
    }

    #[test]
    fn disjoint_cipher_suites_fail_the_handshake() {
        let mut alice = Session::new(
            Role::Initiator,
            SessionConfig {
                cipher_suites: vec![CipherSuite::Aes256Gcm],
                ..SessionConfig::default()
            },
            SeededEnv::new(1),
        )
        .unwrap();
        let mut bob = Session::new(
            Role::Responder,
            SessionConfig {
                cipher_suites: vec![CipherSuite::XChaCha20Poly1305],
                ..SessionConfig::default()
            },
            SeededEnv::new(2),
        )
        .unwrap();

        bob.start().unwrap();
        let hello = frames(&alice.start().unwrap());
        let actions = bob.handle_frame(&hello[0]).unwrap();

        assert_eq!(bob.state(), SessionState::Failed);
        assert_eq!(
            bob.failure(),
            Some(&SessionError::Crypto(CryptoError::Handshake(
                HandshakeError::NoCommonCipherSuite
            )))
        );
        alice.handle_frame(&frames(&actions)[0]).unwrap();
        assert_eq!(alice.state(), SessionState::Failed);
    }

    #[test]
    fn tampered_confirmation_fails_the_initiator() {
        let mut alice =
            Session::new(Role::Initiator, SessionConfig::default(), SeededEnv::new(1)).unwrap();
        let mut bob =
            Session::new(Role::Responder, SessionConfig::default(), SeededEnv::new(2)).unwrap();

        bob.start().unwrap();
        let hello = frames(&alice.start().unwrap());
        let reply = frames(&bob.handle_frame(&hello[0]).unwrap()).remove(0);

        let Payload::HelloReply(mut payload) = Payload::from_frame(&reply).unwrap() else {
            panic!("expected HelloReply");
        };
        payload.confirmation[0] ^= 1;
        let forged = Payload::HelloReply(payload).into_frame(reply.header).unwrap();

        alice.handle_frame(&forged).unwrap();
        assert_eq!(alice.state(), SessionState::Failed);
        assert_eq!(alice.verification_code(), None);
        assert_eq!(
            alice.failure(),
            Some(&SessionError::Crypto(CryptoError::Handshake(
                HandshakeError::KeyConfirmationFailed
            )))
        );
    }

    #[test]
    fn aes_suite_transfers() {
        let config = SessionConfig {
            cipher_suites: vec![CipherSuite::Aes256Gcm, CipherSuite::XChaCha20Poly1305],
            ..SessionConfig::default()
        };
        let (mut alice, mut bob) = pair_with(config);
        assert_eq!(bob.cipher_suite(), Some(CipherSuite::Aes256Gcm));

        let frame = send(&mut alice, b"gcm");
        assert_eq!(delivered(&bob.handle_frame(&frame).unwrap()), vec![(0, b"gcm".to_vec())]);
    }

    #[test]
    fn nonce_exhaustion_is_fatal() {
        let config = SessionConfig { nonce_limit: 2, ..SessionConfig::default() };
        let (mut alice, _bob) = pair_with(config);

        send(&mut alice, b"0");
        send(&mut alice, b"1");
        let actions = alice.send_chunk(b"2").unwrap();

        assert_eq!(alice.state(), SessionState::Failed);
        assert_eq!(
            alice.failure(),
            Some(&SessionError::Crypto(CryptoError::Resource(ResourceError::NonceExhausted {
                direction: Direction::InitiatorToResponder
            })))
        );
        let abort = frames(&actions);
        let Payload::Abort(Abort { code }) = Payload::from_frame(&abort[0]).unwrap() else {
            panic!("expected Abort");
        };
        assert_eq!(code, Abort::RESOURCE_EXHAUSTED);
    }

    #[test]
    fn abort_wipes_and_is_terminal() {
        let (mut alice, mut bob) = pair();

        let actions = alice.abort();
        assert_eq!(alice.state(), SessionState::Failed);
        assert!(alice.ratchet_snapshot(Direction::InitiatorToResponder).is_none());
        assert!(alice.abort().is_empty());
        assert!(matches!(alice.send_chunk(b"x"), Err(SessionError::InvalidState { .. })));

        bob.handle_frame(&frames(&actions)[0]).unwrap();
        assert_eq!(bob.status(), ManifestStatus::Failed(ChunkFault {
            index: None,
            layer: FailureLayer::Peer
        }));
        assert!(matches!(
            bob.handle_frame(&frames(&actions)[0]),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn second_receipt_is_unexpected() {
        let (mut alice, mut bob) = pair();

        // Both directions carry data, so neither side completes on one receipt
        let to_alice = send(&mut bob, b"reply");
        alice.handle_frame(&to_alice).unwrap();
        let to_bob = send(&mut alice, b"file");
        bob.handle_frame(&to_bob).unwrap();

        let finish = frames(&alice.finish().unwrap());
        let receipt = frames(&bob.handle_frame(&finish[0]).unwrap()).remove(0);
        assert_eq!(bob.state(), SessionState::Transferring);

        alice.handle_frame(&receipt).unwrap();
        assert_eq!(alice.state(), SessionState::Transferring);
        assert!(matches!(
            alice.handle_frame(&receipt),
            Err(SessionError::UnexpectedFrame { .. })
        ));
    }

    #[test]
    fn bidirectional_transfer_completes_both_sides() {
        let (mut alice, mut bob) = pair();

        let to_bob = send(&mut alice, b"ping");
        let to_alice = send(&mut bob, b"pong");
        bob.handle_frame(&to_bob).unwrap();
        alice.handle_frame(&to_alice).unwrap();

        let alice_finish = frames(&alice.finish().unwrap());
        let bob_finish = frames(&bob.finish().unwrap());
        let bob_receipt = frames(&bob.handle_frame(&alice_finish[0]).unwrap());
        let alice_receipt = frames(&alice.handle_frame(&bob_finish[0]).unwrap());

        alice.handle_frame(&bob_receipt[0]).unwrap();
        bob.handle_frame(&alice_receipt[0]).unwrap();
        assert_eq!(alice.state(), SessionState::Completed);
        assert_eq!(bob.state(), SessionState::Completed);
    }

    #[test]
    fn pq_step_after_interval() {
        let config =
            SessionConfig { pq_interval: 4, dh_interval: 1000, ..SessionConfig::default() };
        let (mut alice, mut bob) = pair_with(config);

        for i in 0..4u8 {
            let frame = send(&mut alice, &[i]);
            assert!(!frame.header.flags().contains(FrameFlags::RATCHET_STEP));
            bob.handle_frame(&frame).unwrap();
        }
        let before = bob.ratchet_snapshot(Direction::InitiatorToResponder).unwrap();

        let frame = send(&mut alice, &[4]);
        assert!(frame.header.flags().contains(FrameFlags::PQ_STEP));
        bob.handle_frame(&frame).unwrap();

        let after = bob.ratchet_snapshot(Direction::InitiatorToResponder).unwrap();
        assert_eq!(after.last_step, Some(StepKind::PostQuantum));
        assert_eq!(after.pq_steps, before.pq_steps + 1);
        assert_ne!(after.root_fingerprint, before.root_fingerprint);
        assert_eq!(
            alice.ratchet_snapshot(Direction::InitiatorToResponder).unwrap().root_fingerprint,
            after.root_fingerprint
        );
    }

    #[test]
    fn batch_seal_matches_sequential_order() {
        let (mut alice, mut bob) = pair();

        let chunks: Vec<Vec<u8>> = (0..16u8).map(|i| vec![i; 100]).collect();
        let sent = frames(&alice.send_chunks(&chunks).unwrap());
        assert_eq!(sent.len(), 16);

        let mut received = Vec::new();
        for frame in &sent {
            received.extend(delivered(&bob.handle_frame(frame).unwrap()));
        }
        let expected: Vec<_> =
            chunks.iter().cloned().enumerate().map(|(i, chunk)| (i as u64, chunk)).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn expired_key_is_reported_as_ratchet_rejection() {
        let config = SessionConfig { max_skip: 4, ..SessionConfig::default() };
        let (mut alice, mut bob) = pair_with(config);

        let late = send(&mut alice, b"late");
        for i in 0..8u8 {
            let frame = send(&mut alice, &[i]);
            bob.handle_frame(&frame).unwrap();
        }

        let err = bob.handle_frame(&late).unwrap_err();
        assert_eq!(
            err,
            SessionError::Crypto(CryptoError::Ratchet(RatchetError::KeyExpired {
                epoch: 0,
                counter: 0
            }))
        );
        assert!(err.is_transient());
    }
}
