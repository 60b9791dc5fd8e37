//! Transfer driver.
//!
//! Owns both ends of a session and the two links between them, and executes
//! the actions each session returns: frames go onto the link towards the
//! peer, delivered chunks and state changes go into the [`TransferTrace`].
//! Everything is single-threaded and seeded, so a run replays exactly.

use skiff_core::{
    ManifestStatus, Role, Session, SessionAction, SessionConfig, SessionError, SessionState,
};
use skiff_crypto::Direction;
use skiff_proto::Frame;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    invariants::{InvariantRegistry, RatchetObservation, TransferTrace, Violation, WireRecord},
    link::{ChaoticLink, LinkError, LinkStats},
    sim_env::SimEnv,
};

/// Delivery rounds without the links going idle before a run is abandoned.
const MAX_PUMP_ROUNDS: usize = 100_000;

/// How the driver feeds the file to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// Chunks handed to `send_chunks` at once
    pub batch_size: usize,
    /// Retransmission rounds after Finish; 0 disables retransmission
    pub max_resend_rounds: u32,
    /// Which side of the handshake sends the file
    pub sender_role: Role,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { batch_size: 64, max_resend_rounds: 8, sender_role: Role::Initiator }
    }
}

/// Errors that stop a run.
///
/// A chunk the receiver rejects is not an error here; it is counted in the
/// report and left to retransmission.
#[derive(Debug, Error)]
pub enum DriverError {
    /// A session refused an operation the driver issued
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// A link could not carry a frame
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Frames kept flowing without the transfer settling
    #[error("transfer did not settle after {rounds} rounds")]
    Stalled {
        /// Rounds attempted
        rounds: usize,
    },

    /// A registered invariant failed
    #[error("{} invariant violation(s), first: {}", .0.len(), .0[0])]
    Invariant(Vec<Violation>),
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct TransferReport {
    /// Chunks delivered to the receiving application
    pub delivered_chunks: usize,
    /// Final sender state
    pub sender_state: SessionState,
    /// Final receiver state
    pub receiver_state: SessionState,
    /// Receiver's manifest status
    pub status: ManifestStatus,
    /// Frames the receiver refused without failing
    pub rejections: Vec<SessionError>,
    /// Frames that no longer decoded after the link altered them
    pub undecodable: u64,
    /// Retransmission rounds used
    pub resend_rounds: u32,
    /// Sender to receiver link
    pub forward: LinkStats,
    /// Receiver to sender link
    pub backward: LinkStats,
}

impl TransferReport {
    /// Whether both ends completed.
    pub fn completed(&self) -> bool {
        self.sender_state == SessionState::Completed
            && self.receiver_state == SessionState::Completed
    }
}

/// Drives one sender and one receiver over a pair of links.
pub struct TransferDriver {
    config: DriverConfig,
    sender: Session<SimEnv>,
    receiver: Session<SimEnv>,
    forward: ChaoticLink,
    backward: ChaoticLink,
    trace: TransferTrace,
    invariants: Option<InvariantRegistry>,
    rejections: Vec<SessionError>,
    undecodable: u64,
    resend_rounds: u32,
}

impl std::fmt::Debug for TransferDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferDriver")
            .field("config", &self.config)
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("forward", &self.forward)
            .finish_non_exhaustive()
    }
}

impl TransferDriver {
    /// Two fresh sessions with independent streams of `env`.
    ///
    /// `forward` carries sender to receiver traffic and is where faults are
    /// normally injected; the return path is reliable.
    pub fn new(
        session: &SessionConfig,
        config: DriverConfig,
        env: &SimEnv,
        forward: ChaoticLink,
    ) -> Result<Self, DriverError> {
        let receiver_role = match config.sender_role {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        };
        let sender = Session::new(config.sender_role, session.clone(), env.fork(1))?;
        let receiver = Session::new(receiver_role, session.clone(), env.fork(2))?;

        Ok(Self {
            config,
            sender,
            receiver,
            forward,
            backward: ChaoticLink::reliable(),
            trace: TransferTrace::default(),
            invariants: None,
            rejections: Vec::new(),
            undecodable: 0,
            resend_rounds: 0,
        })
    }

    /// Check `registry` after every step of the run.
    #[must_use]
    pub fn with_invariants(mut self, registry: InvariantRegistry) -> Self {
        self.invariants = Some(registry);
        self
    }

    /// Everything observed so far.
    pub fn trace(&self) -> &TransferTrace {
        &self.trace
    }

    /// Sending session.
    pub fn sender(&self) -> &Session<SimEnv> {
        &self.sender
    }

    /// Receiving session.
    pub fn receiver(&self) -> &Session<SimEnv> {
        &self.receiver
    }

    /// Run the handshake to completion.
    pub fn handshake(&mut self) -> Result<(), DriverError> {
        for role in [Role::Responder, Role::Initiator] {
            let actions = self.session_mut(role).start()?;
            self.dispatch(role, actions)?;
        }
        self.pump()?;

        if self.sender.state() != SessionState::Transferring {
            warn!(state = ?self.sender.state(), "handshake did not complete");
        }
        self.check("after handshake")
    }

    /// Send `file` chunk by chunk, finish, and retransmit what the receiver
    /// is missing.
    pub fn run(&mut self, file: &[Vec<u8>]) -> Result<TransferReport, DriverError> {
        if self.sender.state() == SessionState::Uninitialized {
            self.handshake()?;
        }

        for batch in file.chunks(self.config.batch_size.max(1)) {
            if self.sender.state() != SessionState::Transferring {
                break;
            }
            self.send(batch)?;
        }
        self.finish()
    }

    /// Send one batch of chunks and deliver everything in flight.
    pub fn send(&mut self, batch: &[Vec<u8>]) -> Result<(), DriverError> {
        let actions = self.sender.send_chunks(batch)?;
        self.trace.source.extend(batch.iter().cloned());
        self.dispatch(self.sender.role(), actions)?;
        self.pump()?;
        self.check("after batch")
    }

    /// Close the file, then retransmit until the receiver has every chunk or
    /// the rounds run out.
    pub fn finish(&mut self) -> Result<TransferReport, DriverError> {
        if self.sender.state() == SessionState::Transferring {
            let actions = self.sender.finish()?;
            self.dispatch(self.sender.role(), actions)?;
            self.pump()?;
            self.check("after finish")?;
        }

        while self.resend_rounds < self.config.max_resend_rounds && self.needs_resend() {
            self.resend_rounds += 1;
            self.resend()?;
            self.check("after resend")?;
        }

        Ok(self.report())
    }

    /// Snapshot of the outcome so far.
    pub fn report(&self) -> TransferReport {
        TransferReport {
            delivered_chunks: self.trace.delivered.len(),
            sender_state: self.sender.state(),
            receiver_state: self.receiver.state(),
            status: self.receiver.status(),
            rejections: self.rejections.clone(),
            undecodable: self.undecodable,
            resend_rounds: self.resend_rounds,
            forward: self.forward.stats(),
            backward: self.backward.stats(),
        }
    }

    fn needs_resend(&self) -> bool {
        self.sender.state() == SessionState::Transferring
            && self.receiver.state() == SessionState::Transferring
    }

    fn resend(&mut self) -> Result<(), DriverError> {
        let first = self.receiver.next_missing_chunk().unwrap_or(0);
        debug!(round = self.resend_rounds, from = first, "retransmitting");

        for index in first..self.trace.source.len() as u64 {
            if self.sender.state() != SessionState::Transferring {
                break;
            }
            let actions = self.sender.resend_chunk(index, &self.trace.source[index as usize])?;
            self.dispatch(self.sender.role(), actions)?;
        }
        self.pump()
    }

    /// Deliver frames both ways until both links are idle.
    fn pump(&mut self) -> Result<(), DriverError> {
        for _ in 0..MAX_PUMP_ROUNDS {
            let towards_receiver = self.forward.drain();
            let towards_sender = self.backward.drain();
            if towards_receiver.is_empty() && towards_sender.is_empty() {
                return Ok(());
            }

            for bytes in towards_receiver {
                self.deliver(self.receiver.role(), &bytes)?;
            }
            for bytes in towards_sender {
                self.deliver(self.sender.role(), &bytes)?;
            }
        }
        Err(DriverError::Stalled { rounds: MAX_PUMP_ROUNDS })
    }

    fn deliver(&mut self, to: Role, bytes: &[u8]) -> Result<(), DriverError> {
        let frame = match Frame::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(error = %err, "dropping undecodable frame");
                self.undecodable += 1;
                return Ok(());
            },
        };

        match self.session_mut(to).handle_frame(&frame) {
            Ok(actions) => self.dispatch(to, actions),
            Err(err) => {
                debug!(role = ?to, error = %err, "frame rejected");
                self.rejections.push(err);
                Ok(())
            },
        }
    }

    fn dispatch(&mut self, from: Role, actions: Vec<SessionAction>) -> Result<(), DriverError> {
        let sender_role = self.sender.role();
        let direction = from.send_direction();

        for action in actions {
            match action {
                SessionAction::SendFrame(frame) => {
                    self.trace.wire.extend(WireRecord::of(direction, &frame));
                    if from == sender_role {
                        self.forward.push(&frame)?;
                    } else {
                        self.backward.push(&frame)?;
                    }
                },
                SessionAction::DeliverChunk { index, plaintext } => {
                    self.trace.delivered.push((index, plaintext));
                },
                SessionAction::StateChanged { from: old, to } => {
                    self.trace.record_state(from, old, sender_role);
                    self.trace.record_state(from, to, sender_role);
                    info!(role = ?from, ?old, new = ?to, "state changed");
                },
                SessionAction::Status(status) => {
                    debug!(role = ?from, ?status, "status");
                },
            }
        }

        self.observe_ratchets();
        Ok(())
    }

    fn session_mut(&mut self, role: Role) -> &mut Session<SimEnv> {
        if role == self.sender.role() { &mut self.sender } else { &mut self.receiver }
    }

    fn observe_ratchets(&mut self) {
        for session in [&self.sender, &self.receiver] {
            for direction in [Direction::InitiatorToResponder, Direction::ResponderToInitiator] {
                if let Some(snapshot) = session.ratchet_snapshot(direction) {
                    self.trace
                        .ratchets
                        .push(RatchetObservation { observer: session.role(), snapshot });
                }
            }
        }
    }

    fn check(&self, context: &str) -> Result<(), DriverError> {
        let Some(registry) = &self.invariants else {
            return Ok(());
        };
        registry.check_all(&self.trace).map_err(|violations| {
            warn!(context, count = violations.len(), "invariant violated");
            DriverError::Invariant(violations)
        })
    }
}
