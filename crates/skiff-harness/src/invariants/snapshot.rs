//! Observations recorded while driving a transfer.
//!
//! Invariants operate on this trace rather than on live sessions, so a check
//! sees the whole history: every frame either side put on the wire, every
//! ratchet position, every chunk handed to the application and every state.

use skiff_core::SessionState;
use skiff_crypto::{Direction, RatchetSnapshot, Role};
use skiff_proto::{Frame, FrameFlags, Opcode};

/// A frame as it left its sender, before the link touched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireRecord {
    /// Direction of travel
    pub direction: Direction,
    /// Frame type
    pub opcode: Opcode,
    /// Header sequence (the nonce counter for sealed frames)
    pub sequence: u64,
    /// Whether the frame re-sends an earlier chunk
    pub retransmit: bool,
    /// Whether the frame opens an epoch with a post-quantum step
    pub pq_step: bool,
}

impl WireRecord {
    /// Record `frame` sent in `direction`. `None` for an unknown opcode.
    pub fn of(direction: Direction, frame: &Frame) -> Option<Self> {
        Some(Self {
            direction,
            opcode: frame.header.opcode_enum()?,
            sequence: frame.header.sequence(),
            retransmit: frame.header.flags().contains(FrameFlags::RETRANSMIT),
            pq_step: frame.header.flags().contains(FrameFlags::PQ_STEP),
        })
    }
}

/// One ratchet position as seen by one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetObservation {
    /// Peer that reported it
    pub observer: Role,
    /// Reported state
    pub snapshot: RatchetSnapshot,
}

/// Everything observed during one transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferTrace {
    /// Chunks the sender was asked to send, by index
    pub source: Vec<Vec<u8>>,
    /// Frames emitted by either session
    pub wire: Vec<WireRecord>,
    /// Ratchet positions after every operation
    pub ratchets: Vec<RatchetObservation>,
    /// Chunks delivered to the receiving application, in delivery order
    pub delivered: Vec<(u64, Vec<u8>)>,
    /// Every state the sending session was seen in
    pub sender_states: Vec<SessionState>,
    /// Every state the receiving session was seen in
    pub receiver_states: Vec<SessionState>,
}

impl TransferTrace {
    /// Empty trace for a file of `source` chunks.
    pub fn new(source: Vec<Vec<u8>>) -> Self {
        Self { source, ..Self::default() }
    }

    /// Delivered plaintext joined in delivery order.
    pub fn delivered_bytes(&self) -> Vec<u8> {
        self.delivered.iter().flat_map(|(_, chunk)| chunk.iter().copied()).collect()
    }

    /// Record a state unless it repeats the last one seen.
    pub fn record_state(&mut self, role: Role, state: SessionState, sender: Role) {
        let history =
            if role == sender { &mut self.sender_states } else { &mut self.receiver_states };
        if history.last() != Some(&state) {
            history.push(state);
        }
    }
}
