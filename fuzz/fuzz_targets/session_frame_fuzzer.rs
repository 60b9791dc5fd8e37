//! Fuzz target for a live session receiving hostile frames
//!
//! A real transfer is set up and interleaved with frames an on-path attacker
//! could produce: raw bytes, bit flips, replays, rewritten opcodes and
//! sequences, truncations.
//!
//! # Invariants
//!
//! - handle_frame NEVER panics
//! - Delivered chunks are exactly the sent chunks, in index order, once each
//! - Only an Abort can end the session; no forged chunk can
//! - After the attack, the genuine frames still complete delivery

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use skiff_core::{Role, Session, SessionAction, SessionConfig, SessionError, SessionState};
use skiff_harness::SimEnv;
use skiff_proto::Frame;

const MAX_CHUNKS: usize = 16;
const MAX_CHUNK_LEN: usize = 1024;

#[derive(Debug, Clone, Arbitrary)]
struct Input {
    seed: u64,
    chunks: Vec<Vec<u8>>,
    attacks: Vec<Attack>,
}

#[derive(Debug, Clone, Arbitrary)]
enum Attack {
    Raw(Vec<u8>),
    FlipBit { frame: u8, bit: u16 },
    Replay { frame: u8 },
    Opcode { frame: u8, opcode: u16 },
    Sequence { frame: u8, sequence: u64 },
    Truncate { frame: u8, len: u16 },
}

struct Receiver {
    session: Session<SimEnv>,
    chunks: Vec<Vec<u8>>,
    delivered: usize,
}

impl Receiver {
    fn feed(&mut self, bytes: &[u8]) {
        let Ok(frame) = Frame::decode(bytes) else {
            return;
        };
        let Ok(actions) = self.session.handle_frame(&frame) else {
            return;
        };
        for action in actions {
            if let SessionAction::DeliverChunk { index, plaintext } = action {
                assert_eq!(index, self.delivered as u64, "delivery out of order");
                assert_eq!(plaintext, self.chunks[index as usize], "corrupt plaintext delivered");
                self.delivered += 1;
            }
        }
    }
}

fn frames(actions: Vec<SessionAction>) -> Vec<Frame> {
    actions
        .into_iter()
        .filter_map(|action| match action {
            SessionAction::SendFrame(frame) => Some(frame),
            _ => None,
        })
        .collect()
}

fuzz_target!(|input: Input| {
    let chunks: Vec<Vec<u8>> = input
        .chunks
        .into_iter()
        .take(MAX_CHUNKS)
        .map(|mut chunk| {
            chunk.truncate(MAX_CHUNK_LEN);
            chunk
        })
        .collect();
    if chunks.is_empty() {
        return;
    }

    let config = SessionConfig { dh_interval: 3, pq_interval: 5, ..SessionConfig::default() };
    let env = SimEnv::with_seed(input.seed);
    let mut sender = Session::new(Role::Initiator, config.clone(), env.fork(1)).unwrap();
    let mut session = Session::new(Role::Responder, config, env.fork(2)).unwrap();

    session.start().unwrap();
    let hello = frames(sender.start().unwrap());
    let reply = frames(session.handle_frame(&hello[0]).unwrap());
    sender.handle_frame(&reply[0]).unwrap();

    let sealed: Vec<Vec<u8>> = frames(sender.send_chunks(&chunks).unwrap())
        .iter()
        .map(|frame| frame.to_vec().unwrap())
        .collect();

    let mut receiver = Receiver { session, chunks, delivered: 0 };
    let pick = |frame: u8| sealed[frame as usize % sealed.len()].clone();

    for attack in input.attacks.into_iter().take(64) {
        let bytes = match attack {
            Attack::Raw(bytes) => bytes,
            Attack::FlipBit { frame, bit } => {
                let mut bytes = pick(frame);
                let at = bit as usize / 8 % bytes.len();
                bytes[at] ^= 1 << (bit % 8);
                bytes
            },
            Attack::Replay { frame } => pick(frame),
            Attack::Opcode { frame, opcode } => {
                let mut bytes = pick(frame);
                bytes[6..8].copy_from_slice(&opcode.to_be_bytes());
                bytes
            },
            Attack::Sequence { frame, sequence } => {
                let mut bytes = pick(frame);
                bytes[28..36].copy_from_slice(&sequence.to_be_bytes());
                bytes
            },
            Attack::Truncate { frame, len } => {
                let mut bytes = pick(frame);
                bytes.truncate(len as usize);
                bytes
            },
        };
        receiver.feed(&bytes);
    }

    if receiver.session.state() == SessionState::Failed {
        assert!(
            matches!(receiver.session.failure(), Some(SessionError::PeerAborted { .. })),
            "session failed without an abort: {:?}",
            receiver.session.failure()
        );
        return;
    }

    for bytes in &sealed {
        receiver.feed(bytes);
    }
    assert_eq!(receiver.delivered, receiver.chunks.len(), "genuine frames did not complete delivery");
});
