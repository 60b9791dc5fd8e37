//! Thread-safe session handle.
//!
//! A [`Session`] is mutated through `&mut self`, so ratchet advancement is
//! serialized by the borrow checker. When several tasks need the same session
//! (a reader pumping frames in, a writer feeding chunks), they share one
//! [`SharedSession`] and every operation takes the session's single lock.
//! Independent sessions never share a lock.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use skiff_proto::Frame;

use crate::{
    env::Environment,
    error::SessionError,
    session::{Session, SessionAction, SessionState},
    status::ManifestStatus,
};

/// One session behind one mutex.
pub struct SharedSession<E: Environment> {
    inner: Arc<Mutex<Session<E>>>,
}

impl<E: Environment> Clone for SharedSession<E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<E: Environment> std::fmt::Debug for SharedSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedSession").field(&*self.lock()).finish()
    }
}

impl<E: Environment> SharedSession<E> {
    /// Wrap a session.
    pub fn new(session: Session<E>) -> Self {
        Self { inner: Arc::new(Mutex::new(session)) }
    }

    /// Run `f` with exclusive access to the session.
    ///
    /// Use this to group several operations under one lock, for example
    /// sealing a batch and reading the resulting status.
    pub fn with<R>(&self, f: impl FnOnce(&mut Session<E>) -> R) -> R {
        f(&mut self.lock())
    }

    /// See [`Session::start`].
    pub fn start(&self) -> Result<Vec<SessionAction>, SessionError> {
        self.lock().start()
    }

    /// See [`Session::handle_frame`].
    pub fn handle_frame(&self, frame: &Frame) -> Result<Vec<SessionAction>, SessionError> {
        self.lock().handle_frame(frame)
    }

    /// See [`Session::send_chunks`].
    pub fn send_chunks<P>(&self, chunks: &[P]) -> Result<Vec<SessionAction>, SessionError>
    where
        P: AsRef<[u8]> + Sync,
    {
        self.lock().send_chunks(chunks)
    }

    /// See [`Session::finish`].
    pub fn finish(&self) -> Result<Vec<SessionAction>, SessionError> {
        self.lock().finish()
    }

    /// See [`Session::abort`].
    pub fn abort(&self) -> Vec<SessionAction> {
        self.lock().abort()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.lock().state()
    }

    /// Current manifest status.
    pub fn status(&self) -> ManifestStatus {
        self.lock().status()
    }

    // Session methods never panic with the lock held; a poisoned lock means a
    // closure passed to `with` did, after which the session is still consistent
    // up to its last completed operation.
    fn lock(&self) -> MutexGuard<'_, Session<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use skiff_crypto::Role;

    use super::*;
    use crate::{SessionConfig, SystemEnv};

    fn sent(actions: &[SessionAction]) -> Vec<Frame> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::SendFrame(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    fn shared(role: Role) -> SharedSession<SystemEnv> {
        SharedSession::new(Session::new(role, SessionConfig::default(), SystemEnv).unwrap())
    }

    #[test]
    fn threads_share_one_session() {
        let alice = shared(Role::Initiator);
        let bob = shared(Role::Responder);

        bob.start().unwrap();
        let hello = sent(&alice.start().unwrap());
        let reply = sent(&bob.handle_frame(&hello[0]).unwrap());
        alice.handle_frame(&reply[0]).unwrap();

        let writers: Vec<_> = (0..4u8)
            .map(|i| {
                let alice = alice.clone();
                thread::spawn(move || sent(&alice.send_chunks(&[vec![i; 32]]).unwrap()))
            })
            .collect();

        let mut frames: Vec<Frame> =
            writers.into_iter().flat_map(|writer| writer.join().unwrap()).collect();
        frames.sort_by_key(|frame| frame.header.sequence());

        // Every frame got its own nonce even though the writers raced
        let sequences: Vec<u64> = frames.iter().map(|frame| frame.header.sequence()).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);

        let delivered: usize = frames
            .iter()
            .map(|frame| {
                bob.handle_frame(frame)
                    .unwrap()
                    .iter()
                    .filter(|action| matches!(action, SessionAction::DeliverChunk { .. }))
                    .count()
            })
            .sum();
        assert_eq!(delivered, 4);
    }

    #[test]
    fn abort_through_any_clone_is_seen_by_all() {
        let session = shared(Role::Responder);
        let other = session.clone();

        session.start().unwrap();
        other.abort();
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.status().is_terminal());
    }
}
