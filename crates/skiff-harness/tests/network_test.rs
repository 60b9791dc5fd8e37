//! Transfers over turmoil's simulated TCP.
//!
//! The sessions are the same sans-IO state machines the in-memory driver
//! uses; here frames travel as bytes through a simulated network.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use skiff_core::{Role, Session, SessionConfig, SessionState};
use skiff_harness::{SimEnv, net};
use turmoil::net::{TcpListener, TcpStream};

fn file(seed: u64, chunks: usize) -> Vec<Vec<u8>> {
    (0..chunks).map(|i| vec![(seed as usize + i) as u8; 4096 + i]).collect()
}

#[test]
fn file_transfer_over_tcp() {
    let mut sim = turmoil::Builder::new().build();
    let env = SimEnv::with_seed(31);
    let sent = file(31, 48);
    let received = Arc::new(Mutex::new(Vec::new()));

    let receiver_env = env.fork(2);
    let sink = Arc::clone(&received);
    sim.host("receiver", move || {
        let env = receiver_env.clone();
        let sink = Arc::clone(&sink);
        async move {
            let listener = TcpListener::bind("0.0.0.0:7000").await?;
            let (mut stream, _) = listener.accept().await?;

            let mut session = Session::new(Role::Responder, SessionConfig::default(), env)?;
            let chunks = net::receive_file(&mut stream, &mut session).await?;
            assert_eq!(session.state(), SessionState::Completed);

            *sink.lock().unwrap() = chunks;
            Ok(())
        }
    });

    let file = sent.clone();
    sim.client("sender", async move {
        let mut stream = TcpStream::connect("receiver:7000").await?;
        let mut session = Session::new(Role::Initiator, SessionConfig::default(), env.fork(1))?;

        net::send_file(&mut stream, &mut session, &file, 8).await?;
        assert_eq!(session.state(), SessionState::Completed);
        assert!(session.verification_code().is_some());
        Ok(())
    });

    sim.run().expect("simulation failed");
    assert_eq!(*received.lock().unwrap(), sent);
}

#[test]
fn transfer_survives_network_latency() {
    let mut sim = turmoil::Builder::new()
        .min_message_latency(Duration::from_millis(5))
        .max_message_latency(Duration::from_millis(50))
        .build();
    let env = SimEnv::with_seed(32);
    let sent = file(32, 16);
    let received = Arc::new(Mutex::new(Vec::new()));

    let receiver_env = env.fork(2);
    let sink = Arc::clone(&received);
    sim.host("receiver", move || {
        let env = receiver_env.clone();
        let sink = Arc::clone(&sink);
        async move {
            let listener = TcpListener::bind("0.0.0.0:7000").await?;
            let (mut stream, _) = listener.accept().await?;

            let config = SessionConfig { dh_interval: 4, pq_interval: 6, ..SessionConfig::default() };
            let mut session = Session::new(Role::Responder, config, env)?;
            *sink.lock().unwrap() = net::receive_file(&mut stream, &mut session).await?;
            Ok(())
        }
    });

    let file = sent.clone();
    sim.client("sender", async move {
        let mut stream = TcpStream::connect("receiver:7000").await?;
        let config = SessionConfig { dh_interval: 4, pq_interval: 6, ..SessionConfig::default() };
        let mut session = Session::new(Role::Initiator, config, env.fork(1))?;
        net::send_file(&mut stream, &mut session, &file, 3).await?;
        Ok(())
    });

    sim.run().expect("simulation failed");
    assert_eq!(*received.lock().unwrap(), sent);
}
