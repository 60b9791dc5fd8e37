//! Skiff session controller
//!
//! Drives one end of an encrypted peer-to-peer file transfer: hybrid
//! handshake, ratchet seeding, chunk sealing and opening, manifest
//! verification and the final receipt.
//!
//! # Architecture
//!
//! Sans-IO and action based, like the rest of the workspace. A [`Session`]
//! consumes frames and local requests and returns [`SessionAction`]s; the
//! caller owns the transport and executes them. Randomness comes from an
//! [`Environment`], so a seeded environment replays a session bit for bit.
//!
//! # Components
//!
//! - [`Session`]: the state machine
//! - [`SharedSession`]: one session behind one mutex, for multi-task drivers
//! - [`SessionConfig`]: ratchet intervals, windows and limits
//! - [`ManifestStatus`]: what the application shows the user
//! - [`SessionError`]: every way an operation can be refused

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod config;
pub mod env;
mod envelope;
pub mod error;
mod handle;
mod pipeline;
pub mod session;
pub mod status;
mod system_env;

pub use config::{ConfigError, SessionConfig};
pub use env::{EnvRng, Environment};
pub use error::SessionError;
pub use handle::SharedSession;
pub use session::{Session, SessionAction, SessionState};
pub use skiff_crypto::{CipherSuite, Direction, Role};
pub use status::{ChunkFault, FailureLayer, ManifestStatus};
pub use system_env::SystemEnv;
