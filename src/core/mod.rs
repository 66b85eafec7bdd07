//! Engine core: signal codec, rendezvous client, peer session, and the
//! file-transfer state machines.

pub mod cancel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod rendezvous;
pub mod session;
pub mod settings;
pub mod signal;
pub mod transfer;

#[cfg(test)]
pub mod testing;
