//! `mps`: a transport-agnostic Message Processing Stack for TLS/DTLS-style
//! protocols — record sequencing, epoch-keyed encryption, handshake
//! fragmentation/reassembly, and flight-level retransmission, with no
//! knowledge of any particular handshake's message contents.
//!
//! The crate never performs I/O itself; callers supply a [`transport::Transport`]
//! and [`transport::Timer`] and drive everything through [`context::Context`].

pub mod aead;
pub mod alert;
pub mod change_cipher_spec;
pub mod config;
pub mod content;
pub mod context;
pub mod epoch;
pub mod error;
pub mod flight;
pub mod handshake;
pub mod message;
pub mod reader;
pub mod reassembly;
pub mod record_layer;
pub mod retransmit;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod scenarios;

pub use config::{Config, Mode};
pub use context::{ConnectionState, Context, MessageFlags, ReadOutcome};
pub use error::{Error, Result};
