//! Companion-device pairing module for Sable Wallet
//!
//! Maintains a bidirectional channel to a paired mobile client, either
//! directly over the local network or through an internet relay that
//! forwards session-tagged envelopes without interpreting them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   pairing module                         │
//! ├─────────────────────────────────────────────────────────┤
//! │  session.rs    - Tokens, descriptors, session state      │
//! │  transport.rs  - Envelope codec, direct/relay dialing    │
//! │  client.rs     - Session loop, heartbeats, ordering      │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod session;
pub mod transport;

pub use client::{PairingClient, PairingConfig};
pub use session::{PairingDescriptor, PairingSession, PairingState, PairingTransport, SessionToken};

/// Pairing channel failures
///
/// Session loss is not fatal to the rest of the client; it only forces a
/// fresh pairing.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invalid pairing descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("companion device never completed the handshake")]
    HandshakeTimeout,
    #[error("no envelope from the companion within the liveness window")]
    PeerLost,
    #[error("pairing channel is closed")]
    ChannelClosed,
}
