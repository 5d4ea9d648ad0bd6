//! # Shroud
//!
//! Core of a crypto-obscured tunnel endpoint: one encrypted physical
//! connection carries many independently addressed virtual channels, each
//! driving its own request state machine, while an elastic worker pool
//! bounds how much work a peer can make the process do.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    FSM Dispatch                      │
//! │      (request registry, per-channel machines)        │
//! ├─────────────────────────────────────────────────────┤
//! │                Connection Multiplexer                │
//! │   (frame routing, dispatch gate, virtual channels)   │
//! ├──────────────────────────┬──────────────────────────┤
//! │   Elastic Worker Pool    │     Deadline Scheduler    │
//! │ (bounded job execution)  │  (one scan, many waiters) │
//! ├──────────────────────────┴──────────────────────────┤
//! │                       Codec                          │
//! │        (ChaCha20-Poly1305 sealed records)            │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport (TCP)                     │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod crypto;
pub mod deadline;
pub mod fsm;
pub mod pool;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Deadline error: {0}")]
    Deadline(#[from] deadline::DeadlineError),

    #[error("Pool error: {0}")]
    Pool(#[from] pool::PoolError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::MuxError),

    #[error("Request error: {0}")]
    Fsm(#[from] fsm::FsmError),

    #[error("Configuration error: {0}")]
    Config(String),
}
