//! Request state machines
//!
//! Every virtual channel is driven by a [`ChannelMachine`]. The first byte a
//! peer sends on an idle channel names the request type; the matching
//! [`Request`] variant from the [`Requests`] registry builds the machine that
//! handles the rest of the exchange, one tick per dispatched frame.

mod connect;
mod machine;
mod relay;

pub use connect::{Connect, CONNECT_REQUEST, CONNECT_REQUEST_LEN};
pub use machine::{ChannelMachine, MachineTable, SharedMachine};

use crate::pool::PoolError;
use crate::tunnel::{Channel, MuxError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use thiserror::Error;
use tracing::{warn, Span};

/// State machine errors
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("Tunnel error: {0}")]
    Mux(#[from] MuxError),

    #[error("Unknown request type: {0:#04x}")]
    UnknownRequest(u8),

    #[error("Connect request with zero timeout")]
    InvalidTimeout,

    #[error("Access to {0} denied")]
    AccessDenied(Ipv4Addr),

    #[error("Failed to dial {addr}: {source}")]
    Dial {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    #[error("Upstream error: {0}")]
    Upstream(#[source] io::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

impl FsmError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FsmError::Mux(e) if e.is_timeout())
    }
}

/// Single-byte replies to a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Response {
    Ok = 0x00,
    BadRequest = 0x01,
    DialFailed = 0x02,
    AccessDenied = 0x03,
}

impl Response {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Response::Ok),
            0x01 => Some(Response::BadRequest),
            0x02 => Some(Response::DialFailed),
            0x03 => Some(Response::AccessDenied),
            _ => None,
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Finished,
}

/// What a state hands back: the state to continue in, or the end
pub enum Transition<S> {
    Next(S),
    Terminal,
}

/// A request handler advanced one frame at a time
#[async_trait]
pub trait Machine: Send {
    async fn tick(&mut self) -> Result<Status, FsmError>;
}

/// A request type a peer may open on a channel
pub trait Request: Send + Sync {
    /// Request-type byte
    fn id(&self) -> u8;

    /// Build the machine handling one request on `channel`
    fn new_machine(&self, channel: Arc<Channel>, span: Span) -> Box<dyn Machine>;
}

/// Request variants by type byte
#[derive(Clone, Default)]
pub struct Requests {
    variants: HashMap<u8, Arc<dyn Request>>,
}

impl Requests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a variant under its type byte, replacing any previous one
    pub fn register<R: Request + 'static>(&mut self, request: R) -> &mut Self {
        let id = request.id();
        if self.variants.insert(id, Arc::new(request)).is_some() {
            warn!(request = id, "Request variant replaced");
        }
        self
    }

    pub fn get(&self, id: u8) -> Option<Arc<dyn Request>> {
        self.variants.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop(u8);

    struct Finish;

    #[async_trait]
    impl Machine for Finish {
        async fn tick(&mut self) -> Result<Status, FsmError> {
            Ok(Status::Finished)
        }
    }

    impl Request for Nop {
        fn id(&self) -> u8 {
            self.0
        }

        fn new_machine(&self, _channel: Arc<Channel>, _span: Span) -> Box<dyn Machine> {
            Box::new(Finish)
        }
    }

    #[test]
    fn test_requests_registry() {
        let mut requests = Requests::new();
        assert!(requests.is_empty());

        requests.register(Nop(1)).register(Nop(7));
        assert_eq!(requests.len(), 2);
        assert_eq!(requests.get(7).unwrap().id(), 7);
        assert!(requests.get(2).is_none());

        requests.register(Nop(7));
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn test_response_bytes() {
        assert_eq!(Response::Ok.as_byte(), 0x00);
        assert_eq!(Response::BadRequest.as_byte(), 0x01);
        assert_eq!(Response::DialFailed.as_byte(), 0x02);
        assert_eq!(Response::AccessDenied.as_byte(), 0x03);
        assert_eq!(Response::from_byte(0x02), Some(Response::DialFailed));
        assert_eq!(Response::from_byte(0x42), None);
    }

    #[test]
    fn test_timeout_classification() {
        assert!(FsmError::Mux(MuxError::Timeout).is_timeout());
        assert!(!FsmError::InvalidTimeout.is_timeout());
    }
}
