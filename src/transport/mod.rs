//! Upstream transports
//!
//! Connect requests reach their destination through a [`Dialer`]. The
//! server uses [`TcpDialer`]; tests substitute their own.

mod tcp;

pub use tcp::TcpDialer;

use async_trait::async_trait;
use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// A dialed upstream connection
pub trait Upstream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Upstream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens upstream connections on behalf of connect requests
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr`, giving up after `timeout`
    async fn dial(&self, addr: SocketAddrV4, timeout: Duration) -> io::Result<Box<dyn Upstream>>;
}
