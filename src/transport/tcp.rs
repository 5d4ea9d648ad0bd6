//! TCP upstream dialer

use super::{Dialer, Upstream};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::trace;

/// Dials plain TCP connections
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl TcpDialer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddrV4, timeout: Duration) -> io::Result<Box<dyn Upstream>> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;

        // Configure TCP options
        stream.set_nodelay(true).ok();

        trace!(%addr, "Upstream connected");
        Ok(Box::new(stream))
    }
}
