//! IPv4 connect request
//!
//! Request payload, following the request-type byte:
//! ```text
//! +----+----+----+----+----+----+---------+
//! |    IPv4 address   | Port (BE) | Timeout |
//! +----+----+----+----+----+----+---------+
//! ```
//! The timeout is in whole seconds and bounds the dial. The server answers
//! with one [`Response`] byte; on [`Response::Ok`] the channel turns into a
//! byte relay to the dialed upstream.

use super::relay::Relay;
use super::{FsmError, Machine, Request, Response, Status, Transition};
use crate::config::ConnectConfig;
use crate::pool::PoolHandle;
use crate::transport::Dialer;
use crate::tunnel::Channel;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, Span};

/// Request-type byte of the connect request
pub const CONNECT_REQUEST: u8 = 0x01;

/// Payload length following the request-type byte
pub const CONNECT_REQUEST_LEN: usize = 7;

/// Connect request variant
pub struct Connect {
    dialer: Arc<dyn Dialer>,
    runner: Option<PoolHandle>,
    config: ConnectConfig,
}

impl Connect {
    pub fn new(dialer: Arc<dyn Dialer>, config: ConnectConfig) -> Self {
        Self {
            dialer,
            runner: None,
            config,
        }
    }

    /// Run relay pumps on `runner` instead of spawning them
    pub fn with_runner(mut self, runner: PoolHandle) -> Self {
        self.runner = Some(runner);
        self
    }
}

impl Request for Connect {
    fn id(&self) -> u8 {
        CONNECT_REQUEST
    }

    fn new_machine(&self, channel: Arc<Channel>, span: Span) -> Box<dyn Machine> {
        Box::new(ConnectMachine {
            channel,
            dialer: self.dialer.clone(),
            runner: self.runner.clone(),
            config: self.config.clone(),
            span,
            state: State::Bootup,
        })
    }
}

enum State {
    Bootup,
    Relaying(Relay),
    Closed,
}

struct ConnectMachine {
    channel: Arc<Channel>,
    dialer: Arc<dyn Dialer>,
    runner: Option<PoolHandle>,
    config: ConnectConfig,
    span: Span,
    state: State,
}

#[async_trait]
impl Machine for ConnectMachine {
    async fn tick(&mut self) -> Result<Status, FsmError> {
        let transition = match std::mem::replace(&mut self.state, State::Closed) {
            State::Bootup => self.bootup().await?,
            State::Relaying(relay) => match relay.tick(&self.channel).await? {
                Transition::Next(relay) => Transition::Next(State::Relaying(relay)),
                Transition::Terminal => Transition::Terminal,
            },
            State::Closed => Transition::Terminal,
        };

        match transition {
            Transition::Next(state) => {
                self.state = state;
                Ok(Status::Running)
            }
            Transition::Terminal => Ok(Status::Finished),
        }
    }
}

impl ConnectMachine {
    async fn bootup(&mut self) -> Result<Transition<State>, FsmError> {
        let mut request = [0u8; CONNECT_REQUEST_LEN];
        self.channel.read_exact(&mut request).await?;
        // Let other channels proceed while dialing
        self.channel.done().await?;

        let ip = Ipv4Addr::new(request[0], request[1], request[2], request[3]);
        let addr = SocketAddrV4::new(ip, u16::from_be_bytes([request[4], request[5]]));
        let requested = request[6];

        if requested == 0 {
            respond(&self.channel, Response::BadRequest).await?;
            return Err(FsmError::InvalidTimeout);
        }

        if self.config.no_local_access && is_local(ip) {
            respond(&self.channel, Response::AccessDenied).await?;
            return Err(FsmError::AccessDenied(ip));
        }

        let timeout = Duration::from_secs(u64::from(requested)).min(self.config.dial_timeout());
        debug!(parent: &self.span, channel = self.channel.id(), %addr, ?timeout, "Dialing");

        let upstream = match self.dialer.dial(addr, timeout).await {
            Ok(upstream) => upstream,
            Err(source) => {
                respond(&self.channel, Response::DialFailed).await?;
                return Err(FsmError::Dial { addr, source });
            }
        };

        respond(&self.channel, Response::Ok).await?;
        info!(parent: &self.span, channel = self.channel.id(), %addr, "Relay established");

        let relay = Relay::start(
            upstream,
            self.channel.clone(),
            self.runner.as_ref(),
            self.config.connection_timeout(),
            self.span.clone(),
        )
        .await?;

        Ok(Transition::Next(State::Relaying(relay)))
    }
}

async fn respond(channel: &Channel, response: Response) -> Result<(), FsmError> {
    channel.write(&[response.as_byte()]).await?;
    Ok(())
}

/// Destinations refused when local access is disabled
fn is_local(ip: Ipv4Addr) -> bool {
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
}
