//! Per-connection routing loop
//!
//! A [`Session`] owns one multiplexer and the machine table of its channels.
//! It dispatches frames one after another and hands each tick to the worker
//! pool, so a slow request only holds up the frames behind it on the same
//! connection for as long as its segment is unread.

use crate::fsm::{ChannelMachine, MachineTable, Requests, SharedMachine, Status};
use crate::pool::{Job, PoolError, PoolHandle};
use crate::tunnel::{ChannelId, MuxError, Multiplexer};
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument, Span};

/// Routing loop of one physical connection
pub struct Session {
    mux: Arc<Multiplexer>,
    table: MachineTable,
    runner: Option<PoolHandle>,
    span: Span,
}

impl Session {
    /// Create every channel of `mux` and bind a machine to each
    pub fn new(
        mux: Multiplexer,
        requests: Arc<Requests>,
        runner: Option<PoolHandle>,
        span: Span,
    ) -> Result<Self, MuxError> {
        let mux = Arc::new(mux);
        let mut table = MachineTable::new(mux.max_channels());

        for id in 0..mux.max_channels() {
            let channel = mux.channel(id as ChannelId)?;
            table.insert(ChannelMachine::new(channel, requests.clone(), span.clone()));
        }

        Ok(Self {
            mux,
            table,
            runner,
            span,
        })
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    /// Route frames until the connection ends. Shuts the multiplexer down
    /// on the way out.
    pub async fn run(self) -> Result<(), MuxError> {
        let result = loop {
            let (id, machine) = match self.mux.dispatch(&self.table).await {
                Ok(dispatched) => dispatched,
                Err(MuxError::Shutdown | MuxError::ConnectionDropped) => break Ok(()),
                Err(MuxError::Timeout) => {
                    debug!(parent: &self.span, "Peer idle past the read timeout");
                    break Ok(());
                }
                Err(e) if e.is_connection_wide() => break Err(e),
                Err(e) => {
                    warn!(parent: &self.span, "Frame dropped: {}", e);
                    continue;
                }
            };

            match self.submit(id, machine).await {
                Ok(()) => {}
                Err(PoolError::Closed) => {
                    debug!(parent: &self.span, "Worker pool closed, ending session");
                    break Ok(());
                }
                Err(e) => warn!(parent: &self.span, channel = id, "Tick refused: {}", e),
            }
        };

        let _ = self.mux.shutdown();
        debug!(parent: &self.span, "Session ended");
        result
    }

    async fn submit(&self, id: ChannelId, machine: SharedMachine) -> Result<(), PoolError> {
        let span = info_span!(parent: &self.span, "channel", channel = id);
        let tick = async move {
            let mut machine = machine.lock().await;
            match machine.tick().await {
                Ok(Status::Running) => {}
                Ok(Status::Finished) => debug!("Request finished"),
                Err(e) if e.is_timeout() => debug!("Request timed out: {}", e),
                Err(e) => debug!("Request failed: {}", e),
            }
            Ok::<_, crate::Error>(())
        }
        .instrument(span);

        let Some(runner) = &self.runner else {
            tokio::spawn(tick);
            return Ok(());
        };

        // A refused tick never reads its segment; release it here
        let channel = self.mux.channel(id).ok();
        let job = Job::new(tick).with_cleanup(async move {
            if let Some(channel) = channel {
                let _ = channel.abandon().await;
            }
        });
        runner.run(job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::plain;
    use crate::config::{MuxConfig, PoolConfig};
    use crate::deadline::Scheduler;
    use crate::fsm::{Machine, FsmError, Request};
    use crate::pool::Pool;
    use crate::tunnel::{encode_frame, Channel, FrameHeader, FRAME_HEADER_SIZE};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Replies with the segment reversed
    struct Reverse {
        channel: Arc<Channel>,
    }

    #[async_trait]
    impl Machine for Reverse {
        async fn tick(&mut self) -> Result<Status, FsmError> {
            let mut buf = [0u8; 64];
            let mut data = Vec::new();
            loop {
                match self.channel.read(&mut buf).await {
                    Ok(n) => data.extend_from_slice(&buf[..n]),
                    Err(MuxError::SegmentDepleted) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            data.reverse();
            self.channel.write(&data).await?;
            Ok(Status::Finished)
        }
    }

    struct ReverseRequest;

    impl Request for ReverseRequest {
        fn id(&self) -> u8 {
            0x10
        }

        fn new_machine(&self, channel: Arc<Channel>, _span: Span) -> Box<dyn Machine> {
            Box::new(Reverse { channel })
        }
    }

    fn session(runner: Option<PoolHandle>) -> (Session, DuplexStream) {
        session_with(runner, MuxConfig::default())
    }

    fn session_with(runner: Option<PoolHandle>, config: MuxConfig) -> (Session, DuplexStream) {
        let requester = Scheduler::new(Duration::from_millis(10), 256).serve().unwrap();
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (decoder, encoder) = plain(near);
        let mux = Multiplexer::new(decoder, encoder, requester, &config);

        let mut requests = Requests::new();
        requests.register(ReverseRequest);

        let session = Session::new(mux, Arc::new(requests), runner, Span::none()).unwrap();
        (session, far)
    }

    async fn recv(peer: &mut DuplexStream) -> (ChannelId, Vec<u8>) {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        peer.read_exact(&mut header).await.unwrap();
        let header = FrameHeader::decode(header);
        let mut segment = vec![0u8; header.length as usize];
        peer.read_exact(&mut segment).await.unwrap();
        (header.channel, segment)
    }

    #[tokio::test]
    async fn test_session_with_pool() {
        let requester = Scheduler::new(Duration::from_millis(10), 256).serve().unwrap();
        let pool = Pool::new(PoolConfig::default(), requester);
        let runner = pool.serve().unwrap();

        let (session, mut peer) = session(Some(runner.clone()));
        let task = tokio::spawn(session.run());

        for id in 0..4u8 {
            let frame = encode_frame(id, &[0x10, b'a', b'b', b'c' + id]).unwrap();
            peer.write_all(&frame).await.unwrap();
            let (channel, reply) = recv(&mut peer).await;
            assert_eq!(channel, id);
            assert_eq!(reply, vec![b'c' + id, b'b', b'a']);
        }

        // Unknown request types do not end the session
        peer.write_all(&encode_frame(5, &[0xEE]).unwrap()).await.unwrap();
        peer.write_all(&encode_frame(6, &[0x10, b'x', b'y']).unwrap()).await.unwrap();
        assert_eq!(recv(&mut peer).await, (6, b"yx".to_vec()));

        drop(peer);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session should end when the peer goes away")
            .unwrap()
            .unwrap();

        runner.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_without_pool() {
        let (session, mut peer) = session(None);
        let mux = session.multiplexer().clone();
        let task = tokio::spawn(session.run());

        peer.write_all(&encode_frame(0, &[0x10, 1, 2, 3]).unwrap()).await.unwrap();
        assert_eq!(recv(&mut peer).await, (0, vec![3, 2, 1]));

        mux.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session should end on shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_pool_ends_session() {
        let requester = Scheduler::new(Duration::from_millis(10), 256).serve().unwrap();
        let pool = Pool::new(PoolConfig::default(), requester);
        let runner = pool.serve().unwrap();
        runner.close().await.unwrap();

        let (session, mut peer) = session(Some(runner));
        let mux = session.multiplexer().clone();
        let task = tokio::spawn(session.run());

        peer.write_all(&encode_frame(1, &[0x10, 9]).unwrap()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session should end once the pool refuses work")
            .unwrap()
            .unwrap();
        assert!(mux.is_shutdown());
    }

    #[tokio::test]
    async fn test_idle_peer_ends_session() {
        let config = MuxConfig {
            read_timeout_ms: 100,
            ..MuxConfig::default()
        };
        let (session, mut peer) = session_with(None, config);
        let mux = session.multiplexer().clone();
        let task = tokio::spawn(session.run());

        peer.write_all(&encode_frame(0, &[0x10, 1, 2]).unwrap()).await.unwrap();
        assert_eq!(recv(&mut peer).await, (0, vec![2, 1]));

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session should end once the peer goes quiet")
            .unwrap()
            .unwrap();
        assert!(mux.is_closed());
    }
}
