//! Byte relay between a channel and its dialed upstream

use super::{FsmError, Transition};
use crate::pool::{Job, PoolHandle};
use crate::transport::Upstream;
use crate::tunnel::{Channel, MuxError};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tracing::{debug, trace, Instrument, Span};

/// Upstream read size
const PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// Channel-to-upstream half of a relay, plus control over the pump task
/// carrying the other direction
pub(super) struct Relay {
    upstream: WriteHalf<Box<dyn Upstream>>,
    idle_timeout: Duration,
    stop: Option<oneshot::Sender<()>>,
}

impl Relay {
    /// Split `upstream` and start pumping its output into `channel`.
    ///
    /// The pump runs on `runner` when given, otherwise on its own task.
    pub(super) async fn start(
        upstream: Box<dyn Upstream>,
        channel: Arc<Channel>,
        runner: Option<&PoolHandle>,
        idle_timeout: Duration,
        span: Span,
    ) -> Result<Self, FsmError> {
        let (reader, writer) = tokio::io::split(upstream);
        let (stop_tx, stop_rx) = oneshot::channel();

        let pump = pump(reader, channel.clone(), idle_timeout, stop_rx).instrument(span);

        match runner {
            Some(runner) => {
                let job = Job::new(async move { pump.await.map_err(Into::into) }).with_cleanup(
                    async move {
                        let _ = channel.write_eof().await;
                    },
                );
                runner.run(job).await?;
            }
            None => {
                tokio::spawn(async move {
                    if let Err(e) = pump.await {
                        debug!("Relay pump failed: {}", e);
                    }
                });
            }
        }

        Ok(Self {
            upstream: writer,
            idle_timeout,
            stop: Some(stop_tx),
        })
    }

    /// Forward the current segment to the upstream.
    ///
    /// A zero-length segment means the peer is done sending; the upstream
    /// write side is shut down and the relay ends, leaving the pump to
    /// finish the other direction.
    pub(super) async fn tick(mut self, channel: &Channel) -> Result<Transition<Relay>, FsmError> {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];

        loop {
            let n = match channel.read(&mut buf).await {
                Ok(n) => n,
                Err(MuxError::SegmentDepleted) => return Ok(Transition::Next(self)),
                Err(e) => return Err(self.abort(e.into())),
            };

            if n == 0 {
                trace!(channel = channel.id(), "Peer finished sending");
                return match self.upstream.shutdown().await {
                    Ok(()) => Ok(Transition::Terminal),
                    Err(e) => Err(self.abort(FsmError::Upstream(e))),
                };
            }

            let written = self.upstream.write_all(&buf[..n]);
            match tokio::time::timeout(self.idle_timeout, written).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(self.abort(FsmError::Upstream(e))),
                Err(_) => {
                    let timed_out = io::Error::new(io::ErrorKind::TimedOut, "upstream write timed out");
                    return Err(self.abort(FsmError::Upstream(timed_out)));
                }
            }
        }
    }

    /// Stop the pump and hand back `err`
    fn abort(mut self, err: FsmError) -> FsmError {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        err
    }
}

/// Copy upstream output into the channel until the upstream ends, goes
/// idle for `idle_timeout`, the relay is aborted or the channel closes.
/// Ends with a zero-length frame when the upstream side finished first.
async fn pump(
    mut upstream: ReadHalf<Box<dyn Upstream>>,
    channel: Arc<Channel>,
    idle_timeout: Duration,
    stop: oneshot::Receiver<()>,
) -> Result<(), FsmError> {
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    // Dropping the sender detaches the pump instead of stopping it
    let mut stop = Some(stop);

    loop {
        let stopped = async {
            match stop.as_mut() {
                Some(stop) => stop.await.is_ok(),
                None => std::future::pending().await,
            }
        };

        let read = tokio::select! {
            biased;
            aborted = stopped => {
                if aborted {
                    trace!(channel = channel.id(), "Relay pump aborted");
                    return Ok(());
                }
                stop = None;
                continue;
            }
            _ = channel.closed() => {
                trace!(channel = channel.id(), "Channel closed under relay pump");
                return Ok(());
            }
            read = tokio::time::timeout(idle_timeout, upstream.read(&mut buf)) => read,
        };

        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                channel.write(&buf[..n]).await?;
            }
            Ok(Err(e)) => {
                debug!(channel = channel.id(), "Upstream read failed: {}", e);
                break;
            }
            Err(_) => {
                debug!(channel = channel.id(), "Upstream idle for {:?}", idle_timeout);
                break;
            }
        }
    }

    channel.write_eof().await?;
    trace!(channel = channel.id(), "Relay pump finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::plain;
    use crate::config::MuxConfig;
    use crate::deadline::Scheduler;
    use crate::tunnel::{encode_frame, ChannelId, Channels, Multiplexer};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    /// Upstream that takes writes but fails to shut down
    struct BrokenUpstream;

    impl AsyncRead for BrokenUpstream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for BrokenUpstream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "upstream gone")))
        }
    }

    struct Only(ChannelId);

    impl Channels for Only {
        type Machine = ();

        fn get(&self, id: ChannelId) -> Option<()> {
            (id == self.0).then_some(())
        }
    }

    #[tokio::test]
    async fn test_upstream_shutdown_failure_is_reported() {
        let requester = Scheduler::new(Duration::from_millis(10), 64).serve().unwrap();
        let (near, mut peer) = tokio::io::duplex(64 * 1024);
        let (decoder, encoder) = plain(near);
        let mux = Multiplexer::new(
            decoder,
            encoder,
            requester,
            &MuxConfig {
                read_timeout_ms: 0,
                ..MuxConfig::default()
            },
        );
        let channel = mux.channel(1).unwrap();

        let relay = Relay::start(
            Box::new(BrokenUpstream),
            channel.clone(),
            None,
            Duration::from_secs(5),
            Span::none(),
        )
        .await
        .unwrap();

        peer.write_all(&encode_frame(1, &[]).unwrap()).await.unwrap();
        mux.dispatch(&Only(1)).await.unwrap();

        let result = relay.tick(&channel).await;
        assert!(matches!(result, Err(FsmError::Upstream(_))));
        channel.done().await.unwrap();
    }
}
