//! Connection multiplexer
//!
//! Splits one codec-wrapped connection into virtual channels. Incoming
//! frames are routed one at a time: [`Multiplexer::dispatch`] takes the
//! dispatch gate, reads a frame header and hands the segment, together with
//! the gate, to the addressed channel. The gate comes back only when that
//! channel calls [`Channel::done`], so at most one segment is in flight and
//! the next header is never read before the previous segment is drained.

use super::channel::Channel;
use super::frame::FrameHeader;
use super::{ChannelId, MuxError, DEPLETE_CHUNK_SIZE, FRAME_HEADER_SIZE};
use crate::codec::{Decode, Encode};
use crate::config::MuxConfig;
use crate::deadline::Requester;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, MutexGuard, OwnedMutexGuard};
use tracing::{debug, trace};

pub(super) type BoxDecoder = Box<dyn Decode>;
pub(super) type BoxEncoder = Box<dyn Encode>;

/// Lookup consulted by dispatch to find what handles a channel
pub trait Channels {
    type Machine;

    /// The handler registered for `id`, if any
    fn get(&self, id: ChannelId) -> Option<Self::Machine>;
}

/// A dispatched segment. Owning it means owning the dispatch gate.
pub(super) struct Segment {
    pub(super) reader: OwnedMutexGuard<BoxDecoder>,
    pub(super) remaining: u16,
    pub(super) opened: bool,
}

/// State shared by the multiplexer and all its channels
pub(super) struct Shared {
    gate: Arc<AsyncMutex<BoxDecoder>>,
    writer: AsyncMutex<BoxEncoder>,
    pub(super) requester: Requester,
    down: watch::Sender<bool>,
    dropped: watch::Sender<bool>,
}

impl Shared {
    pub(super) fn is_down(&self) -> bool {
        *self.down.borrow()
    }

    pub(super) fn is_dropped(&self) -> bool {
        *self.dropped.borrow()
    }

    /// Resolves once the multiplexer is shut down
    pub(super) async fn shut_down(&self) {
        let mut down = self.down.subscribe();
        let _ = down.wait_for(|down| *down).await;
    }

    /// Resolves once the physical connection is gone
    pub(super) async fn connection_lost(&self) {
        let mut dropped = self.dropped.subscribe();
        let _ = dropped.wait_for(|dropped| *dropped).await;
    }

    fn mark_dropped(&self) {
        if !self.dropped.send_replace(true) {
            debug!("Physical connection lost");
        }
    }

    /// Decode once from the owned reader. End of stream counts as
    /// connection loss.
    pub(super) async fn read_some(
        &self,
        reader: &mut BoxDecoder,
        buf: &mut [u8],
    ) -> Result<usize, MuxError> {
        let read = tokio::select! {
            biased;
            _ = self.shut_down() => return Err(MuxError::Shutdown),
            read = reader.decode(buf) => read,
        };

        match read {
            Ok(0) if !buf.is_empty() => {
                self.mark_dropped();
                Err(MuxError::ConnectionDropped)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.mark_dropped();
                Err(MuxError::Io(e))
            }
        }
    }

    async fn read_exact(&self, reader: &mut BoxDecoder, buf: &mut [u8]) -> Result<(), MuxError> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.read_some(reader, &mut buf[filled..]).await?;
        }
        Ok(())
    }

    /// Read and throw away whatever is left of `segment`
    pub(super) async fn discard(&self, segment: &mut Segment) -> Result<(), MuxError> {
        let mut scratch = [0u8; DEPLETE_CHUNK_SIZE];
        while segment.remaining > 0 {
            let len = scratch.len().min(segment.remaining as usize);
            let n = self.read_some(&mut segment.reader, &mut scratch[..len]).await?;
            segment.remaining -= n as u16;
        }
        Ok(())
    }

    /// Take the write lock, giving up on shutdown or connection loss
    pub(super) async fn lock_writer(&self) -> Result<MutexGuard<'_, BoxEncoder>, MuxError> {
        tokio::select! {
            biased;
            _ = self.shut_down() => Err(MuxError::Shutdown),
            _ = self.connection_lost() => Err(MuxError::ConnectionDropped),
            writer = self.writer.lock() => Ok(writer),
        }
    }

    /// Write one frame as a single encode call
    pub(super) async fn write_frame(
        &self,
        writer: &mut BoxEncoder,
        header: FrameHeader,
        segment: &[u8],
    ) -> Result<(), MuxError> {
        if self.is_dropped() {
            return Err(MuxError::ConnectionDropped);
        }

        let header = header.encode();
        let parts: [&[u8]; 2] = [&header, segment];
        let written = tokio::select! {
            biased;
            _ = self.shut_down() => return Err(MuxError::Shutdown),
            written = writer.encode(&parts) => written,
        };

        written.map_err(|e| {
            self.mark_dropped();
            MuxError::Io(e)
        })
    }
}

/// Virtual channel multiplexer over one physical connection
pub struct Multiplexer {
    shared: Arc<Shared>,
    channels: Mutex<Vec<Option<Arc<Channel>>>>,
    max_channels: usize,
    timeout: Mutex<Duration>,
}

impl Multiplexer {
    /// Wrap a decoder/encoder pair. Channel IDs `0..max_channels` are
    /// addressable; new channels start with the configured read timeout.
    pub fn new<D, E>(decoder: D, encoder: E, requester: Requester, config: &MuxConfig) -> Self
    where
        D: Decode + 'static,
        E: Encode + 'static,
    {
        let max_channels = config.max_channels.clamp(1, super::MAX_CHANNELS);
        let (down, _) = watch::channel(false);
        let (dropped, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                gate: Arc::new(AsyncMutex::new(Box::new(decoder))),
                writer: AsyncMutex::new(Box::new(encoder)),
                requester,
                down,
                dropped,
            }),
            channels: Mutex::new(vec![None; max_channels]),
            max_channels,
            timeout: Mutex::new(config.read_timeout()),
        }
    }

    /// Number of addressable channels
    pub fn max_channels(&self) -> usize {
        self.max_channels
    }

    /// Read timeout given to channels created from now on. Also bounds the
    /// wait for each frame header in dispatch.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the channel for `id`, creating it on first use
    pub fn channel(&self, id: ChannelId) -> Result<Arc<Channel>, MuxError> {
        if self.shared.is_down() {
            return Err(MuxError::Shutdown);
        }
        if id as usize >= self.max_channels {
            return Err(MuxError::InvalidChannel(id));
        }

        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = &channels[id as usize] {
            return Ok(channel.clone());
        }

        let channel = Arc::new(Channel::new(id, self.shared.clone(), self.timeout()));
        channels[id as usize] = Some(channel.clone());
        trace!(channel = id, "Virtual channel created");
        Ok(channel)
    }

    fn active(&self, id: ChannelId) -> Option<Arc<Channel>> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.get(id as usize).and_then(Clone::clone)
    }

    fn route<C: Channels>(
        &self,
        registry: &C,
        id: ChannelId,
    ) -> Result<(C::Machine, Arc<Channel>), MuxError> {
        if id as usize >= self.max_channels {
            return Err(MuxError::InvalidChannel(id));
        }
        let machine = registry.get(id).ok_or(MuxError::ChannelUnavailable(id))?;
        let channel = self.active(id).ok_or(MuxError::ChannelInactive(id))?;
        Ok((machine, channel))
    }

    /// Read the next frame header, giving up after the read timeout.
    ///
    /// A peer silent for that long is treated as gone: the header may be
    /// partly consumed, so the connection is marked dropped.
    async fn read_header(&self, reader: &mut BoxDecoder) -> Result<FrameHeader, MuxError> {
        let timeout = self.timeout();
        let mut waiter = if timeout.is_zero() {
            None
        } else {
            Some(self.shared.requester.request_after(timeout)?)
        };

        let deadline = async {
            match waiter.as_mut() {
                Some(waiter) => waiter.wait().await,
                None => std::future::pending().await,
            }
        };

        let mut header = [0u8; FRAME_HEADER_SIZE];
        tokio::select! {
            read = self.shared.read_exact(reader, &mut header) => read?,
            fired = deadline => {
                fired?;
                debug!(?timeout, "No frame from peer within the read timeout");
                self.shared.mark_dropped();
                return Err(MuxError::Timeout);
            }
        }

        Ok(FrameHeader::decode(header))
    }

    /// Route the next incoming frame.
    ///
    /// Waits for the dispatch gate, reads one header and delivers the
    /// segment to the addressed channel, returning that channel's ID and
    /// handler. A header that does not arrive within [`Multiplexer::timeout`]
    /// fails with [`MuxError::Timeout`] and ends the connection. Segments for channels that cannot take them are discarded
    /// before the error is returned, so framing stays aligned.
    pub async fn dispatch<C: Channels>(
        &self,
        registry: &C,
    ) -> Result<(ChannelId, C::Machine), MuxError> {
        let gate = self.shared.gate.clone();
        let mut reader = tokio::select! {
            biased;
            _ = self.shared.shut_down() => return Err(MuxError::Shutdown),
            _ = self.shared.connection_lost() => return Err(MuxError::ConnectionDropped),
            reader = gate.lock_owned() => reader,
        };

        let header = self.read_header(&mut reader).await?;

        let mut segment = Segment {
            reader,
            remaining: header.length,
            opened: false,
        };

        let (machine, channel) = match self.route(registry, header.channel) {
            Ok(routed) => routed,
            Err(e) => {
                trace!(channel = header.channel, length = header.length, "Discarding frame: {}", e);
                self.shared.discard(&mut segment).await?;
                return Err(e);
            }
        };

        trace!(channel = header.channel, length = header.length, "Frame dispatched");
        channel.deliver(segment).await?;
        Ok((header.channel, machine))
    }

    /// Stop the multiplexer. Blocked dispatches, reads and writes return
    /// [`MuxError::Shutdown`].
    pub fn shutdown(&self) -> Result<(), MuxError> {
        if self.shared.down.send_replace(true) {
            return Err(MuxError::AlreadyShutdown);
        }

        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .for_each(|slot| *slot = None);

        debug!("Multiplexer shut down");
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_down()
    }

    /// Whether the multiplexer can no longer carry frames
    pub fn is_closed(&self) -> bool {
        self.shared.is_down() || self.shared.is_dropped()
    }

    /// Resolves on shutdown or connection loss
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.shared.shut_down() => {}
            _ = self.shared.connection_lost() => {}
        }
    }
}
