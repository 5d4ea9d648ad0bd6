//! Virtual channel
//!
//! A channel owns at most one dispatched segment at a time. Reads consume
//! that segment; [`Channel::done`] drains what is left and hands the
//! dispatch gate back to the multiplexer.

use super::frame::{FrameHeader, MAX_SEGMENT_SIZE};
use super::multiplexer::{Segment, Shared};
use super::{ChannelId, MuxError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::trace;

struct Reader {
    inbox: mpsc::Receiver<Segment>,
    current: Option<Segment>,
}

/// One virtual channel of a [`super::Multiplexer`]
pub struct Channel {
    id: ChannelId,
    shared: Arc<Shared>,
    inbox: mpsc::Sender<Segment>,
    reader: AsyncMutex<Reader>,
    timeout: Mutex<Duration>,
}

impl Channel {
    pub(super) fn new(id: ChannelId, shared: Arc<Shared>, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            id,
            shared,
            inbox: tx,
            reader: AsyncMutex::new(Reader {
                inbox: rx,
                current: None,
            }),
            timeout: Mutex::new(timeout),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Per-read deadline (zero disables)
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves once the multiplexer shuts down or loses its connection
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.shared.shut_down() => {}
            _ = self.shared.connection_lost() => {}
        }
    }

    /// Hand a dispatched segment to this channel
    pub(super) async fn deliver(&self, segment: Segment) -> Result<(), MuxError> {
        tokio::select! {
            biased;
            _ = self.shared.shut_down() => Err(MuxError::Shutdown),
            sent = self.inbox.send(segment) => sent.map_err(|_| MuxError::Shutdown),
            _ = self.shared.connection_lost() => Err(MuxError::ConnectionDropped),
        }
    }

    /// Wait for the next dispatched segment
    async fn receive(&self, inbox: &mut mpsc::Receiver<Segment>) -> Result<Segment, MuxError> {
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

        tokio::select! {
            biased;
            _ = self.shared.shut_down() => Err(MuxError::Shutdown),
            segment = inbox.recv() => segment.ok_or(MuxError::Shutdown),
            _ = self.shared.connection_lost() => Err(MuxError::ConnectionDropped),
            fired = deadline => match fired {
                Ok(()) => Err(MuxError::Timeout),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// The owned segment, waiting for one if none is owned yet
    async fn segment<'r>(&self, reader: &'r mut Reader) -> Result<&'r mut Segment, MuxError> {
        let segment = match reader.current.take() {
            Some(segment) => segment,
            None => {
                let segment = self.receive(&mut reader.inbox).await?;
                trace!(channel = self.id, length = segment.remaining, "Segment acquired");
                segment
            }
        };
        Ok(reader.current.insert(segment))
    }

    /// Read up to `buf.len()` bytes of the current segment.
    ///
    /// Returns `Ok(0)` on the first read of a zero-length segment and
    /// [`MuxError::SegmentDepleted`] once an owned segment is used up.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        let mut reader = self.reader.lock().await;
        let segment = self.segment(&mut reader).await?;

        if segment.remaining == 0 {
            if !segment.opened {
                segment.opened = true;
                return Ok(0);
            }
            return Err(MuxError::SegmentDepleted);
        }

        segment.opened = true;
        if buf.is_empty() {
            return Ok(0);
        }

        let len = buf.len().min(segment.remaining as usize);
        let n = self
            .shared
            .read_some(&mut segment.reader, &mut buf[..len])
            .await?;
        segment.remaining -= n as u16;
        Ok(n)
    }

    /// Fill `buf` from the current segment
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), MuxError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]).await? {
                0 => return Err(MuxError::SegmentDepleted),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Write `data` as one or more frames of at most 65535 bytes each
    pub async fn write(&self, data: &[u8]) -> Result<usize, MuxError> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut writer = self.shared.lock_writer().await?;
        for chunk in data.chunks(MAX_SEGMENT_SIZE) {
            let header = FrameHeader::new(self.id, chunk.len() as u16);
            self.shared.write_frame(&mut writer, header, chunk).await?;
        }
        Ok(data.len())
    }

    /// Write a zero-length frame, telling the peer this side is finished
    pub async fn write_eof(&self) -> Result<(), MuxError> {
        let mut writer = self.shared.lock_writer().await?;
        self.shared
            .write_frame(&mut writer, FrameHeader::new(self.id, 0), &[])
            .await
    }

    /// Whether the owned segment has been read to the end
    pub async fn depleted(&self) -> bool {
        let reader = self.reader.lock().await;
        reader
            .current
            .as_ref()
            .map_or(false, |segment| segment.remaining == 0)
    }

    /// Discard the unread remainder of the owned segment
    pub async fn deplete(&self) -> Result<(), MuxError> {
        let mut reader = self.reader.lock().await;
        match reader.current.as_mut() {
            Some(segment) => self.shared.discard(segment).await,
            None => Ok(()),
        }
    }

    /// Deplete the owned segment and release the dispatch gate
    pub async fn done(&self) -> Result<(), MuxError> {
        let mut reader = self.reader.lock().await;
        release(&self.shared, &mut reader, self.id).await
    }

    /// Release a segment dispatched to this channel that will never be
    /// handled, whether or not it was picked up yet
    pub async fn abandon(&self) -> Result<(), MuxError> {
        let mut reader = self.reader.lock().await;
        if reader.current.is_none() {
            match reader.inbox.try_recv() {
                Ok(segment) => reader.current = Some(segment),
                Err(_) => return Ok(()),
            }
        }
        release(&self.shared, &mut reader, self.id).await
    }
}

async fn release(shared: &Shared, reader: &mut Reader, id: ChannelId) -> Result<(), MuxError> {
    let Some(mut segment) = reader.current.take() else {
        return Ok(());
    };

    let depleted = shared.discard(&mut segment).await;
    drop(segment);
    trace!(channel = id, "Dispatch gate released");
    depleted
}
