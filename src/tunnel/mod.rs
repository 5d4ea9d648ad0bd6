//! Tunnel layer - virtual channels over one physical connection
//!
//! Provides:
//! - Frame header encoding/decoding
//! - Frame routing with a single dispatch gate
//! - Virtual channel reads, writes and segment draining

mod channel;
mod frame;
mod multiplexer;

pub use channel::Channel;
pub use frame::{encode_frame, FrameHeader, FRAME_HEADER_SIZE, MAX_SEGMENT_SIZE};
pub use multiplexer::{Channels, Multiplexer};

use crate::deadline::DeadlineError;
use thiserror::Error;

/// Virtual channel identifier, carried as the first header byte
pub type ChannelId = u8;

/// Upper bound on channels per connection (one-byte ID)
pub const MAX_CHANNELS: usize = 256;

/// Default number of channels per connection
pub const DEFAULT_MAX_CHANNELS: usize = 16;

/// Chunk size used when discarding unread segment bytes
pub const DEPLETE_CHUNK_SIZE: usize = 256;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Segment too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid channel ID: {0}")]
    InvalidChannel(ChannelId),

    #[error("Channel {0} is unavailable")]
    ChannelUnavailable(ChannelId),

    #[error("Channel {0} is inactive")]
    ChannelInactive(ChannelId),

    #[error("Virtual channel read timed out")]
    Timeout,

    #[error("Segment of current virtual channel is depleted")]
    SegmentDepleted,

    #[error("Connection dropped")]
    ConnectionDropped,

    #[error("Multiplexer shut down")]
    Shutdown,

    #[error("Multiplexer already shut down")]
    AlreadyShutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Deadline error: {0}")]
    Deadline(#[from] DeadlineError),
}

impl MuxError {
    /// Timeouts leave the channel usable; the caller may retry
    pub fn is_timeout(&self) -> bool {
        matches!(self, MuxError::Timeout)
    }

    /// Errors after which the physical connection cannot carry more frames
    pub fn is_connection_wide(&self) -> bool {
        matches!(
            self,
            MuxError::ConnectionDropped
                | MuxError::Shutdown
                | MuxError::AlreadyShutdown
                | MuxError::Io(_)
        )
    }
}
