//! Stream codecs
//!
//! A codec wraps the raw connection before the multiplexer sees it. The
//! decode half is only ever driven by whoever holds the dispatch gate; the
//! encode half is only ever driven under the connection write lock.
//!
//! - [`plain`]: identity transform (tests, trusted links)
//! - [`sealed`]: ChaCha20-Poly1305 records keyed from a pre-shared key

mod plain;
mod sealed;

pub use plain::{plain, PlainDecoder, PlainEncoder};
pub use sealed::{sealed, Role, SealedDecoder, SealedEncoder, MAX_BLOCK_SIZE};

use async_trait::async_trait;
use std::io;

/// Read side of a codec
#[async_trait]
pub trait Decode: Send {
    /// Read decoded bytes into `buf`. `Ok(0)` on a non-empty `buf` means
    /// the underlying stream ended.
    async fn decode(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write side of a codec
#[async_trait]
pub trait Encode: Send {
    /// Encode `parts` as one unit and write it out. A unit is never
    /// interleaved with another unit on the wire.
    async fn encode(&mut self, parts: &[&[u8]]) -> io::Result<()>;
}
