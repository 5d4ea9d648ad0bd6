//! Identity codec

use super::{Decode, Encode};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Pass-through decoder
pub struct PlainDecoder<R> {
    inner: R,
}

impl<R> PlainDecoder<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Decode for PlainDecoder<R> {
    async fn decode(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }
}

/// Pass-through encoder
pub struct PlainEncoder<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W> PlainEncoder<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Encode for PlainEncoder<W> {
    async fn encode(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        self.buf.clear();
        for part in parts {
            self.buf.extend_from_slice(part);
        }

        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await
    }
}

/// Split `io` into a pass-through decoder/encoder pair
pub fn plain<T>(io: T) -> (PlainDecoder<ReadHalf<T>>, PlainEncoder<WriteHalf<T>>)
where
    T: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(io);
    (PlainDecoder::new(read_half), PlainEncoder::new(write_half))
}
