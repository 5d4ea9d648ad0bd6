//! Sealed record codec
//!
//! Stream layout, per direction:
//!
//! ```text
//! +----------------+------------------------+------------------------+----
//! |  Salt (32B)    | Sealed size (2B + tag) | Sealed block (n + tag) | ...
//! +----------------+------------------------+------------------------+----
//! ```
//!
//! The salt is random per stream, so the direction key derived from the
//! pre-shared key is never reused across connections and counter nonces
//! stay unique.

use super::{Decode, Encode};
use crate::crypto::{
    derive_direction_key, random_bytes, Cipher, CryptoError, Direction, KEY_LEN, SALT_LEN,
    TAG_LEN,
};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Largest plaintext block carried by one record
pub const MAX_BLOCK_SIZE: usize = 4096;

/// Which end of the connection this codec runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn sending(self) -> Direction {
        match self {
            Role::Client => Direction::Upstream,
            Role::Server => Direction::Downstream,
        }
    }

    fn receiving(self) -> Direction {
        match self {
            Role::Client => Direction::Downstream,
            Role::Server => Direction::Upstream,
        }
    }
}

fn invalid(e: CryptoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Keyed cipher for one direction, created once the salt is known
fn stream_cipher(
    psk: &[u8; KEY_LEN],
    salt: &[u8],
    direction: Direction,
) -> io::Result<Cipher> {
    let key = derive_direction_key(psk, salt, direction).map_err(invalid)?;
    Cipher::new(&key).map_err(invalid)
}

/// Decoding half
pub struct SealedDecoder<R> {
    inner: R,
    psk: [u8; KEY_LEN],
    direction: Direction,
    cipher: Option<Cipher>,
    plain: BytesMut,
}

impl<R: AsyncRead + Unpin + Send> SealedDecoder<R> {
    pub fn new(inner: R, psk: [u8; KEY_LEN], role: Role) -> Self {
        Self {
            inner,
            psk,
            direction: role.receiving(),
            cipher: None,
            plain: BytesMut::with_capacity(MAX_BLOCK_SIZE),
        }
    }

    /// Read and open one record into the plaintext buffer.
    /// Returns `false` on a clean end of stream.
    async fn fill(&mut self) -> io::Result<bool> {
        if self.cipher.is_none() {
            let mut salt = [0u8; SALT_LEN];
            if !read_or_eof(&mut self.inner, &mut salt).await? {
                return Ok(false);
            }
            self.cipher = Some(stream_cipher(&self.psk, &salt, self.direction)?);
        }

        let Some(cipher) = self.cipher.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "cipher unavailable"));
        };

        let mut size = [0u8; 2 + TAG_LEN];
        if !read_or_eof(&mut self.inner, &mut size).await? {
            return Ok(false);
        }

        let size = cipher.open(&mut size).map_err(invalid)?;
        if size.len() != 2 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid record size"));
        }

        let len = u16::from_be_bytes([size[0], size[1]]) as usize;
        if len > MAX_BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("record block too large: {} > {}", len, MAX_BLOCK_SIZE),
            ));
        }

        let mut record = vec![0u8; len + TAG_LEN];
        self.inner.read_exact(&mut record).await?;

        let block = cipher.open(&mut record).map_err(invalid)?;
        self.plain.extend_from_slice(block);
        Ok(true)
    }
}

/// `read_exact` that reports a stream ending before the first byte as `false`
async fn read_or_eof<R: AsyncRead + Unpin>(inner: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = inner.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(true)
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> Decode for SealedDecoder<R> {
    async fn decode(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.plain.is_empty() {
            if !self.fill().await? {
                return Ok(0);
            }
        }

        let n = buf.len().min(self.plain.len());
        buf[..n].copy_from_slice(&self.plain[..n]);
        self.plain.advance(n);
        Ok(n)
    }
}

/// Encoding half
pub struct SealedEncoder<W> {
    inner: W,
    psk: [u8; KEY_LEN],
    direction: Direction,
    cipher: Option<Cipher>,
    out: Vec<u8>,
}

impl<W: AsyncWrite + Unpin + Send> SealedEncoder<W> {
    pub fn new(inner: W, psk: [u8; KEY_LEN], role: Role) -> Self {
        Self {
            inner,
            psk,
            direction: role.sending(),
            cipher: None,
            out: Vec::new(),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Encode for SealedEncoder<W> {
    async fn encode(&mut self, parts: &[&[u8]]) -> io::Result<()> {
        self.out.clear();

        if self.cipher.is_none() {
            let mut salt = [0u8; SALT_LEN];
            random_bytes(&mut salt).map_err(invalid)?;
            self.cipher = Some(stream_cipher(&self.psk, &salt, self.direction)?);
            self.out.extend_from_slice(&salt);
        }

        let Some(cipher) = self.cipher.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::Other, "cipher unavailable"));
        };

        let payload = parts.concat();
        for block in payload.chunks(MAX_BLOCK_SIZE) {
            let mut size = (block.len() as u16).to_be_bytes().to_vec();
            cipher.seal(&mut size).map_err(invalid)?;
            self.out.extend_from_slice(&size);

            let mut sealed = block.to_vec();
            cipher.seal(&mut sealed).map_err(invalid)?;
            self.out.extend_from_slice(&sealed);
        }

        self.inner.write_all(&self.out).await?;
        self.inner.flush().await
    }
}

/// Split `io` into a sealed decoder/encoder pair for `role`
pub fn sealed<T>(
    io: T,
    psk: &[u8; KEY_LEN],
    role: Role,
) -> (SealedDecoder<ReadHalf<T>>, SealedEncoder<WriteHalf<T>>)
where
    T: AsyncRead + AsyncWrite + Send,
{
    let (read_half, write_half) = tokio::io::split(io);
    (
        SealedDecoder::new(read_half, *psk, role),
        SealedEncoder::new(write_half, *psk, role),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_n<D: Decode>(decoder: &mut D, n: usize, chunk: usize) -> Vec<u8> {
        let mut got = Vec::new();
        let mut buf = vec![0u8; chunk];
        while got.len() < n {
            let read = decoder.decode(&mut buf).await.unwrap();
            assert!(read > 0, "unexpected end of stream");
            got.extend_from_slice(&buf[..read]);
        }
        got
    }

    #[tokio::test]
    async fn test_client_to_server() {
        let psk = [9u8; KEY_LEN];
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let (_, mut client_tx) = sealed(client_io, &psk, Role::Client);
        let (mut server_rx, _) = sealed(server_io, &psk, Role::Server);

        let big = vec![0xABu8; MAX_BLOCK_SIZE * 2 + 17];
        client_tx.encode(&[b"hdr", &big]).await.unwrap();
        client_tx.encode(&[b"tail"]).await.unwrap();

        let got = read_n(&mut server_rx, 3 + big.len() + 4, 1000).await;
        assert_eq!(&got[..3], b"hdr");
        assert_eq!(&got[3..3 + big.len()], &big[..]);
        assert_eq!(&got[3 + big.len()..], b"tail");
    }

    #[tokio::test]
    async fn test_wrong_key_rejected() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let (_, mut client_tx) = sealed(client_io, &[1u8; KEY_LEN], Role::Client);
        let (mut server_rx, _) = sealed(server_io, &[2u8; KEY_LEN], Role::Server);

        client_tx.encode(&[b"secret"]).await.unwrap();

        let mut buf = [0u8; 16];
        let err = server_rx.decode(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_clean_eof() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (mut server_rx, _) = sealed(server_io, &[3u8; KEY_LEN], Role::Server);
        drop(client_io);

        let mut buf = [0u8; 16];
        assert_eq!(server_rx.decode(&mut buf).await.unwrap(), 0);
    }
}
