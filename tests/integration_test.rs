//! Integration tests for Shroud
//!
//! Drives full sessions over in-memory connections:
//! - Sealed records between client and server
//! - Channel multiplexing and request dispatch
//! - Connect requests relayed to a real TCP upstream

use shroud::codec::{sealed, Decode, Encode, Role, SealedDecoder, SealedEncoder};
use shroud::config::{ConnectConfig, MuxConfig, PoolConfig};
use shroud::crypto::{generate_key, KEY_LEN};
use shroud::deadline::Scheduler;
use shroud::fsm::{Connect, Requests, Response, CONNECT_REQUEST};
use shroud::pool::{Pool, PoolHandle};
use shroud::session::Session;
use shroud::transport::TcpDialer;
use shroud::tunnel::{encode_frame, FrameHeader, MuxError, Multiplexer, FRAME_HEADER_SIZE};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::Span;

/// Client end of a sealed connection, speaking raw frames
struct Client {
    decoder: SealedDecoder<ReadHalf<DuplexStream>>,
    encoder: SealedEncoder<WriteHalf<DuplexStream>>,
}

impl Client {
    async fn send(&mut self, channel: u8, segment: &[u8]) {
        let frame = encode_frame(channel, segment).unwrap();
        self.encoder.encode(&[&frame]).await.unwrap();
    }

    async fn read_exact(&mut self, buf: &mut [u8]) {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.decoder.decode(&mut buf[filled..]).await.unwrap();
            assert!(n > 0, "server closed the connection");
            filled += n;
        }
    }

    async fn recv(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.read_exact(&mut header).await;
        let header = FrameHeader::decode(header);

        let mut segment = vec![0u8; header.length as usize];
        self.read_exact(&mut segment).await;
        (header.channel, segment)
    }

    async fn recv_timeout(&mut self) -> (u8, Vec<u8>) {
        tokio::time::timeout(Duration::from_secs(5), self.recv())
            .await
            .expect("no frame from server")
    }
}

struct Server {
    session: JoinHandle<Result<(), MuxError>>,
    runner: PoolHandle,
}

/// Start a server session on one end of an in-memory pipe
fn start(server_psk: [u8; KEY_LEN], client_psk: [u8; KEY_LEN], connect: ConnectConfig) -> (Client, Server) {
    let requester = Scheduler::new(Duration::from_millis(20), 1024).serve().unwrap();
    let pool = Pool::new(
        PoolConfig {
            min_workers: 2,
            max_workers: 16,
            ..PoolConfig::default()
        },
        requester.clone(),
    );
    let runner = pool.serve().unwrap();

    let mut requests = Requests::new();
    requests.register(Connect::new(Arc::new(TcpDialer::new()), connect).with_runner(runner.clone()));

    let (client_io, server_io) = tokio::io::duplex(256 * 1024);

    let (decoder, encoder) = sealed(server_io, &server_psk, Role::Server);
    let mux = Multiplexer::new(decoder, encoder, requester, &MuxConfig::default());
    let session = Session::new(mux, Arc::new(requests), Some(runner.clone()), Span::none()).unwrap();

    let (decoder, encoder) = sealed(client_io, &client_psk, Role::Client);
    (
        Client { decoder, encoder },
        Server {
            session: tokio::spawn(session.run()),
            runner,
        },
    )
}

fn open_relays() -> ConnectConfig {
    ConnectConfig {
        no_local_access: false,
        ..ConnectConfig::default()
    }
}

fn connect_request(addr: SocketAddrV4, timeout: u8) -> Vec<u8> {
    let mut request = vec![CONNECT_REQUEST];
    request.extend_from_slice(&addr.ip().octets());
    request.extend_from_slice(&addr.port().to_be_bytes());
    request.push(timeout);
    request
}

/// Echo server accepting any number of connections
async fn echo_server() -> SocketAddrV4 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        other => panic!("unexpected address {}", other),
    };

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Connect, relay a payload through an echo upstream and close
#[tokio::test]
async fn test_connect_relay_over_sealed_session() {
    let psk = generate_key().unwrap();
    let (mut client, server) = start(psk, psk, open_relays());
    let upstream = echo_server().await;

    client.send(1, &connect_request(upstream, 5)).await;
    assert_eq!(client.recv_timeout().await, (1, vec![Response::Ok.as_byte()]));

    client.send(1, b"hello through the tunnel").await;
    let mut echoed = Vec::new();
    while echoed.len() < 24 {
        let (channel, segment) = client.recv_timeout().await;
        assert_eq!(channel, 1);
        echoed.extend_from_slice(&segment);
    }
    assert_eq!(echoed, b"hello through the tunnel");

    // Half-close: the upstream sees EOF, closes, and the pump ends the channel
    client.send(1, &[]).await;
    assert_eq!(client.recv_timeout().await, (1, Vec::new()));

    drop(client);
    server.session.await.unwrap().unwrap();
    server.runner.close().await.unwrap();
}

/// Payloads larger than one sealed block and one frame survive intact
#[tokio::test]
async fn test_large_relay_transfer() {
    let psk = generate_key().unwrap();
    let (mut client, server) = start(psk, psk, open_relays());
    let upstream = echo_server().await;

    client.send(4, &connect_request(upstream, 5)).await;
    assert_eq!(client.recv_timeout().await, (4, vec![Response::Ok.as_byte()]));

    let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 253) as u8).collect();
    for chunk in payload.chunks(60_000) {
        client.send(4, chunk).await;
    }

    let mut echoed = Vec::new();
    while echoed.len() < payload.len() {
        let (channel, segment) = client.recv_timeout().await;
        assert_eq!(channel, 4);
        assert!(!segment.is_empty(), "relay closed early");
        echoed.extend_from_slice(&segment);
    }
    assert_eq!(echoed, payload);

    drop(client);
    server.session.await.unwrap().unwrap();
    server.runner.close().await.unwrap();
}

/// Several channels relay independently over one connection
#[tokio::test]
async fn test_concurrent_channels() {
    let psk = generate_key().unwrap();
    let (mut client, server) = start(psk, psk, open_relays());
    let upstream = echo_server().await;

    let channels = [0u8, 3, 7, 15];
    for &channel in &channels {
        client.send(channel, &connect_request(upstream, 5)).await;
    }

    let mut ready = Vec::new();
    while ready.len() < channels.len() {
        let (channel, segment) = client.recv_timeout().await;
        assert_eq!(segment, vec![Response::Ok.as_byte()]);
        ready.push(channel);
    }
    ready.sort_unstable();
    assert_eq!(ready, channels);

    for &channel in &channels {
        client.send(channel, &[b'#', channel]).await;
    }

    let mut echoed = std::collections::HashMap::new();
    while echoed.values().map(|v: &Vec<u8>| v.len()).sum::<usize>() < 2 * channels.len() {
        let (channel, segment) = client.recv_timeout().await;
        echoed.entry(channel).or_insert_with(Vec::new).extend_from_slice(&segment);
    }
    for &channel in &channels {
        assert_eq!(echoed[&channel], vec![b'#', channel]);
    }

    drop(client);
    server.session.await.unwrap().unwrap();
    server.runner.close().await.unwrap();
}

/// A zero timeout byte is refused without dialing
#[tokio::test]
async fn test_zero_timeout_bad_request() {
    let psk = generate_key().unwrap();
    let (mut client, server) = start(psk, psk, open_relays());
    let upstream = echo_server().await;

    client.send(2, &connect_request(upstream, 0)).await;
    assert_eq!(
        client.recv_timeout().await,
        (2, vec![Response::BadRequest.as_byte()])
    );

    // The channel is reusable afterwards
    client.send(2, &connect_request(upstream, 5)).await;
    assert_eq!(client.recv_timeout().await, (2, vec![Response::Ok.as_byte()]));

    drop(client);
    server.session.await.unwrap().unwrap();
    server.runner.close().await.unwrap();
}

/// Loopback destinations are refused by default
#[tokio::test]
async fn test_local_access_denied() {
    let psk = generate_key().unwrap();
    let (mut client, server) = start(psk, psk, ConnectConfig::default());
    let upstream = echo_server().await;

    client.send(1, &connect_request(upstream, 5)).await;
    assert_eq!(
        client.recv_timeout().await,
        (1, vec![Response::AccessDenied.as_byte()])
    );

    drop(client);
    server.session.await.unwrap().unwrap();
    server.runner.close().await.unwrap();
}

/// Unreachable destinations answer DIAL_FAILED
#[tokio::test]
async fn test_dial_failed() {
    let psk = generate_key().unwrap();
    let (mut client, server) = start(psk, psk, open_relays());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = match listener.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        other => panic!("unexpected address {}", other),
    };
    drop(listener);

    client.send(9, &connect_request(closed, 2)).await;
    assert_eq!(
        client.recv_timeout().await,
        (9, vec![Response::DialFailed.as_byte()])
    );

    drop(client);
    server.session.await.unwrap().unwrap();
    server.runner.close().await.unwrap();
}

/// A peer holding the wrong key cannot drive the session
#[tokio::test]
async fn test_wrong_psk_ends_session() {
    let server_psk = generate_key().unwrap();
    let client_psk = generate_key().unwrap();
    let (mut client, server) = start(server_psk, client_psk, open_relays());

    client.send(0, &[CONNECT_REQUEST, 1, 1, 1, 1, 0, 80, 5]).await;

    let ended = tokio::time::timeout(Duration::from_secs(5), server.session)
        .await
        .expect("session should end on a forged record")
        .unwrap();
    assert!(matches!(ended, Err(MuxError::Io(_))));

    server.runner.close().await.unwrap();
}
