//! Request/response correlation against an in-process TCP peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use chromalink::codec::color::encode_response;
use chromalink::codec::{ChecksumMode, ColorCodec};
use chromalink::transport::{TcpTransport, Transport, TransportError};

/// Accepts connections and swallows everything without ever replying.
async fn silent_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            });
        }
    });
    addr
}

/// Replies to every request with a fixed frame for the request's opcode.
async fn echo_server(ack: u8, payload: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let payload = payload.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) if n >= 3 => {
                            let response = encode_response(buf[2], ack, &payload);
                            if socket.write_all(&response).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                    }
                }
            });
        }
    });
    addr
}

fn transport_for(addr: SocketAddr) -> TcpTransport {
    TcpTransport::new(
        "127.0.0.1",
        addr.port(),
        Arc::new(ColorCodec::new(ChecksumMode::Lenient)),
    )
}

#[tokio::test]
async fn test_matching_response_resolves_request() {
    let addr = echo_server(0, vec![0x10, 0x20]).await;
    let transport = transport_for(addr);
    transport.connect().await.unwrap();

    let frame = transport
        .send_and_receive(0xA1, &[], Duration::from_secs(2), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(frame.opcode, 0xA1);
    assert_eq!(frame.status, 0);
    assert_eq!(frame.payload, [0x10, 0x20]);
}

#[tokio::test]
async fn test_timeout_frees_the_guard_immediately() {
    let addr = silent_server().await;
    let transport = transport_for(addr);
    transport.connect().await.unwrap();

    let err = transport
        .send_and_receive(0xA1, &[], Duration::from_millis(100), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::RequestTimeout));

    // The slot must be free: the follow-up call times out again rather
    // than failing with RequestInProgress
    let err = transport
        .send_and_receive(0xA1, &[], Duration::from_millis(100), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::RequestTimeout));
}

#[tokio::test]
async fn test_concurrent_request_fails_fast() {
    let addr = silent_server().await;
    let transport = Arc::new(transport_for(addr));
    transport.connect().await.unwrap();

    let first = {
        let transport = transport.clone();
        tokio::spawn(async move {
            transport
                .send_and_receive(0xA1, &[], Duration::from_secs(2), CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    let err = transport
        .send_and_receive(0xA6, &[], Duration::from_secs(2), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::RequestInProgress));
    // Fail fast, no queueing behind the outstanding request
    assert!(started.elapsed() < Duration::from_millis(500));

    let first = first.await.unwrap().unwrap_err();
    assert!(matches!(first, TransportError::RequestTimeout));
}

#[tokio::test]
async fn test_cancellation_resolves_and_frees_the_guard() {
    let addr = silent_server().await;
    let transport = transport_for(addr);
    transport.connect().await.unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = transport
        .send_and_receive(0xA1, &[], Duration::from_secs(5), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Cancelled));

    let err = transport
        .send_and_receive(0xA1, &[], Duration::from_millis(100), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::RequestTimeout));
}
