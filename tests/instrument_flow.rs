//! End-to-end driver flows against a mock instrument.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use chromalink::codec::color::{encode_response, OP_IDENTIFY, OP_MEASURE};
use chromalink::codec::{ChecksumMode, ColorCodec};
use chromalink::device::DeviceError;
use chromalink::transport::{TcpTransport, Transport};
use chromalink::{CrInstrument, PtsInstrument};

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.push(s.len() as u8);
    buf.extend_from_slice(s.as_bytes());
}

fn identity_payload() -> Vec<u8> {
    let mut buf = Vec::new();
    push_str(&mut buf, "CR-10");
    push_str(&mut buf, "CR10-Plus");
    push_str(&mut buf, "2.4.1");
    push_str(&mut buf, "WB-INT-0042");
    push_str(&mut buf, "WB-EXT-0007");
    buf.extend_from_slice(&1000u16.to_be_bytes());
    buf.extend_from_slice(&12u16.to_be_bytes());
    buf.extend_from_slice(&87u16.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.push(1);
    buf.push(1);
    buf
}

fn measurement_payload(sample_id: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&sample_id.to_be_bytes());
    push_str(&mut buf, "Sample A");
    push_str(&mut buf, "Plastic");
    push_str(&mut buf, "D65/10");
    let values = [31.5f32, 42.25, 0.125];
    buf.extend_from_slice(&(values.len() as u16).to_be_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_be_bytes());
    }
    buf
}

/// Mock instrument: answers identify and measurement requests with
/// well-formed frames. `identify_ack` lets tests simulate a rejected
/// handshake.
async fn instrument_server(identify_ack: u8) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 256];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) if n >= 3 => {
                            let response = match buf[2] {
                                OP_IDENTIFY => {
                                    encode_response(OP_IDENTIFY, identify_ack, &identity_payload())
                                }
                                OP_MEASURE => {
                                    encode_response(OP_MEASURE, 0, &measurement_payload(77))
                                }
                                other => encode_response(other, 1, &[]),
                            };
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

fn transport_for(addr: SocketAddr) -> Arc<TcpTransport> {
    Arc::new(TcpTransport::new(
        "127.0.0.1",
        addr.port(),
        Arc::new(ColorCodec::new(ChecksumMode::Strict)),
    ))
}

#[tokio::test]
async fn test_cr_connect_handshake_and_measure() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let addr = instrument_server(0).await;
    let transport = transport_for(addr);
    let instrument = CrInstrument::new(transport.clone());

    let identity = instrument.connect().await?;
    assert_eq!(identity.name, "CR-10");
    assert_eq!(identity.internal_whiteboard_sn, "WB-INT-0042");
    assert_eq!(identity.stored_sample_count, 87);
    assert!(transport.is_connected().await);
    assert_eq!(instrument.identity().await, Some(identity.clone()));

    let result = instrument.run_measurement(CancellationToken::new()).await?;
    assert_eq!(result.sample_id, 77);
    assert_eq!(result.name, "Sample A");
    assert_eq!(result.instrument_serial, identity.internal_whiteboard_sn);
    assert_eq!(result.values, [31.5, 42.25, 0.125]);

    instrument.disconnect().await?;
    assert!(instrument.identity().await.is_none());
    assert!(!transport.is_connected().await);
    Ok(())
}

#[tokio::test]
async fn test_rejected_handshake_tears_the_transport_down() {
    let addr = instrument_server(2).await;
    let transport = transport_for(addr);
    let instrument = CrInstrument::new(transport.clone());

    let err = instrument.connect().await.unwrap_err();
    assert!(matches!(err, DeviceError::HandshakeFailed(_)));
    // A transport-level connection without a valid handshake is not a
    // connection
    assert!(!transport.is_connected().await);
}

#[tokio::test]
async fn test_measurement_without_handshake_fails() {
    let addr = instrument_server(0).await;
    let instrument = CrInstrument::new(transport_for(addr));
    let err = instrument
        .run_measurement(CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DeviceError::MeasurementFailed(_)));
}

#[tokio::test]
async fn test_pts_streaming_fans_out_measurement_frames() {
    let addr = instrument_server(0).await;
    let transport = transport_for(addr);
    let instrument = PtsInstrument::new(transport.clone());
    instrument.connect().await.unwrap();

    let mut rx_a = instrument.subscribe_measurements();
    let mut rx_b = instrument.subscribe_measurements();
    let cancel = CancellationToken::new();
    instrument.start_streaming(cancel.clone()).await.unwrap();

    // Unsolicited measurement frames arrive over the raw frame channel;
    // the mock replies to a plain send as well
    let request = chromalink::codec::color::encode_request(OP_MEASURE, &[]);
    transport.send(&request).await.unwrap();

    let a = tokio::time::timeout(Duration::from_secs(5), rx_a.recv())
        .await
        .unwrap()
        .unwrap();
    let b = tokio::time::timeout(Duration::from_secs(5), rx_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.sample_id, 77);
    assert_eq!(b.sample_id, 77);
    assert_eq!(a.instrument_serial, "WB-INT-0042");

    cancel.cancel();
    instrument.stop_streaming().await;
    instrument.disconnect().await.unwrap();
}
