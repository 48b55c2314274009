//! Session lifecycle over loopback TCP: handshake, keep-alive, oversize
//! frames, and orderly shutdown.

mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use bank_bus::codec::{Frame, MuxCodec, MuxItem};
use bank_bus::session::SessionState;
use bank_core::types::wire::{
    FrameKind, HelloPayload, PingPayload, StreamAbortPayload, MAX_FRAME_BYTES, PROTOCOL_VERSION,
};
use bank_core::types::ScopeSet;

use common::{fast_config, public_key, spawn_node, wait_until};

#[tokio::test]
async fn handshake_establishes_a_ready_session() {
    let server = spawn_node(1, &[public_key(2)], fast_config()).await;
    let client = spawn_node(2, &[public_key(1)], fast_config()).await;

    let session = client.node.connect(&server.addr.to_string()).await.unwrap();
    assert_eq!(session.peer_key(), public_key(1));

    let info = session.info().await.unwrap();
    assert_eq!(info.state, SessionState::Ready);
    assert_eq!(info.observed_spend, 0);

    assert!(
        wait_until(Duration::from_secs(3), || async {
            server.node.session_count() == 1
        })
        .await
    );
    assert_eq!(server.node.sessions()[0].peer_key(), public_key(2));
}

#[tokio::test]
async fn untrusted_peer_is_refused() {
    // Server trusts nobody but itself
    let server = spawn_node(3, &[], fast_config()).await;
    let client = spawn_node(4, &[public_key(3)], fast_config()).await;

    let result = client.node.connect(&server.addr.to_string()).await;
    assert!(result.is_err(), "untrusted connect should fail");
    assert_eq!(server.node.session_count(), 0);
}

#[tokio::test]
async fn shutdown_drains_both_sides() {
    let server = spawn_node(5, &[public_key(6)], fast_config()).await;
    let client = spawn_node(6, &[public_key(5)], fast_config()).await;

    let session = client.node.connect(&server.addr.to_string()).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(3), || async {
            server.node.session_count() == 1
        })
        .await
    );

    session.shutdown().await;
    assert!(
        wait_until(Duration::from_secs(10), || async {
            client.node.session_count() == 0 && server.node.session_count() == 0
        })
        .await,
        "both sides should release the session"
    );
    assert!(session.is_closed());
}

/// Scenario: a frame announcing a 16 MiB + 1 payload arrives. The stream
/// is aborted without buffering the payload and the session stays alive.
#[tokio::test]
async fn oversize_frame_aborts_the_stream_but_not_the_session() {
    let server = spawn_node(7, &[public_key(9)], fast_config()).await;

    // Hand-rolled client so we can write a raw oversize header
    let signing = test_utils::test_signing_key(9);
    let capability = test_utils::self_issued_capability(&signing, ScopeSet::all(), 8, 9);
    let mut hello = HelloPayload {
        protocol_version: PROTOCOL_VERSION,
        issuer_key: signing.verifying_key().to_bytes(),
        capability,
        credit_per_stream: 32,
        embedding_dim: 0,
        signature: Vec::new(),
    };
    hello.signature = {
        use ed25519_dalek::Signer;
        signing.sign(&hello.signing_bytes()).to_bytes().to_vec()
    };

    let socket = TcpStream::connect(server.addr).await.unwrap();
    let mut framed = Framed::new(socket, MuxCodec::new(MAX_FRAME_BYTES));
    framed
        .send((0, Frame::new(FrameKind::Hello, &hello).unwrap()))
        .await
        .unwrap();

    // Wait for the server hello
    loop {
        match framed.next().await.unwrap().unwrap() {
            MuxItem::Frame { stream_id: 0, frame } if frame.kind == FrameKind::Hello.code() => {
                break;
            }
            _ => {}
        }
    }

    // Raw header on stream 3 announcing one byte over the cap. The
    // receiver must reject it from the header alone and discard the
    // payload bytes as they trickle in, never buffering them.
    let mut header = Vec::new();
    header.extend_from_slice(&3u32.to_be_bytes());
    header.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
    header.extend_from_slice(&FrameKind::PatternFull.code().to_be_bytes());
    header.extend_from_slice(&0u16.to_be_bytes());
    framed.get_mut().write_all(&header).await.unwrap();
    let filler = vec![0u8; 1024 * 1024];
    for _ in 0..16 {
        framed.get_mut().write_all(&filler).await.unwrap();
    }
    framed.get_mut().write_all(&[0u8]).await.unwrap();
    framed.get_mut().flush().await.unwrap();

    // Expect a StreamAbort for stream 3 with the frame-too-large reason
    let abort = loop {
        match framed.next().await.unwrap().unwrap() {
            MuxItem::Frame { stream_id: 0, frame }
                if frame.kind == FrameKind::StreamAbort.code() =>
            {
                break frame.decode::<StreamAbortPayload>().unwrap();
            }
            MuxItem::Frame { stream_id: 0, frame } if frame.kind == FrameKind::Ping.code() => {
                let ping: PingPayload = frame.decode().unwrap();
                framed
                    .send((0, Frame::new(FrameKind::Pong, &ping).unwrap()))
                    .await
                    .unwrap();
            }
            _ => {}
        }
    };
    assert_eq!(abort.stream_id, 3);
    assert_eq!(abort.reason, "frame_too_large");

    // Session is still alive: ping gets a pong
    framed
        .send((0, Frame::new(FrameKind::Ping, &PingPayload { seq: 77 }).unwrap()))
        .await
        .unwrap();
    let pong = loop {
        match framed.next().await.unwrap().unwrap() {
            MuxItem::Frame { stream_id: 0, frame } if frame.kind == FrameKind::Pong.code() => {
                break frame.decode::<PingPayload>().unwrap();
            }
            MuxItem::Frame { stream_id: 0, frame } if frame.kind == FrameKind::Ping.code() => {
                let ping: PingPayload = frame.decode().unwrap();
                framed
                    .send((0, Frame::new(FrameKind::Pong, &ping).unwrap()))
                    .await
                    .unwrap();
            }
            _ => {}
        }
    };
    assert_eq!(pong.seq, 77);
    assert_eq!(server.node.session_count(), 1);
}
