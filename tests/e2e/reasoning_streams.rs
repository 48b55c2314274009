//! Reasoning streams relay opaque data in strict order; ordering across
//! streams on the same session is deliberately unpromised.

mod common;

use std::time::Duration;

use tokio::sync::mpsc;

use bank_bus::codec::Frame;
use bank_bus::reasoning::ReasoningEvent;
use bank_core::storage::PatternStore;
use bank_core::types::wire::{FrameKind, ReasoningChunkPayload, ReasoningKind};

use common::{fast_config, public_key, spawn_node, wait_until};

#[tokio::test]
async fn chunks_arrive_in_order_alongside_pattern_sync() {
    let server = spawn_node(41, &[public_key(42)], fast_config()).await;
    let client = spawn_node(42, &[public_key(41)], fast_config()).await;

    let (sink_tx, mut sink_rx) = mpsc::channel(64);
    server.node.set_reasoning_sink(sink_tx);

    // Pattern X rides the pattern-sync stream via gossip while the
    // reasoning stream runs
    let x = test_utils::test_pattern("pattern X", "mixed", "alpha", 3, 8);
    client.store.insert(x.clone()).await.unwrap();

    let session = client.node.connect(&server.addr.to_string()).await.unwrap();
    let stream = session
        .open_reasoning(ReasoningKind::Tokens, "live tokens")
        .await
        .unwrap();

    for token in [b"A".to_vec(), b"B".to_vec(), b"C".to_vec()] {
        stream
            .send(
                Frame::new(FrameKind::ReasoningChunk, &ReasoningChunkPayload { data: token })
                    .unwrap(),
            )
            .await
            .unwrap();
    }
    stream
        .send(Frame::new(FrameKind::ReasoningEnd, &()).unwrap())
        .await
        .unwrap();

    // Opened, then A, B, C, then Ended, in exactly that order
    let opened = sink_rx.recv().await.expect("opened event");
    match opened {
        ReasoningEvent::Opened { sub_kind, label, .. } => {
            assert_eq!(sub_kind, ReasoningKind::Tokens);
            assert_eq!(label, "live tokens");
        }
        other => panic!("expected Opened, got {other:?}"),
    }
    for expected in [b"A", b"B", b"C"] {
        match sink_rx.recv().await.expect("chunk event") {
            ReasoningEvent::Chunk { data, .. } => assert_eq!(data.as_ref(), expected),
            other => panic!("expected Chunk, got {other:?}"),
        }
    }
    assert!(matches!(
        sink_rx.recv().await.expect("ended event"),
        ReasoningEvent::Ended { .. }
    ));

    // Pattern X landed via the pattern-sync stream
    assert!(
        wait_until(Duration::from_secs(10), || async {
            server.store.get(x.id).await.is_ok()
        })
        .await,
        "pattern X should arrive through gossip"
    );
}

/// Boundary: a sender that fills the receiver's credit exactly blocks on
/// the next frame (no loss, no error) and resumes once the receiver
/// catches up and grants more credit.
#[tokio::test]
async fn exhausted_credit_blocks_the_sender_until_granted() {
    let mut server_config = fast_config();
    server_config.bus.credit_per_stream = 2;
    let server = spawn_node(45, &[public_key(46)], server_config).await;
    let client = spawn_node(46, &[public_key(45)], fast_config()).await;

    // Tiny sink that we deliberately do not drain
    let (sink_tx, mut sink_rx) = mpsc::channel(1);
    server.node.set_reasoning_sink(sink_tx);

    let session = client.node.connect(&server.addr.to_string()).await.unwrap();
    let stream = session
        .open_reasoning(ReasoningKind::Tokens, "throttled")
        .await
        .unwrap();

    let chunk = || {
        Frame::new(
            FrameKind::ReasoningChunk,
            &ReasoningChunkPayload { data: b"x".to_vec() },
        )
        .unwrap()
    };

    // The receiver stalls on its full sink, so grants dry up and one of
    // the early sends leaves the sender at zero credit
    let mut blocked_at = None;
    for i in 0..8u32 {
        match tokio::time::timeout(Duration::from_millis(800), stream.send(chunk())).await {
            Ok(result) => result.unwrap(),
            Err(_) => {
                blocked_at = Some(i);
                break;
            }
        }
    }
    let blocked_at = blocked_at.expect("sender should block once credit is exhausted");
    assert_eq!(stream.available_credit(), 0);

    // Draining the sink lets the handler consume, which grants credit and
    // unblocks the sender; every frame sent so far is accounted for
    let mut delivered = 0u32;
    let drained = tokio::spawn(async move {
        let mut count = 0u32;
        while let Some(event) = sink_rx.recv().await {
            if matches!(event, ReasoningEvent::Chunk { .. }) {
                count += 1;
            }
            if count >= blocked_at {
                break;
            }
        }
        count
    });
    tokio::time::timeout(Duration::from_secs(5), stream.send(chunk()))
        .await
        .expect("send should unblock after credit is granted")
        .unwrap();
    delivered += drained.await.unwrap();
    assert!(delivered >= blocked_at, "no frame was lost under backpressure");
}

#[tokio::test]
async fn reasoning_requires_the_scope() {
    use bank_core::types::{Scope, ScopeSet};

    let server = spawn_node(43, &[public_key(44)], fast_config()).await;
    let client = spawn_node(44, &[public_key(43)], fast_config()).await;

    let (sink_tx, mut sink_rx) = mpsc::channel(8);
    server.node.set_reasoning_sink(sink_tx);

    // Capability without stream_reasoning
    let signing = test_utils::test_signing_key(44);
    let capability = test_utils::self_issued_capability(
        &signing,
        ScopeSet::empty().with(Scope::Gossip),
        0,
        99,
    );
    let session = client
        .node
        .connect_with(&server.addr.to_string(), Some(capability))
        .await
        .unwrap();

    let stream = session
        .open_reasoning(ReasoningKind::Trace, "refused")
        .await
        .unwrap();
    let _ = stream
        .send(
            Frame::new(
                FrameKind::ReasoningChunk,
                &ReasoningChunkPayload { data: b"nope".to_vec() },
            )
            .unwrap(),
        )
        .await;

    // The receiver refuses the stream; no event ever reaches the sink
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(sink_rx.try_recv().is_err(), "no reasoning events expected");
}
