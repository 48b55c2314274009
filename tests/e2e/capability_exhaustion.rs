//! Scenario: a peer holding `write_patterns` with `spend_cap = 2` pushes
//! three full patterns. The first two commit, the third closes the stream
//! with `spend_exhausted`, and the session stays in `Ready`.

mod common;

use std::time::Duration;

use bank_bus::codec::Frame;
use bank_bus::session::SessionState;
use bank_core::storage::PatternStore;
use bank_core::types::wire::{FrameKind, PatternFullPayload};
use bank_core::types::{Scope, ScopeSet};

use common::{fast_config, public_key, spawn_node, wait_until};

#[tokio::test]
async fn third_write_exhausts_the_spend_cap() {
    let server = spawn_node(11, &[public_key(12)], fast_config()).await;
    let client = spawn_node(12, &[public_key(11)], fast_config()).await;

    let signing = test_utils::test_signing_key(12);
    let capability = test_utils::self_issued_capability(
        &signing,
        ScopeSet::empty()
            .with(Scope::WritePatterns)
            .with(Scope::Gossip),
        2,
        42,
    );
    let session = client
        .node
        .connect_with(&server.addr.to_string(), Some(capability))
        .await
        .unwrap();

    let out = session.open_pattern_sync().await.unwrap();
    for seed in 0..3u64 {
        let pattern = test_utils::completed_pattern(
            &format!("pushed {seed}"),
            "push",
            "direct",
            seed,
            8,
            true,
            0.9,
        );
        out.send(Frame::new(FrameKind::PatternFull, &PatternFullPayload { pattern }).unwrap())
            .await
            .unwrap();
    }

    // Exactly two commit; the third hits the cap
    assert!(
        wait_until(Duration::from_secs(5), || async {
            server.store.pattern_count().await.unwrap() == 2
        })
        .await,
        "first two writes should commit"
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.store.pattern_count().await.unwrap(), 2);

    // The session survives the aborted stream on both sides
    let server_session = server.node.sessions().pop().expect("server session");
    let info = server_session.info().await.unwrap();
    assert_eq!(info.state, SessionState::Ready);
    assert_eq!(info.observed_spend, 2);
    assert_eq!(session.info().await.unwrap().state, SessionState::Ready);
}
