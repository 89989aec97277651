//! Quorum write tests: acknowledgment gating, broken-quorum detection when
//! a replica dies mid-wait, and convergence after the failure.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{make_replica, part_names, SYNC};
use timberline::coordination::MemoryCoordination;
use timberline::engine::InsertOutcome;
use timberline::part::Block;
use timberline::Error;

#[tokio::test]
async fn test_quorum_insert_acknowledged_after_confirmations() -> anyhow::Result<()> {
    let coord = MemoryCoordination::new();
    let (r1, s1) = make_replica(&coord, "r1").await;
    let (r2, s2) = make_replica(&coord, "r2").await;

    let writer = Arc::clone(&r1);
    let insert = tokio::spawn(async move {
        writer
            .insert(Block::new("p", vec![json!({"id": 1})]), Some(2))
            .await
    });

    // The confirmation arrives when r2 durably installs the part
    tokio::time::sleep(Duration::from_millis(50)).await;
    r2.sync_queue(SYNC).await?;

    let outcome = insert.await??;
    assert!(matches!(outcome, InsertOutcome::Inserted { .. }));

    r1.sync_queue(SYNC).await?;
    assert_eq!(part_names(&s1).await, part_names(&s2).await);
    Ok(())
}

#[tokio::test]
async fn test_quorum_breaks_when_replica_dies_mid_wait() -> anyhow::Result<()> {
    let coord = MemoryCoordination::new();
    let (r1, s1) = make_replica(&coord, "r1").await;
    let (r2, s2) = make_replica(&coord, "r2").await;
    let (r3, s3) = make_replica(&coord, "r3").await;

    let writer = Arc::clone(&r1);
    let insert = tokio::spawn(async move {
        writer
            .insert(Block::new("p", vec![json!({"id": 1})]), Some(3))
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    r2.sync_queue(SYNC).await?;

    // r3 dies before confirming; two candidates cannot reach quorum 3, so
    // the insert fails well before its timeout
    let started = tokio::time::Instant::now();
    coord.expire_session(2);
    let err = insert.await?.unwrap_err();
    assert!(matches!(
        err,
        Error::QuorumBroken { required: 3, .. }
    ));
    assert!(started.elapsed() < Duration::from_secs(4));

    // The data is committed locally regardless and converges once the dead
    // replica recovers; the recovered replica never produces a duplicate
    r3.reinitialize().await?;
    r1.sync_queue(SYNC).await?;
    r3.sync_queue(SYNC).await?;
    let expected = part_names(&s1).await;
    assert_eq!(expected.len(), 1);
    assert_eq!(part_names(&s2).await, expected);
    assert_eq!(part_names(&s3).await, expected);
    Ok(())
}

#[tokio::test]
async fn test_quorum_rejected_without_enough_active_replicas() -> anyhow::Result<()> {
    let coord = MemoryCoordination::new();
    let (r1, _s1) = make_replica(&coord, "r1").await;
    let (_r2, _s2) = make_replica(&coord, "r2").await;

    let err = r1
        .insert(Block::new("p", vec![json!({"id": 1})]), Some(3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuorumBroken { required: 3, .. }));
    Ok(())
}

#[tokio::test]
async fn test_default_quorum_of_one_never_blocks() -> anyhow::Result<()> {
    let coord = MemoryCoordination::new();
    let (r1, _s1) = make_replica(&coord, "r1").await;

    let outcome = r1
        .insert(Block::new("p", vec![json!({"id": 1})]), Some(1))
        .await?;
    assert!(matches!(outcome, InsertOutcome::Inserted { .. }));
    Ok(())
}
