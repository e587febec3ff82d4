//! Event-driven (Immediate) synchronization through real watchers.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use datasync_node::external::{RedundancyProps, StaticExternalData};
use datasync_node::SyncEngine;
use datasync_primitives::{BmcRole, FullSyncStatus, SyncDirection};

mod common;

use common::{
    file_entry, wait_for_terminal_status, wait_until, FsCopyTransfer, RecordingTransfer,
};

fn active() -> Arc<StaticExternalData> {
    Arc::new(StaticExternalData::new(RedundancyProps {
        role: BmcRole::Active,
        redundancy_enabled: true,
    }))
}

#[tokio::test]
async fn source_writes_propagate_to_the_destination() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dest = dir.path().join("dest");
    fs::write(&src, "v1").unwrap();

    let token = CancellationToken::new();
    let (engine, control) = SyncEngine::new(
        vec![file_entry(&src, &dest, SyncDirection::Active2Passive)],
        Arc::new(FsCopyTransfer),
        active(),
        None,
        token.clone(),
    );

    let engine_task = tokio::spawn(engine.run());
    assert_eq!(
        wait_for_terminal_status(&control).await,
        FullSyncStatus::Completed
    );

    fs::write(&src, "v2").unwrap();
    wait_until(|| fs::read_to_string(&dest).map(|c| c == "v2").unwrap_or(false)).await;

    token.cancel();
    engine_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn deleting_the_source_removes_the_destination() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dest = dir.path().join("dest");
    fs::write(&src, "v1").unwrap();

    let token = CancellationToken::new();
    let (engine, control) = SyncEngine::new(
        vec![file_entry(&src, &dest, SyncDirection::Active2Passive)],
        Arc::new(FsCopyTransfer),
        active(),
        None,
        token.clone(),
    );

    let engine_task = tokio::spawn(engine.run());
    assert_eq!(
        wait_for_terminal_status(&control).await,
        FullSyncStatus::Completed
    );
    assert!(dest.exists());

    fs::remove_file(&src).unwrap();
    wait_until(|| !dest.exists()).await;

    token.cancel();
    engine_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn bursts_coalesce_under_single_flight() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dest = dir.path().join("dest");
    fs::write(&src, "v0").unwrap();

    let transfer = Arc::new(RecordingTransfer::new(
        FsCopyTransfer,
        Duration::from_millis(150),
    ));
    let transfer_dyn: Arc<dyn datasync_node::transfer::Transfer> = Arc::clone(&transfer) as _;

    let token = CancellationToken::new();
    let (engine, control) = SyncEngine::new(
        vec![file_entry(&src, &dest, SyncDirection::Active2Passive)],
        transfer_dyn,
        active(),
        None,
        token.clone(),
    );

    let engine_task = tokio::spawn(engine.run());
    assert_eq!(
        wait_for_terminal_status(&control).await,
        FullSyncStatus::Completed
    );
    let after_campaign = transfer.executed();

    // A burst of writes while at most one transfer may be in flight.
    for round in 1..=5 {
        fs::write(&src, format!("v{round}")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    wait_until(|| fs::read_to_string(&dest).map(|c| c == "v5").unwrap_or(false)).await;

    // Five writes landed while a 150 ms transfer was running; the dirty bit
    // must have absorbed most of them.
    let event_driven = transfer.executed() - after_campaign;
    assert!(
        (1..5).contains(&event_driven),
        "expected coalesced transfers, got {event_driven}"
    );

    token.cancel();
    engine_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn rerunning_a_clean_sync_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src");
    let dest = dir.path().join("dest");
    fs::write(&src, "stable").unwrap();

    let token = CancellationToken::new();
    let (engine, control) = SyncEngine::new(
        vec![file_entry(&src, &dest, SyncDirection::Active2Passive)],
        Arc::new(FsCopyTransfer),
        active(),
        None,
        token.clone(),
    );

    let engine_task = tokio::spawn(engine.run());
    assert_eq!(
        wait_for_terminal_status(&control).await,
        FullSyncStatus::Completed
    );

    let before = fs::read(&dest).unwrap();
    assert!(control.trigger_full_sync().await);
    assert_eq!(
        wait_for_terminal_status(&control).await,
        FullSyncStatus::Completed
    );
    assert_eq!(fs::read(&dest).unwrap(), before);

    token.cancel();
    engine_task.await.unwrap().unwrap();
}
