//! End-to-end delivery scenarios against in-memory collaborators.

use std::sync::Arc;

use scriptdrop::config::DeliveryConfig;
use scriptdrop::delivery::{DeliveryPipeline, MembershipOracle};
use scriptdrop::error::{DeliveryError, DeliveryStage};
use scriptdrop::storage::{BalanceStore, NewScript, ScriptStore};
use scriptdrop::test_support::{MemoryStore, RecordingTransport, StalledOracle, StaticOracle};
use tempfile::TempDir;
use uuid::Uuid;

const USER: &str = "7";
const PRICE: i64 = 5;

fn settings(staging: &TempDir) -> DeliveryConfig {
    DeliveryConfig {
        price_coins: PRICE,
        channel: "@fixture".to_string(),
        staging_dir: staging.path().to_path_buf(),
        call_timeout_secs: 5,
    }
}

fn pipeline(
    store: &Arc<MemoryStore>,
    oracle: impl MembershipOracle + 'static,
    transport: &Arc<RecordingTransport>,
    staging: &TempDir,
) -> DeliveryPipeline {
    DeliveryPipeline::new(
        store.clone(),
        store.clone(),
        Arc::new(oracle),
        transport.clone(),
        &settings(staging),
    )
}

async fn seeded_script(store: &MemoryStore, enabled: bool) -> Uuid {
    store
        .create_script(NewScript {
            name: "AIO Config".to_string(),
            filename: "aio.conf".to_string(),
            description: "fixture".to_string(),
            content: "server=127.0.0.1\nport=9".to_string(),
            enabled,
        })
        .await
        .unwrap()
        .id
}

fn staging_is_empty(staging: &TempDir) -> bool {
    std::fs::read_dir(staging.path())
        .map(|entries| entries.count() == 0)
        .unwrap_or(true)
}

#[tokio::test]
async fn successful_delivery_debits_and_bumps_counter() {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    store.credit(USER, 10).await.unwrap();
    let script_id = seeded_script(&store, true).await;

    let pipeline = pipeline(&store, StaticOracle::member(), &transport, &staging);
    let receipt = pipeline.deliver(USER, script_id).await.unwrap();

    assert_eq!(receipt.new_balance, 5);
    assert_eq!(receipt.price, PRICE);
    assert_eq!(store.balance(USER).await.unwrap(), 5);

    let script = store.get_script(script_id).await.unwrap().unwrap();
    assert_eq!(script.downloads, 1);

    let sent = transport.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].user_id, USER);
    assert_eq!(sent[0].filename, "aio.conf");
    assert!(sent[0].existed_at_send);

    // Staged copy cleaned up after the send.
    assert!(staging_is_empty(&staging));
}

#[tokio::test]
async fn missing_script_refunds_the_debit() {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    store.credit(USER, 10).await.unwrap();

    let pipeline = pipeline(&store, StaticOracle::member(), &transport, &staging);
    let err = pipeline.deliver(USER, Uuid::new_v4()).await.unwrap_err();

    assert!(matches!(err, DeliveryError::ScriptNotFound { .. }));
    assert_eq!(err.stage(), DeliveryStage::Lookup);
    assert!(err.refunded());
    assert_eq!(store.balance(USER).await.unwrap(), 10);
}

#[tokio::test]
async fn disabled_script_is_invisible_to_delivery() {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    store.credit(USER, 10).await.unwrap();
    let script_id = seeded_script(&store, false).await;

    let pipeline = pipeline(&store, StaticOracle::member(), &transport, &staging);
    let err = pipeline.deliver(USER, script_id).await.unwrap_err();

    assert!(matches!(err, DeliveryError::ScriptNotFound { .. }));
    assert_eq!(store.balance(USER).await.unwrap(), 10);
}

#[tokio::test]
async fn non_member_is_never_charged() {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    store.credit(USER, 10).await.unwrap();
    let script_id = seeded_script(&store, true).await;

    let pipeline = pipeline(&store, StaticOracle::non_member(), &transport, &staging);
    let err = pipeline.deliver(USER, script_id).await.unwrap_err();

    assert!(matches!(err, DeliveryError::NotAMember { .. }));
    assert_eq!(err.stage(), DeliveryStage::MembershipCheck);
    assert!(!err.refunded());
    assert_eq!(store.balance(USER).await.unwrap(), 10);
    assert!(transport.sent.lock().is_empty());
    assert!(staging_is_empty(&staging));

    let script = store.get_script(script_id).await.unwrap().unwrap();
    assert_eq!(script.downloads, 0);
}

#[tokio::test]
async fn oracle_error_is_a_membership_failure() {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    store.credit(USER, 10).await.unwrap();
    let script_id = seeded_script(&store, true).await;

    let pipeline = pipeline(&store, StaticOracle::failing("api down"), &transport, &staging);
    let err = pipeline.deliver(USER, script_id).await.unwrap_err();

    assert!(matches!(err, DeliveryError::MembershipUnavailable { .. }));
    assert!(!err.refunded());
    assert_eq!(store.balance(USER).await.unwrap(), 10);
}

#[tokio::test(start_paused = true)]
async fn oracle_timeout_takes_the_failure_path() {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    store.credit(USER, 10).await.unwrap();
    let script_id = seeded_script(&store, true).await;

    let pipeline = pipeline(&store, StalledOracle, &transport, &staging);
    let err = pipeline.deliver(USER, script_id).await.unwrap_err();

    match err {
        DeliveryError::MembershipUnavailable { reason } => {
            assert!(reason.contains("timed out"));
        }
        other => panic!("expected MembershipUnavailable, got {:?}", other),
    }
    assert_eq!(store.balance(USER).await.unwrap(), 10);
}

#[tokio::test]
async fn insufficient_balance_stops_before_any_side_effect() {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    store.credit(USER, 3).await.unwrap();
    let script_id = seeded_script(&store, true).await;

    let pipeline = pipeline(&store, StaticOracle::member(), &transport, &staging);
    let err = pipeline.deliver(USER, script_id).await.unwrap_err();

    match err {
        DeliveryError::InsufficientBalance { balance, price } => {
            assert_eq!(balance, 3);
            assert_eq!(price, PRICE);
        }
        other => panic!("expected InsufficientBalance, got {:?}", other),
    }
    assert_eq!(store.balance(USER).await.unwrap(), 3);
    assert!(transport.sent.lock().is_empty());
    assert!(staging_is_empty(&staging));
}

#[tokio::test]
async fn transport_failure_refunds_and_removes_staged_file() {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::failing("bot api 502"));
    store.credit(USER, 10).await.unwrap();
    let script_id = seeded_script(&store, true).await;

    let pipeline = pipeline(&store, StaticOracle::member(), &transport, &staging);
    let err = pipeline.deliver(USER, script_id).await.unwrap_err();

    assert!(matches!(err, DeliveryError::DeliveryFailed { .. }));
    assert_eq!(err.stage(), DeliveryStage::Deliver);
    assert!(err.refunded());
    assert_eq!(store.balance(USER).await.unwrap(), 10);
    assert!(staging_is_empty(&staging));

    let script = store.get_script(script_id).await.unwrap().unwrap();
    assert_eq!(script.downloads, 0);
}

#[tokio::test]
async fn staging_failure_refunds_the_debit() {
    let staging = TempDir::new().unwrap();
    // Occupy the staging path with a plain file so directory creation fails.
    let occupied = staging.path().join("occupied");
    std::fs::write(&occupied, b"x").unwrap();

    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    store.credit(USER, 10).await.unwrap();
    let script_id = seeded_script(&store, true).await;

    let mut config = settings(&staging);
    config.staging_dir = occupied;
    let pipeline = DeliveryPipeline::new(
        store.clone(),
        store.clone(),
        Arc::new(StaticOracle::member()),
        transport.clone(),
        &config,
    );
    let err = pipeline.deliver(USER, script_id).await.unwrap_err();

    assert!(matches!(err, DeliveryError::StagingFailed { .. }));
    assert_eq!(err.stage(), DeliveryStage::Stage);
    assert!(err.refunded());
    assert_eq!(store.balance(USER).await.unwrap(), 10);
    assert!(transport.sent.lock().is_empty());
}

#[tokio::test]
async fn failed_refund_escalates_to_reconciliation() {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    store.credit(USER, 10).await.unwrap();
    store.fail_credits(true);

    let pipeline = pipeline(&store, StaticOracle::member(), &transport, &staging);
    let err = pipeline.deliver(USER, Uuid::new_v4()).await.unwrap_err();

    match &err {
        DeliveryError::ReconciliationRequired {
            user_id,
            stage,
            price,
            ..
        } => {
            assert_eq!(user_id, USER);
            assert_eq!(*stage, DeliveryStage::Lookup);
            assert_eq!(*price, PRICE);
        }
        other => panic!("expected ReconciliationRequired, got {:?}", other),
    }
    assert!(!err.refunded());
    // Debited and not refunded: that is exactly what reconciliation means.
    assert_eq!(store.balance(USER).await.unwrap(), 5);
}

#[tokio::test]
async fn concurrent_deliveries_never_share_a_staged_name() {
    let staging = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::new());
    store.credit(USER, 10).await.unwrap();
    let script_id = seeded_script(&store, true).await;

    let pipeline = pipeline(&store, StaticOracle::member(), &transport, &staging);
    let (first, second) = tokio::join!(
        pipeline.deliver(USER, script_id),
        pipeline.deliver(USER, script_id)
    );

    first.unwrap();
    second.unwrap();
    assert_eq!(store.balance(USER).await.unwrap(), 0);

    let sent = transport.sent.lock().clone();
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].staged_path, sent[1].staged_path);
    assert!(sent.iter().all(|d| d.existed_at_send));

    let script = store.get_script(script_id).await.unwrap().unwrap();
    assert_eq!(script.downloads, 2);
}
