//! Store contract tests: balance arithmetic, atomicity under concurrency,
//! inventory CRUD and the admin gate.

use std::sync::Arc;

use scriptdrop::auth;
use scriptdrop::error::StoreError;
use scriptdrop::storage::{BalanceStore, NewScript, ScriptStore, ScriptUpdate};
use scriptdrop::test_support::MemoryStore;

fn fixture_script(name: &str) -> NewScript {
    NewScript {
        name: name.to_string(),
        filename: format!("{}.conf", name),
        description: String::new(),
        content: "payload".to_string(),
        enabled: true,
    }
}

#[tokio::test]
async fn credit_then_debit_leaves_the_difference() {
    let store = MemoryStore::new();
    assert_eq!(store.credit("u", 10).await.unwrap(), 10);
    assert_eq!(store.debit("u", 4).await.unwrap(), 6);
    assert_eq!(store.balance("u").await.unwrap(), 6);
}

#[tokio::test]
async fn overdraft_debit_is_a_noop() {
    let store = MemoryStore::new();
    store.credit("u", 3).await.unwrap();

    let err = store.debit("u", 5).await.unwrap_err();
    match err {
        StoreError::InsufficientBalance { balance, requested } => {
            assert_eq!(balance, 3);
            assert_eq!(requested, 5);
        }
        other => panic!("expected InsufficientBalance, got {:?}", other),
    }
    assert_eq!(store.balance("u").await.unwrap(), 3);
}

#[tokio::test]
async fn debit_on_unknown_user_counts_as_zero_balance() {
    let store = MemoryStore::new();
    let err = store.debit("ghost", 1).await.unwrap_err();
    match err {
        StoreError::InsufficientBalance { balance, .. } => assert_eq!(balance, 0),
        other => panic!("expected InsufficientBalance, got {:?}", other),
    }
    // The failed debit must not create an account.
    assert_eq!(store.user_count(), 0);
}

#[tokio::test]
async fn non_positive_amounts_are_rejected() {
    let store = MemoryStore::new();
    assert!(matches!(
        store.credit("u", 0).await.unwrap_err(),
        StoreError::InvalidAmount { amount: 0 }
    ));
    assert!(matches!(
        store.credit("u", -5).await.unwrap_err(),
        StoreError::InvalidAmount { amount: -5 }
    ));
    assert!(matches!(
        store.debit("u", 0).await.unwrap_err(),
        StoreError::InvalidAmount { amount: 0 }
    ));
}

#[tokio::test]
async fn balance_read_is_side_effect_free() {
    let store = MemoryStore::new();
    assert_eq!(store.balance("ghost").await.unwrap(), 0);
    assert_eq!(store.balance("ghost").await.unwrap(), 0);
    assert_eq!(store.user_count(), 0);
}

#[tokio::test]
async fn register_is_an_idempotent_upsert() {
    let store = MemoryStore::new();
    store.register("u").await.unwrap();
    store.credit("u", 7).await.unwrap();
    store.register("u").await.unwrap();

    assert_eq!(store.balance("u").await.unwrap(), 7);
    assert_eq!(store.user_count(), 1);
}

#[tokio::test]
async fn concurrent_credits_lose_no_updates() {
    let store = Arc::new(MemoryStore::new());
    let mut handles = Vec::new();

    for _ in 0..32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.credit("u", 1).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(store.balance("u").await.unwrap(), 32);
}

#[tokio::test]
async fn listing_preserves_insertion_order_and_filters_disabled() {
    let store = MemoryStore::new();
    let a = store.create_script(fixture_script("alpha")).await.unwrap();
    let b = store.create_script(fixture_script("beta")).await.unwrap();
    let c = store.create_script(fixture_script("gamma")).await.unwrap();

    store.toggle_enabled(b.id).await.unwrap();

    let all = store.list_scripts(false).await.unwrap();
    assert_eq!(
        all.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![a.id, b.id, c.id]
    );

    let enabled = store.list_scripts(true).await.unwrap();
    assert_eq!(
        enabled.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![a.id, c.id]
    );
}

#[tokio::test]
async fn update_applies_only_provided_fields() {
    let store = MemoryStore::new();
    let script = store.create_script(fixture_script("alpha")).await.unwrap();

    let updated = store
        .update_script(
            script.id,
            ScriptUpdate {
                description: Some("new description".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.name, "alpha");
    assert_eq!(updated.filename, "alpha.conf");
    assert_eq!(updated.description, "new description");
}

#[tokio::test]
async fn deleted_script_is_gone_for_every_operation() {
    let store = MemoryStore::new();
    let script = store.create_script(fixture_script("alpha")).await.unwrap();

    store.delete_script(script.id).await.unwrap();

    assert!(matches!(
        store.delete_script(script.id).await.unwrap_err(),
        StoreError::NotFound { .. }
    ));
    assert!(matches!(
        store.increment_downloads(script.id).await.unwrap_err(),
        StoreError::NotFound { .. }
    ));
    assert!(matches!(
        store
            .update_script(script.id, ScriptUpdate::default())
            .await
            .unwrap_err(),
        StoreError::NotFound { .. }
    ));
    assert!(store.get_script(script.id).await.unwrap().is_none());
}

#[tokio::test]
async fn toggle_flips_enabled_both_ways() {
    let store = MemoryStore::new();
    let script = store.create_script(fixture_script("alpha")).await.unwrap();

    let disabled = store.toggle_enabled(script.id).await.unwrap();
    assert!(!disabled.enabled);

    let enabled = store.toggle_enabled(script.id).await.unwrap();
    assert!(enabled.enabled);
}

#[tokio::test]
async fn download_counter_is_monotonic() {
    let store = MemoryStore::new();
    let script = store.create_script(fixture_script("alpha")).await.unwrap();

    assert_eq!(store.increment_downloads(script.id).await.unwrap(), 1);
    assert_eq!(store.increment_downloads(script.id).await.unwrap(), 2);
    assert_eq!(store.increment_downloads(script.id).await.unwrap(), 3);
}

#[tokio::test]
async fn admin_gate_only_passes_known_ids() {
    let store = MemoryStore::new();
    assert!(!auth::is_authorized(&store, "50").await);

    store.add_admin("50");
    assert!(auth::is_authorized(&store, "50").await);
    assert!(!auth::is_authorized(&store, "51").await);
}
