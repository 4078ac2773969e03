//! Domain records and store interfaces.
//!
//! The pipeline and the HTTP layer only ever talk to the two traits below;
//! `PgStorage` is the production implementation and the in-memory store in
//! `test_support` backs the integration tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreResult;

/// A user account holding a coin balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: String,
    pub coins: i64,
    pub first_seen: DateTime<Utc>,
}

/// A distributable script record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: Uuid,
    pub name: String,
    pub filename: String,
    pub description: String,
    pub content: String,
    pub enabled: bool,
    pub downloads: i64,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when creating a script. The store assigns `id`,
/// `downloads` and `created_at`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewScript {
    pub name: String,
    pub filename: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Partial update for a script. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptUpdate {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
}

/// Aggregate counters for the admin stats endpoint. Always derived from
/// the stored rows, never tracked in process memory.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub users: i64,
    pub scripts: i64,
    pub total_downloads: i64,
}

/// Atomic per-user coin balances.
///
/// Every mutation behaves as a single compare-and-update: concurrent
/// credits and debits on the same user serialize to some total order with
/// no lost updates and no overdraft.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Adds `amount` coins and returns the new balance. Creates the
    /// account with `coins = amount` on first credit. Fails with
    /// `InvalidAmount` unless `amount > 0`.
    async fn credit(&self, user_id: &str, amount: i64) -> StoreResult<i64>;

    /// Subtracts `amount` coins and returns the new balance, but only if
    /// the current balance covers it; otherwise `InsufficientBalance` and
    /// no mutation. An absent account counts as balance 0.
    async fn debit(&self, user_id: &str, amount: i64) -> StoreResult<i64>;

    /// Point read. Returns 0 for an unknown user and never creates a
    /// record.
    async fn balance(&self, user_id: &str) -> StoreResult<i64>;

    /// Explicit onboarding upsert. No-op for an existing account.
    async fn register(&self, user_id: &str) -> StoreResult<()>;
}

/// CRUD plus download accounting over script records.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    async fn create_script(&self, new: NewScript) -> StoreResult<Script>;

    /// Applies the non-`None` fields of `update`. `NotFound` if absent.
    async fn update_script(&self, id: Uuid, update: ScriptUpdate) -> StoreResult<Script>;

    async fn delete_script(&self, id: Uuid) -> StoreResult<()>;

    async fn get_script(&self, id: Uuid) -> StoreResult<Option<Script>>;

    /// Scripts in insertion order; `enabled_only` hides disabled records.
    async fn list_scripts(&self, enabled_only: bool) -> StoreResult<Vec<Script>>;

    /// Atomically flips `enabled` and returns the updated record.
    async fn toggle_enabled(&self, id: Uuid) -> StoreResult<Script>;

    /// Bumps the advisory download counter. `NotFound` if absent.
    async fn increment_downloads(&self, id: Uuid) -> StoreResult<i64>;
}
