//! PostgreSQL storage for scriptdrop
//!
//! Persistent store for user balances, script inventory and the admin set.
//! Connects with DATABASE_URL; every balance mutation is a single SQL
//! statement so concurrent operations serialize inside Postgres row
//! locking (no read-then-write pairs).

use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::info;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::storage::{BalanceStore, NewScript, Script, ScriptStore, ScriptUpdate, StoreStats};

/// Database pool configuration
const DB_POOL_MAX_SIZE: usize = 20;
const DB_QUERY_TIMEOUT_SECS: u64 = 30;

const SCRIPT_COLUMNS: &str = "id, name, filename, description, content, enabled, downloads, created_at";

#[derive(Clone)]
pub struct PgStorage {
    pool: Pool,
}

impl PgStorage {
    /// Create storage from a connection string
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        use deadpool_postgres::{ManagerConfig, PoolConfig, RecyclingMethod};
        use std::time::Duration;

        let mut config = Config::new();
        config.url = Some(database_url.to_string());

        config.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        config.pool = Some(PoolConfig {
            max_size: DB_POOL_MAX_SIZE,
            timeouts: deadpool_postgres::Timeouts {
                wait: Some(Duration::from_secs(DB_QUERY_TIMEOUT_SECS)),
                create: Some(Duration::from_secs(10)),
                recycle: Some(Duration::from_secs(30)),
            },
            ..Default::default()
        });

        let pool = config.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let client = pool.get().await?;
        client
            .execute(
                &format!("SET statement_timeout = '{}s'", DB_QUERY_TIMEOUT_SECS),
                &[],
            )
            .await?;

        info!(
            "Connected to PostgreSQL (pool_size: {}, query_timeout: {}s)",
            DB_POOL_MAX_SIZE, DB_QUERY_TIMEOUT_SECS
        );

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create storage from the DATABASE_URL environment variable
    pub async fn from_env() -> anyhow::Result<Self> {
        let url =
            std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?;
        Self::new(&url).await
    }

    /// Run embedded migrations
    async fn run_migrations(&self) -> anyhow::Result<()> {
        let client = self.pool.get().await?;

        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_name = 'schema_migrations')",
                &[],
            )
            .await?
            .get(0);

        if !exists {
            let migration_sql = include_str!("../migrations/001_schema.sql");
            client.batch_execute(migration_sql).await?;
            info!("Applied migration 001_schema");
        }

        Ok(())
    }

    // ========================================================================
    // ADMIN SET
    // ========================================================================

    /// Add a user id to the admin set (no-op if already present)
    pub async fn add_admin(&self, user_id: &str) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO admins (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
                &[&user_id],
            )
            .await?;
        info!("Admin set includes {}", user_id);
        Ok(())
    }

    pub async fn is_admin(&self, user_id: &str) -> StoreResult<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM admins WHERE user_id = $1)",
                &[&user_id],
            )
            .await?;
        Ok(row.get(0))
    }

    // ========================================================================
    // AGGREGATES
    // ========================================================================

    /// Aggregate counters, derived from the stored rows on every call
    pub async fn stats(&self) -> StoreResult<StoreStats> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT
                    (SELECT COUNT(*) FROM users),
                    (SELECT COUNT(*) FROM scripts),
                    (SELECT COALESCE(SUM(downloads), 0)::BIGINT FROM scripts)",
                &[],
            )
            .await?;

        Ok(StoreStats {
            users: row.get(0),
            scripts: row.get(1),
            total_downloads: row.get(2),
        })
    }
}

fn script_from_row(row: &Row) -> Script {
    Script {
        id: row.get(0),
        name: row.get(1),
        filename: row.get(2),
        description: row.get(3),
        content: row.get(4),
        enabled: row.get(5),
        downloads: row.get(6),
        created_at: row.get(7),
    }
}

// ============================================================================
// BALANCE STORE
// ============================================================================

#[async_trait::async_trait]
impl BalanceStore for PgStorage {
    async fn credit(&self, user_id: &str, amount: i64) -> StoreResult<i64> {
        if amount <= 0 {
            return Err(StoreError::InvalidAmount { amount });
        }

        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO users (user_id, coins) VALUES ($1, $2)
                 ON CONFLICT (user_id) DO UPDATE SET coins = users.coins + EXCLUDED.coins
                 RETURNING coins",
                &[&user_id, &amount],
            )
            .await?;

        Ok(row.get(0))
    }

    async fn debit(&self, user_id: &str, amount: i64) -> StoreResult<i64> {
        if amount <= 0 {
            return Err(StoreError::InvalidAmount { amount });
        }

        let client = self.pool.get().await?;
        // Conditional single-statement update: zero rows touched means the
        // balance (or the row itself) does not cover the amount.
        let row = client
            .query_opt(
                "UPDATE users SET coins = coins - $2
                 WHERE user_id = $1 AND coins >= $2
                 RETURNING coins",
                &[&user_id, &amount],
            )
            .await?;

        match row {
            Some(r) => Ok(r.get(0)),
            None => {
                let balance = self.balance(user_id).await?;
                Err(StoreError::InsufficientBalance {
                    balance,
                    requested: amount,
                })
            }
        }
    }

    async fn balance(&self, user_id: &str) -> StoreResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT coins FROM users WHERE user_id = $1", &[&user_id])
            .await?;
        Ok(row.map(|r| r.get(0)).unwrap_or(0))
    }

    async fn register(&self, user_id: &str) -> StoreResult<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO users (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
                &[&user_id],
            )
            .await?;
        Ok(())
    }
}

// ============================================================================
// SCRIPT STORE
// ============================================================================

#[async_trait::async_trait]
impl ScriptStore for PgStorage {
    async fn create_script(&self, new: NewScript) -> StoreResult<Script> {
        let client = self.pool.get().await?;
        let id = Uuid::new_v4();

        let row = client
            .query_one(
                &format!(
                    "INSERT INTO scripts (id, name, filename, description, content, enabled)
                     VALUES ($1, $2, $3, $4, $5, $6)
                     RETURNING {SCRIPT_COLUMNS}"
                ),
                &[
                    &id,
                    &new.name,
                    &new.filename,
                    &new.description,
                    &new.content,
                    &new.enabled,
                ],
            )
            .await?;

        let script = script_from_row(&row);
        info!("Created script {} ({})", script.name, script.id);
        Ok(script)
    }

    async fn update_script(&self, id: Uuid, update: ScriptUpdate) -> StoreResult<Script> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE scripts SET
                        name = COALESCE($2, name),
                        filename = COALESCE($3, filename),
                        description = COALESCE($4, description),
                        content = COALESCE($5, content)
                     WHERE id = $1
                     RETURNING {SCRIPT_COLUMNS}"
                ),
                &[
                    &id,
                    &update.name,
                    &update.filename,
                    &update.description,
                    &update.content,
                ],
            )
            .await?;

        row.map(|r| script_from_row(&r)).ok_or(StoreError::NotFound {
            kind: "script",
            id: id.to_string(),
        })
    }

    async fn delete_script(&self, id: Uuid) -> StoreResult<()> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM scripts WHERE id = $1", &[&id])
            .await?;

        if deleted == 0 {
            return Err(StoreError::NotFound {
                kind: "script",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_script(&self, id: Uuid) -> StoreResult<Option<Script>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!("SELECT {SCRIPT_COLUMNS} FROM scripts WHERE id = $1"),
                &[&id],
            )
            .await?;
        Ok(row.map(|r| script_from_row(&r)))
    }

    async fn list_scripts(&self, enabled_only: bool) -> StoreResult<Vec<Script>> {
        let client = self.pool.get().await?;
        let sql = if enabled_only {
            format!("SELECT {SCRIPT_COLUMNS} FROM scripts WHERE enabled ORDER BY position")
        } else {
            format!("SELECT {SCRIPT_COLUMNS} FROM scripts ORDER BY position")
        };

        let rows = client.query(&sql, &[]).await?;
        Ok(rows.iter().map(script_from_row).collect())
    }

    async fn toggle_enabled(&self, id: Uuid) -> StoreResult<Script> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                &format!(
                    "UPDATE scripts SET enabled = NOT enabled WHERE id = $1
                     RETURNING {SCRIPT_COLUMNS}"
                ),
                &[&id],
            )
            .await?;

        row.map(|r| script_from_row(&r)).ok_or(StoreError::NotFound {
            kind: "script",
            id: id.to_string(),
        })
    }

    async fn increment_downloads(&self, id: Uuid) -> StoreResult<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE scripts SET downloads = downloads + 1 WHERE id = $1 RETURNING downloads",
                &[&id],
            )
            .await?;

        row.map(|r| r.get(0)).ok_or(StoreError::NotFound {
            kind: "script",
            id: id.to_string(),
        })
    }
}
