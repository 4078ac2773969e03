//! In-memory collaborators for the integration tests.
//!
//! These mirror the contracts of the Postgres store and the Telegram
//! client without any I/O so the pipeline scenarios run hermetically.
//! Each store mutation happens under a single lock acquisition, which
//! preserves the atomicity the real store gets from single-statement SQL.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::auth::AdminDirectory;
use crate::delivery::{DeliveryTransport, MembershipOracle};
use crate::error::{StoreError, StoreResult};
use crate::storage::{
    BalanceStore, NewScript, Script, ScriptStore, ScriptUpdate, UserAccount,
};

fn script_not_found(id: Uuid) -> StoreError {
    StoreError::NotFound {
        kind: "script",
        id: id.to_string(),
    }
}

/// In-memory store implementing the same contracts as `PgStorage`.
#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<String, UserAccount>>,
    scripts: Mutex<Vec<Script>>,
    admins: Mutex<HashSet<String>>,
    fail_credits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_admin(&self, user_id: &str) {
        self.admins.lock().insert(user_id.to_string());
    }

    /// Make every subsequent credit fail, to exercise the path where a
    /// refund cannot be applied.
    pub fn fail_credits(&self, fail: bool) {
        self.fail_credits.store(fail, Ordering::SeqCst);
    }

    pub fn user_count(&self) -> usize {
        self.users.lock().len()
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn credit(&self, user_id: &str, amount: i64) -> StoreResult<i64> {
        if amount <= 0 {
            return Err(StoreError::InvalidAmount { amount });
        }
        if self.fail_credits.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected credit failure".to_string()));
        }

        let mut users = self.users.lock();
        let account = users
            .entry(user_id.to_string())
            .or_insert_with(|| UserAccount {
                user_id: user_id.to_string(),
                coins: 0,
                first_seen: Utc::now(),
            });
        account.coins += amount;
        Ok(account.coins)
    }

    async fn debit(&self, user_id: &str, amount: i64) -> StoreResult<i64> {
        if amount <= 0 {
            return Err(StoreError::InvalidAmount { amount });
        }

        let mut users = self.users.lock();
        match users.get_mut(user_id) {
            Some(account) if account.coins >= amount => {
                account.coins -= amount;
                Ok(account.coins)
            }
            Some(account) => Err(StoreError::InsufficientBalance {
                balance: account.coins,
                requested: amount,
            }),
            None => Err(StoreError::InsufficientBalance {
                balance: 0,
                requested: amount,
            }),
        }
    }

    async fn balance(&self, user_id: &str) -> StoreResult<i64> {
        Ok(self.users.lock().get(user_id).map(|a| a.coins).unwrap_or(0))
    }

    async fn register(&self, user_id: &str) -> StoreResult<()> {
        self.users
            .lock()
            .entry(user_id.to_string())
            .or_insert_with(|| UserAccount {
                user_id: user_id.to_string(),
                coins: 0,
                first_seen: Utc::now(),
            });
        Ok(())
    }
}

#[async_trait]
impl ScriptStore for MemoryStore {
    async fn create_script(&self, new: NewScript) -> StoreResult<Script> {
        let script = Script {
            id: Uuid::new_v4(),
            name: new.name,
            filename: new.filename,
            description: new.description,
            content: new.content,
            enabled: new.enabled,
            downloads: 0,
            created_at: Utc::now(),
        };
        self.scripts.lock().push(script.clone());
        Ok(script)
    }

    async fn update_script(&self, id: Uuid, update: ScriptUpdate) -> StoreResult<Script> {
        let mut scripts = self.scripts.lock();
        let script = scripts
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| script_not_found(id))?;

        if let Some(name) = update.name {
            script.name = name;
        }
        if let Some(filename) = update.filename {
            script.filename = filename;
        }
        if let Some(description) = update.description {
            script.description = description;
        }
        if let Some(content) = update.content {
            script.content = content;
        }
        Ok(script.clone())
    }

    async fn delete_script(&self, id: Uuid) -> StoreResult<()> {
        let mut scripts = self.scripts.lock();
        let before = scripts.len();
        scripts.retain(|s| s.id != id);
        if scripts.len() == before {
            return Err(script_not_found(id));
        }
        Ok(())
    }

    async fn get_script(&self, id: Uuid) -> StoreResult<Option<Script>> {
        Ok(self.scripts.lock().iter().find(|s| s.id == id).cloned())
    }

    async fn list_scripts(&self, enabled_only: bool) -> StoreResult<Vec<Script>> {
        Ok(self
            .scripts
            .lock()
            .iter()
            .filter(|s| !enabled_only || s.enabled)
            .cloned()
            .collect())
    }

    async fn toggle_enabled(&self, id: Uuid) -> StoreResult<Script> {
        let mut scripts = self.scripts.lock();
        let script = scripts
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| script_not_found(id))?;
        script.enabled = !script.enabled;
        Ok(script.clone())
    }

    async fn increment_downloads(&self, id: Uuid) -> StoreResult<i64> {
        let mut scripts = self.scripts.lock();
        let script = scripts
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| script_not_found(id))?;
        script.downloads += 1;
        Ok(script.downloads)
    }
}

#[async_trait]
impl AdminDirectory for MemoryStore {
    async fn is_admin(&self, user_id: &str) -> StoreResult<bool> {
        Ok(self.admins.lock().contains(user_id))
    }
}

/// Oracle with a fixed answer.
pub struct StaticOracle {
    response: Result<bool, String>,
}

impl StaticOracle {
    pub fn member() -> Self {
        Self { response: Ok(true) }
    }

    pub fn non_member() -> Self {
        Self {
            response: Ok(false),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            response: Err(reason.to_string()),
        }
    }
}

#[async_trait]
impl MembershipOracle for StaticOracle {
    async fn is_member(&self, _user_id: &str, _channel: &str) -> anyhow::Result<bool> {
        match &self.response {
            Ok(member) => Ok(*member),
            Err(reason) => Err(anyhow::anyhow!("{}", reason)),
        }
    }
}

/// Oracle that never answers, for the timeout path.
pub struct StalledOracle;

#[async_trait]
impl MembershipOracle for StalledOracle {
    async fn is_member(&self, _user_id: &str, _channel: &str) -> anyhow::Result<bool> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(true)
    }
}

/// One send observed by [`RecordingTransport`].
#[derive(Debug, Clone)]
pub struct SentDocument {
    pub user_id: String,
    pub filename: String,
    pub staged_path: PathBuf,
    /// Whether the staged file existed when the transport was handed it.
    pub existed_at_send: bool,
}

/// Transport recording every send, optionally failing them all.
#[derive(Default)]
pub struct RecordingTransport {
    fail_with: Option<String>,
    pub sent: Mutex<Vec<SentDocument>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            sent: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DeliveryTransport for RecordingTransport {
    async fn send_document(
        &self,
        user_id: &str,
        filename: &str,
        path: &Path,
    ) -> anyhow::Result<()> {
        if let Some(reason) = &self.fail_with {
            anyhow::bail!("{}", reason);
        }
        self.sent.lock().push(SentDocument {
            user_id: user_id.to_string(),
            filename: filename.to_string(),
            staged_path: path.to_path_buf(),
            existed_at_send: path.exists(),
        });
        Ok(())
    }
}
