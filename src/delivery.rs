//! Gated delivery pipeline
//!
//! A delivery runs five stages in a fixed order: membership check, debit,
//! script lookup, staging, transport hand-off. The two external calls
//! (oracle and transport) cannot be folded into a database transaction, so
//! correctness rests on ordering plus explicit compensation: once the
//! debit commits, every failure path credits the price back before
//! returning, and a failed refund escalates instead of disappearing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::timeout;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, DeliveryStage, StoreError};
use crate::storage::{BalanceStore, ScriptStore};

/// Answers "is this user currently a member of the channel?".
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn is_member(&self, user_id: &str, channel: &str) -> anyhow::Result<bool>;
}

/// Pushes a named file to a user. Atomic from the pipeline's point of
/// view: it either confirms the send or it doesn't.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send_document(&self, user_id: &str, filename: &str, path: &Path)
        -> anyhow::Result<()>;
}

/// Confirmation returned for a delivery that reached terminal success.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    pub user_id: String,
    pub script_id: Uuid,
    pub filename: String,
    pub price: i64,
    pub new_balance: i64,
}

pub struct DeliveryPipeline {
    balances: Arc<dyn BalanceStore>,
    scripts: Arc<dyn ScriptStore>,
    oracle: Arc<dyn MembershipOracle>,
    transport: Arc<dyn DeliveryTransport>,
    price: i64,
    channel: String,
    staging_dir: PathBuf,
    call_timeout: Duration,
}

impl DeliveryPipeline {
    pub fn new(
        balances: Arc<dyn BalanceStore>,
        scripts: Arc<dyn ScriptStore>,
        oracle: Arc<dyn MembershipOracle>,
        transport: Arc<dyn DeliveryTransport>,
        settings: &DeliveryConfig,
    ) -> Self {
        Self {
            balances,
            scripts,
            oracle,
            transport,
            price: settings.price_coins,
            channel: settings.channel.clone(),
            staging_dir: settings.staging_dir.clone(),
            call_timeout: settings.call_timeout(),
        }
    }

    /// Run one delivery attempt end to end.
    ///
    /// Stages execute strictly in order; nothing is charged before the
    /// membership check passes, and nothing is sent before the debit
    /// commits. Concurrent attempts are independent: the only shared
    /// state is the stores, and every balance mutation there is atomic.
    pub async fn deliver(
        &self,
        user_id: &str,
        script_id: Uuid,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        // Stage 1: membership check. No side effects yet.
        let member = match timeout(
            self.call_timeout,
            self.oracle.is_member(user_id, &self.channel),
        )
        .await
        {
            Ok(Ok(member)) => member,
            Ok(Err(e)) => {
                return Err(DeliveryError::MembershipUnavailable {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(DeliveryError::MembershipUnavailable {
                    reason: "membership check timed out".to_string(),
                })
            }
        };
        if !member {
            return Err(DeliveryError::NotAMember {
                channel: self.channel.clone(),
            });
        }

        // Stage 2: debit. From here on every failure must refund.
        let new_balance = match self.balances.debit(user_id, self.price).await {
            Ok(balance) => balance,
            Err(StoreError::InsufficientBalance { balance, .. }) => {
                return Err(DeliveryError::InsufficientBalance {
                    balance,
                    price: self.price,
                })
            }
            Err(source) => {
                return Err(DeliveryError::Storage {
                    stage: DeliveryStage::Debit,
                    source,
                })
            }
        };

        // Stage 3: lookup. Disabled scripts are invisible here.
        let script = match self.scripts.get_script(script_id).await {
            Ok(Some(script)) if script.enabled => script,
            Ok(_) => {
                return Err(self
                    .refund(
                        user_id,
                        DeliveryStage::Lookup,
                        DeliveryError::ScriptNotFound { script_id },
                    )
                    .await)
            }
            Err(source) => {
                return Err(self
                    .refund(
                        user_id,
                        DeliveryStage::Lookup,
                        DeliveryError::Storage {
                            stage: DeliveryStage::Lookup,
                            source,
                        },
                    )
                    .await)
            }
        };

        // Stage 4: stage the payload under a per-attempt unique name so
        // concurrent deliveries of the same filename never collide.
        let staged = self
            .staging_dir
            .join(format!("{}_{}", Uuid::new_v4(), script.filename));
        if let Err(e) = self.stage_payload(&staged, script.content.as_bytes()).await {
            return Err(self
                .refund(
                    user_id,
                    DeliveryStage::Stage,
                    DeliveryError::StagingFailed {
                        reason: e.to_string(),
                    },
                )
                .await);
        }

        // Stage 5: hand off to the transport, then clean up.
        let sent = match timeout(
            self.call_timeout,
            self.transport.send_document(user_id, &script.filename, &staged),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("transport call timed out".to_string()),
        };

        if let Err(reason) = sent {
            let failure = self
                .refund(
                    user_id,
                    DeliveryStage::Deliver,
                    DeliveryError::DeliveryFailed { reason },
                )
                .await;
            self.discard_staged(&staged).await;
            return Err(failure);
        }

        self.discard_staged(&staged).await;

        // Advisory counter: drift on failure is tolerated, the delivery
        // already succeeded.
        if let Err(e) = self.scripts.increment_downloads(script_id).await {
            warn!(script_id = %script_id, "download counter bump failed: {}", e);
        }

        info!(
            user_id,
            script = %script.name,
            price = self.price,
            "script delivered"
        );

        Ok(DeliveryReceipt {
            user_id: user_id.to_string(),
            script_id,
            filename: script.filename,
            price: self.price,
            new_balance,
        })
    }

    /// Compensate a committed debit after a failed stage. Returns the
    /// original failure when the refund succeeds; escalates to
    /// `ReconciliationRequired` when it doesn't — the one outcome that is
    /// also logged at error level, since it is money owed to a user.
    async fn refund(
        &self,
        user_id: &str,
        stage: DeliveryStage,
        failure: DeliveryError,
    ) -> DeliveryError {
        match self.balances.credit(user_id, self.price).await {
            Ok(_) => {
                info!(
                    user_id,
                    price = self.price,
                    stage = stage.as_str(),
                    "debit refunded after failed delivery"
                );
                failure
            }
            Err(refund_error) => {
                let escalated = DeliveryError::ReconciliationRequired {
                    user_id: user_id.to_string(),
                    stage,
                    failure: failure.to_string(),
                    refund_error,
                    price: self.price,
                };
                error!("{}", escalated);
                escalated
            }
        }
    }

    async fn stage_payload(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        tokio::fs::write(path, bytes).await
    }

    /// Best-effort removal; a leftover scratch file is a hygiene problem,
    /// not a correctness one.
    async fn discard_staged(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), "failed to remove staged file: {}", e);
        }
    }
}
