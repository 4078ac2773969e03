//! Error types for the stores and the delivery pipeline.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by the balance and script stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A positive amount was required.
    #[error("invalid amount: {amount}")]
    InvalidAmount { amount: i64 },

    /// The debit would drive the balance below zero. No mutation occurred.
    #[error("insufficient balance: have {balance}, need {requested}")]
    InsufficientBalance { balance: i64, requested: i64 },

    /// A record that must exist does not.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Underlying database failure. Message only; the HTTP layer maps this
    /// to a generic 500 so storage internals never reach a caller.
    #[error("database error: {0}")]
    Database(String),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Self::Database(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The stage of the delivery pipeline a failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStage {
    MembershipCheck,
    Debit,
    Lookup,
    Stage,
    Deliver,
}

impl DeliveryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MembershipCheck => "membership_check",
            Self::Debit => "debit",
            Self::Lookup => "lookup",
            Self::Stage => "stage",
            Self::Deliver => "deliver",
        }
    }
}

impl std::fmt::Display for DeliveryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a failed delivery attempt.
///
/// Every variant maps to the stage it failed in, and [`DeliveryError::refunded`]
/// tells callers whether a committed debit was credited back, so "never
/// charged", "charged and refunded" and "charged, refund failed" stay
/// distinguishable.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The user is not a member of the gating channel. Nothing was charged.
    #[error("not a member of {channel}")]
    NotAMember { channel: String },

    /// The membership oracle could not answer (error or timeout). Treated
    /// like a non-member: nothing was charged.
    #[error("membership check unavailable: {reason}")]
    MembershipUnavailable { reason: String },

    /// The balance does not cover the price. Nothing was charged.
    #[error("insufficient balance: have {balance}, need {price}")]
    InsufficientBalance { balance: i64, price: i64 },

    /// The script is absent or disabled. The debit was refunded.
    #[error("script {script_id} not found")]
    ScriptNotFound { script_id: Uuid },

    /// Writing the payload to the scratch location failed. The debit was
    /// refunded.
    #[error("staging failed: {reason}")]
    StagingFailed { reason: String },

    /// The transport did not confirm the send. The debit was refunded and
    /// the staged file removed.
    #[error("delivery transport failed: {reason}")]
    DeliveryFailed { reason: String },

    /// A store call failed mid-pipeline. Whether the debit was refunded
    /// depends on the stage; see [`DeliveryError::refunded`].
    #[error("storage failed during {stage}: {source}")]
    Storage {
        stage: DeliveryStage,
        source: StoreError,
    },

    /// The refund after a post-debit failure itself failed. The user is
    /// owed `price` coins; this is a reconciliation item and is logged at
    /// error level by the pipeline, never swallowed.
    #[error(
        "refund of {price} coins to {user_id} failed after {stage}: {refund_error} (original failure: {failure})"
    )]
    ReconciliationRequired {
        user_id: String,
        stage: DeliveryStage,
        failure: String,
        refund_error: StoreError,
        price: i64,
    },
}

impl DeliveryError {
    /// The pipeline stage this failure belongs to.
    pub fn stage(&self) -> DeliveryStage {
        match self {
            Self::NotAMember { .. } | Self::MembershipUnavailable { .. } => {
                DeliveryStage::MembershipCheck
            }
            Self::InsufficientBalance { .. } => DeliveryStage::Debit,
            Self::ScriptNotFound { .. } => DeliveryStage::Lookup,
            Self::StagingFailed { .. } => DeliveryStage::Stage,
            Self::DeliveryFailed { .. } => DeliveryStage::Deliver,
            Self::Storage { stage, .. } | Self::ReconciliationRequired { stage, .. } => *stage,
        }
    }

    /// Whether a committed debit was credited back before this error was
    /// returned. `false` either because nothing was charged yet or because
    /// the refund itself failed (`ReconciliationRequired`).
    pub fn refunded(&self) -> bool {
        match self {
            Self::ScriptNotFound { .. } | Self::StagingFailed { .. } | Self::DeliveryFailed { .. } => {
                true
            }
            // A storage fault in the debit statement commits nothing; any
            // later stage only fails after the refund succeeded.
            Self::Storage { stage, .. } => *stage != DeliveryStage::Debit,
            _ => false,
        }
    }

    /// Stable machine-readable kind for HTTP responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotAMember { .. } => "not_a_member",
            Self::MembershipUnavailable { .. } => "membership_unavailable",
            Self::InsufficientBalance { .. } => "insufficient_balance",
            Self::ScriptNotFound { .. } => "script_not_found",
            Self::StagingFailed { .. } => "staging_failed",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::Storage { .. } => "storage_error",
            Self::ReconciliationRequired { .. } => "reconciliation_required",
        }
    }
}
