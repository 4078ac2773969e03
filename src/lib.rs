//! Scriptdrop - deliver script files to channel members in exchange for coins
//!
//! Users hold an integer coin balance and scripts are priced at a flat
//! rate. A delivery is only honored for members of the configured Telegram
//! channel, and a committed debit is always refunded when a later step of
//! the delivery fails.
//!
//! # How a delivery runs
//!
//! 1. The membership oracle confirms the user belongs to the channel
//! 2. The price is debited from the user's balance (atomic, no overdraft)
//! 3. The script record is looked up; disabled scripts are invisible
//! 4. The payload is staged under a per-attempt unique name
//! 5. The transport pushes the file to the user, the staged copy is
//!    removed, and the download counter is bumped
//!
//! Any failure after step 2 credits the price back. A refund that itself
//! fails is escalated as a reconciliation item, never swallowed.

pub mod auth;
pub mod config;
pub mod delivery;
pub mod error;
pub mod pg_storage;
pub mod server;
pub mod storage;
pub mod telegram;
pub mod test_support;

pub use config::Config;
pub use delivery::{DeliveryPipeline, DeliveryReceipt, DeliveryTransport, MembershipOracle};
pub use error::{DeliveryError, DeliveryStage, StoreError};
pub use pg_storage::PgStorage;
pub use storage::{BalanceStore, NewScript, Script, ScriptStore, ScriptUpdate};
pub use telegram::TelegramClient;
