//! Admin authorization
//!
//! Authorization is a capability check against a persisted admin set: a
//! caller is authorized iff the id it presents (via the `X-Admin-Id`
//! header) exists in the `admins` table. No sessions, no expiry. The
//! check lives behind [`AdminDirectory`] so a real auth scheme can be
//! swapped in without touching the stores or the pipeline.

use async_trait::async_trait;
use axum::http::HeaderMap;
use tracing::warn;

use crate::error::StoreResult;
use crate::pg_storage::PgStorage;

/// Header carrying the caller's claimed identity on admin routes.
pub const ADMIN_HEADER: &str = "x-admin-id";

#[async_trait]
pub trait AdminDirectory: Send + Sync {
    async fn is_admin(&self, user_id: &str) -> StoreResult<bool>;
}

#[async_trait]
impl AdminDirectory for PgStorage {
    async fn is_admin(&self, user_id: &str) -> StoreResult<bool> {
        PgStorage::is_admin(self, user_id).await
    }
}

/// Extract the caller id from request headers. Empty values count as
/// absent.
pub fn caller_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ADMIN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
}

/// True only for callers present in the admin set. A failed lookup denies
/// access rather than erroring the request, so no store mutation can ever
/// precede a rejected authorization.
pub async fn is_authorized(directory: &dyn AdminDirectory, caller_id: &str) -> bool {
    match directory.is_admin(caller_id).await {
        Ok(authorized) => authorized,
        Err(e) => {
            warn!(caller_id, "admin lookup failed: {}", e);
            false
        }
    }
}
