//! Federation policy gate
//!
//! Maintains the block and pool sets that decide which remote actors and
//! instances this node exchanges activities with. Entries are either exact
//! actor URLs (user scope) or origins (instance scope). Every mutation
//! persists before it returns, so a restart never resurrects a lifted
//! block or forgets a fresh one.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::data::{PolicyRecord, Store, tables};
use crate::error::AppError;

/// Record id of the policy document inside the policy table.
const POLICY_RECORD_ID: &str = "federation-policy";

/// Whether a policy action targets a single actor or a whole instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyScope {
    User,
    Instance,
}

/// Reduce an actor URL to its origin (`scheme://host[:port]`).
pub fn origin_of(url: &str) -> Result<String, AppError> {
    let parsed =
        url::Url::parse(url).map_err(|e| AppError::InvalidScope(format!("Invalid URL: {}", e)))?;

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::InvalidScope("URL has no host".to_string()))?;

    match parsed.port() {
        Some(port) => Ok(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Ok(format!("{}://{}", parsed.scheme(), host)),
    }
}

/// Normalize and validate a policy target against its scope.
///
/// User scope expects an actor URL with a path; instance scope expects a
/// bare origin. Mismatches are `InvalidScope`.
fn normalize_target(scope: PolicyScope, target: &str) -> Result<String, AppError> {
    let parsed = url::Url::parse(target)
        .map_err(|e| AppError::InvalidScope(format!("Invalid target: {}", e)))?;

    if parsed.host_str().is_none() {
        return Err(AppError::InvalidScope("Target has no host".to_string()));
    }

    match scope {
        PolicyScope::User => {
            if parsed.path() == "/" || parsed.path().is_empty() {
                return Err(AppError::InvalidScope(
                    "User scope requires an actor URL, not an origin".to_string(),
                ));
            }
            Ok(target.trim_end_matches('/').to_string())
        }
        PolicyScope::Instance => {
            if parsed.path() != "/" && !parsed.path().is_empty() {
                return Err(AppError::InvalidScope(
                    "Instance scope requires an origin, not an actor URL".to_string(),
                ));
            }
            origin_of(target)
        }
    }
}

/// In-memory policy sets backed by the store.
pub struct PolicyGate {
    store: Arc<Store>,
    inner: RwLock<PolicyRecord>,
}

impl PolicyGate {
    /// Load the persisted policy, or start empty.
    pub async fn load(store: Arc<Store>) -> Result<Self, AppError> {
        let record = match store.get_record(tables::POLICY, POLICY_RECORD_ID).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| AppError::Validation(format!("Corrupt policy record: {}", e)))?,
            None => PolicyRecord::default(),
        };

        Ok(Self {
            store,
            inner: RwLock::new(record),
        })
    }

    async fn persist(&self, record: &PolicyRecord) -> Result<(), AppError> {
        let mut doc = serde_json::to_value(record)
            .map_err(|e| AppError::Internal(e.into()))?;
        doc["id"] = serde_json::Value::from(POLICY_RECORD_ID);
        self.store.insert(tables::POLICY, &doc).await
    }

    /// Add a block entry. Blocking an already blocked target fails.
    pub async fn block(&self, scope: PolicyScope, target: &str) -> Result<(), AppError> {
        let entry = normalize_target(scope, target)?;
        let mut inner = self.inner.write().await;

        if inner.blocked.contains(&entry) {
            return Err(AppError::AlreadyBlocked);
        }

        let mut next = inner.clone();
        next.blocked.push(entry.clone());
        self.persist(&next).await?;
        *inner = next;

        tracing::info!(target = %entry, "Federation target blocked");
        Ok(())
    }

    /// Remove a block entry. Unblocking an unblocked target fails.
    pub async fn unblock(&self, scope: PolicyScope, target: &str) -> Result<(), AppError> {
        let entry = normalize_target(scope, target)?;
        let mut inner = self.inner.write().await;

        if !inner.blocked.contains(&entry) {
            return Err(AppError::NotBlocked);
        }

        let mut next = inner.clone();
        next.blocked.retain(|existing| existing != &entry);
        self.persist(&next).await?;
        *inner = next;

        tracing::info!(target = %entry, "Federation target unblocked");
        Ok(())
    }

    /// Add an instance to the content pool.
    pub async fn pool(&self, target: &str) -> Result<(), AppError> {
        let entry = normalize_target(PolicyScope::Instance, target)?;
        let mut inner = self.inner.write().await;

        if inner.pooled.contains(&entry) {
            return Err(AppError::AlreadyPooled);
        }

        let mut next = inner.clone();
        next.pooled.push(entry.clone());
        self.persist(&next).await?;
        *inner = next;

        tracing::info!(target = %entry, "Instance pooled");
        Ok(())
    }

    /// Remove an instance from the content pool.
    pub async fn unpool(&self, target: &str) -> Result<(), AppError> {
        let entry = normalize_target(PolicyScope::Instance, target)?;
        let mut inner = self.inner.write().await;

        if !inner.pooled.contains(&entry) {
            return Err(AppError::NotPooled);
        }

        let mut next = inner.clone();
        next.pooled.retain(|existing| existing != &entry);
        self.persist(&next).await?;
        *inner = next;

        tracing::info!(target = %entry, "Instance unpooled");
        Ok(())
    }

    /// Whether an actor is blocked, either directly or via its origin.
    pub async fn is_blocked(&self, actor_url: &str) -> bool {
        let inner = self.inner.read().await;
        let actor = actor_url.trim_end_matches('/');

        if inner.blocked.iter().any(|entry| entry == actor) {
            return true;
        }
        match origin_of(actor_url) {
            Ok(origin) => inner.blocked.iter().any(|entry| entry == &origin),
            Err(_) => false,
        }
    }

    /// Whether an actor's instance participates in the content pool.
    pub async fn is_pooled(&self, actor_url: &str) -> bool {
        let inner = self.inner.read().await;
        match origin_of(actor_url) {
            Ok(origin) => inner.pooled.iter().any(|entry| entry == &origin),
            Err(_) => false,
        }
    }

    /// Snapshot of the current policy sets, for the admin surface.
    pub async fn snapshot(&self) -> PolicyRecord {
        self.inner.read().await.clone()
    }
}
