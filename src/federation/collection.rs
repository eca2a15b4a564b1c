//! Collection engine
//!
//! Ordered collections (inbox, outbox, followers, votes, replies, flags)
//! persisted as whole JSON documents. Every mutation runs under a
//! per-collection async lock and rewrites `orderedItems` and `totalItems`
//! together, so `totalItems == orderedItems.len()` holds at every commit
//! point and concurrent appends never lose items.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::data::{Store, tables};
use crate::error::AppError;
use crate::federation::object;

/// The collections an actor or object can own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionName {
    Inbox,
    Outbox,
    Followers,
    Following,
    Liked,
    Likes,
    Dislikes,
    Replies,
    Flags,
}

impl CollectionName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Outbox => "outbox",
            Self::Followers => "followers",
            Self::Following => "following",
            Self::Liked => "liked",
            Self::Likes => "likes",
            Self::Dislikes => "dislikes",
            Self::Replies => "replies",
            Self::Flags => "flags",
        }
    }
}

/// Collection id for an owner URL, e.g. `{actor}/followers`.
pub fn collection_id(owner: &str, name: CollectionName) -> String {
    format!("{}/{}", owner.trim_end_matches('/'), name.as_str())
}

/// Collection store with per-collection mutation locks.
pub struct Collections {
    store: Arc<Store>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Collections {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop lock entries no task currently holds.
    ///
    /// The map gains an entry per collection ever touched; the maintenance
    /// loop calls this to keep it proportional to in-flight mutations. An
    /// entry whose `Arc` is only held by the map cannot guard anything.
    pub async fn evict_idle_locks(&self) {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let evicted = before - locks.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Idle collection locks evicted");
        }
    }

    async fn read_items(&self, id: &str) -> Result<Vec<Value>, AppError> {
        match self.store.get_record(tables::COLLECTIONS, id).await? {
            Some(record) => Ok(record
                .get("orderedItems")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()),
            None => Ok(Vec::new()),
        }
    }

    async fn write_items(&self, id: &str, items: Vec<Value>) -> Result<(), AppError> {
        let mut document = object::build::empty_collection(id);
        document["totalItems"] = Value::from(items.len());
        document["orderedItems"] = Value::Array(items);
        self.store.insert(tables::COLLECTIONS, &document).await
    }

    /// Create the collection document if it does not exist yet.
    pub async fn ensure(&self, id: &str) -> Result<(), AppError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        if self
            .store
            .get_record(tables::COLLECTIONS, id)
            .await?
            .is_none()
        {
            self.write_items(id, Vec::new()).await?;
        }
        Ok(())
    }

    /// Append an item, rejecting values already present.
    ///
    /// A repeat append is `DuplicateAction`; idempotent callers treat that
    /// as success.
    pub async fn append(&self, id: &str, item: Value) -> Result<(), AppError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut items = self.read_items(id).await?;
        if items.contains(&item) {
            return Err(AppError::DuplicateAction(describe_item(&item)));
        }
        items.push(item);
        self.write_items(id, items).await
    }

    /// Remove an item by exact value. Removing an absent value is a no-op
    /// that reports whether anything was removed.
    pub async fn remove_by_value(&self, id: &str, item: &Value) -> Result<bool, AppError> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;

        let mut items = self.read_items(id).await?;
        let before = items.len();
        items.retain(|existing| existing != item);
        let removed = items.len() != before;

        if removed {
            self.write_items(id, items).await?;
        }
        Ok(removed)
    }

    /// Whether the collection currently holds the exact value.
    pub async fn contains(&self, id: &str, item: &Value) -> Result<bool, AppError> {
        Ok(self.read_items(id).await?.contains(item))
    }

    /// Snapshot of the ordered items. An absent collection is empty.
    pub async fn items(&self, id: &str) -> Result<Vec<Value>, AppError> {
        self.read_items(id).await
    }

    /// Item count. An absent collection has zero items.
    pub async fn total_items(&self, id: &str) -> Result<usize, AppError> {
        Ok(self.read_items(id).await?.len())
    }

    /// The full OrderedCollection document for serving over HTTP.
    pub async fn document(&self, id: &str) -> Result<Value, AppError> {
        let items = self.read_items(id).await?;
        let mut document = object::build::empty_collection(id);
        document["totalItems"] = Value::from(items.len());
        document["orderedItems"] = Value::Array(items);
        Ok(document)
    }
}

fn describe_item(item: &Value) -> String {
    match item {
        Value::String(url) => url.clone(),
        other => other
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("embedded object")
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collections() -> Collections {
        Collections::new(Arc::new(Store::connect_in_memory().await.expect("store")))
    }

    #[tokio::test]
    async fn append_keeps_total_items_in_sync() {
        let collections = collections().await;
        let id = collection_id("https://local.example/users/alice", CollectionName::Followers);

        collections
            .append(&id, Value::from("https://remote.example/users/bob"))
            .await
            .expect("append");
        collections
            .append(&id, Value::from("https://remote.example/users/carol"))
            .await
            .expect("append");

        let document = collections.document(&id).await.expect("document");
        assert_eq!(document["totalItems"], 2);
        assert_eq!(
            document["orderedItems"].as_array().expect("items").len(),
            2
        );
    }

    #[tokio::test]
    async fn append_rejects_duplicates() {
        let collections = collections().await;
        let id = collection_id("https://local.example/notes/1", CollectionName::Likes);
        let item = Value::from("https://remote.example/users/bob");

        collections.append(&id, item.clone()).await.expect("append");
        let result = collections.append(&id, item).await;

        assert!(matches!(result, Err(AppError::DuplicateAction(_))));
        assert_eq!(collections.total_items(&id).await.expect("total"), 1);
    }

    #[tokio::test]
    async fn remove_by_value_restores_prior_state() {
        let collections = collections().await;
        let id = collection_id("https://local.example/users/alice", CollectionName::Followers);
        let item = Value::from("https://remote.example/users/bob");

        collections.append(&id, item.clone()).await.expect("append");
        assert!(collections.remove_by_value(&id, &item).await.expect("remove"));

        assert_eq!(collections.total_items(&id).await.expect("total"), 0);
        assert!(!collections.contains(&id, &item).await.expect("contains"));

        // Removing again is a no-op.
        assert!(!collections.remove_by_value(&id, &item).await.expect("remove"));
    }

    #[tokio::test]
    async fn absent_collection_reads_as_empty() {
        let collections = collections().await;
        let id = collection_id("https://local.example/users/alice", CollectionName::Inbox);

        assert_eq!(collections.total_items(&id).await.expect("total"), 0);
        assert!(collections.items(&id).await.expect("items").is_empty());

        let document = collections.document(&id).await.expect("document");
        assert_eq!(document["type"], "OrderedCollection");
        assert_eq!(document["totalItems"], 0);
    }

    #[tokio::test]
    async fn ensure_creates_once() {
        let collections = collections().await;
        let id = collection_id("https://local.example/users/alice", CollectionName::Outbox);

        collections.ensure(&id).await.expect("ensure");
        collections
            .append(&id, Value::from("https://local.example/create/1"))
            .await
            .expect("append");
        collections.ensure(&id).await.expect("ensure again");

        // A second ensure must not reset the contents.
        assert_eq!(collections.total_items(&id).await.expect("total"), 1);
    }

    #[tokio::test]
    async fn idle_locks_are_evicted_and_held_locks_survive() {
        let collections = collections().await;
        let alice = collection_id("https://local.example/users/alice", CollectionName::Inbox);
        let bob = collection_id("https://local.example/users/bob", CollectionName::Inbox);

        collections
            .append(&alice, Value::from("https://remote.example/items/1"))
            .await
            .expect("append");
        let held = collections.lock_for(&bob).await;
        let _guard = held.lock().await;

        collections.evict_idle_locks().await;

        let locks = collections.locks.lock().await;
        assert!(!locks.contains_key(&alice));
        assert!(locks.contains_key(&bob));
        drop(locks);

        // Mutations after eviction recreate the lock transparently.
        collections
            .append(&alice, Value::from("https://remote.example/items/2"))
            .await
            .expect("append after eviction");
        assert_eq!(collections.total_items(&alice).await.expect("total"), 2);
    }

    #[tokio::test]
    async fn concurrent_appends_never_lose_items() {
        let collections = Arc::new(collections().await);
        let id = collection_id("https://local.example/users/alice", CollectionName::Inbox);

        let mut handles = Vec::new();
        for n in 0..16 {
            let collections = collections.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                collections
                    .append(&id, Value::from(format!("https://remote.example/items/{}", n)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("append");
        }

        let document = collections.document(&id).await.expect("document");
        assert_eq!(document["totalItems"], 16);
        assert_eq!(
            document["orderedItems"].as_array().expect("items").len(),
            16
        );
    }
}
