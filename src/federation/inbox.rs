//! Inbox processing
//!
//! Inbound activities pass through a fixed pipeline: parse, signature
//! presence, keyId/actor match, policy gate, key fetch, cryptographic
//! verification, then dispatch. Dispatch is an exhaustive match over the
//! activity vocabulary; each arm applies the activity to local state or
//! rejects it with a precise error.

use std::sync::Arc;

use serde_json::Value;

use crate::data::{EntityId, Store, tables};
use crate::error::AppError;
use crate::federation::collection::{CollectionName, Collections, collection_id};
use crate::federation::key_cache::PublicKeyCache;
use crate::federation::object::{self, Activity, ActivityKind, ActivityObject};
use crate::federation::policy::{PolicyGate, origin_of};
use crate::federation::signature::{
    extract_signature_key_id, fetch_public_key, key_id_matches_actor, verify_signature,
};
use crate::metrics::{ACTIVITIES_RECEIVED, FEDERATION_REQUESTS_TOTAL, FOLLOWERS_TOTAL};

/// Result of applying an inbound activity.
///
/// `accept` carries an outbound Accept payload when a Follow was applied;
/// the caller delivers it back to the follower.
#[derive(Debug)]
pub struct Dispatched {
    pub accept: Option<Value>,
}

impl Dispatched {
    fn applied() -> Self {
        Self { accept: None }
    }
}

/// Processes activities POSTed to local inboxes.
pub struct InboxProcessor {
    store: Arc<Store>,
    collections: Arc<Collections>,
    policy: Arc<PolicyGate>,
    key_cache: Arc<PublicKeyCache>,
    http_client: reqwest::Client,
    local_origin: String,
}

impl InboxProcessor {
    pub fn new(
        store: Arc<Store>,
        collections: Arc<Collections>,
        policy: Arc<PolicyGate>,
        key_cache: Arc<PublicKeyCache>,
        http_client: reqwest::Client,
        local_origin: String,
    ) -> Self {
        Self {
            store,
            collections,
            policy,
            key_cache,
            http_client,
            local_origin,
        }
    }

    fn is_local(&self, url: &str) -> bool {
        origin_of(url)
            .map(|origin| origin == self.local_origin)
            .unwrap_or(false)
    }

    /// Run the full inbound pipeline on a signed inbox POST.
    ///
    /// The policy gate runs before any key fetch, so blocked actors cost
    /// no outbound request. A verification failure against a cached key
    /// triggers one refetch in case the remote rotated keys.
    pub async fn receive(
        &self,
        method: &str,
        path: &str,
        headers: &http::HeaderMap,
        body: &[u8],
    ) -> Result<Dispatched, AppError> {
        let raw: Value = serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Invalid activity JSON: {}", e)))?;
        let activity = Activity::from_json(&raw)?;

        let key_id = extract_signature_key_id(headers)?;
        if !key_id_matches_actor(&key_id, &activity.actor) {
            tracing::warn!(key_id = %key_id, actor = %activity.actor, "Signature keyId does not match actor");
            return Err(AppError::SignatureInvalid);
        }

        if self.policy.is_blocked(&activity.actor).await {
            tracing::info!(actor = %activity.actor, "Rejected activity from blocked actor");
            return Err(AppError::Blocked);
        }

        let (public_key_pem, was_cached) = match self.key_cache.get(&key_id).await {
            Some(pem) => (pem, true),
            None => {
                let pem = fetch_public_key(&key_id, &self.http_client).await?;
                self.key_cache.put(&key_id, &pem).await;
                (pem, false)
            }
        };

        let verified = verify_signature(method, path, headers, Some(body), &public_key_pem);
        match verified {
            Ok(()) => {}
            Err(AppError::SignatureInvalid) if was_cached => {
                // The cached key may be stale after a remote rotation.
                self.key_cache.invalidate(&key_id).await;
                let pem = fetch_public_key(&key_id, &self.http_client).await?;
                self.key_cache.put(&key_id, &pem).await;
                verify_signature(method, path, headers, Some(body), &pem)?;
            }
            Err(e) => return Err(e),
        }

        ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind.as_str()])
            .inc();

        let result = self.dispatch(&activity, &raw).await;
        let status = if result.is_ok() { "applied" } else { "rejected" };
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", status])
            .inc();
        result
    }

    /// Apply a verified activity to local state.
    pub async fn dispatch(&self, activity: &Activity, raw: &Value) -> Result<Dispatched, AppError> {
        match activity.kind {
            ActivityKind::Follow => self.apply_follow(activity).await,
            ActivityKind::Accept => self.apply_accept(activity).await,
            ActivityKind::Create => self.apply_create(activity, raw).await,
            ActivityKind::Update => self.apply_update(activity, raw).await,
            ActivityKind::Delete => self.apply_delete(activity).await,
            ActivityKind::Like => self.apply_vote(activity, CollectionName::Likes).await,
            ActivityKind::Dislike => self.apply_vote(activity, CollectionName::Dislikes).await,
            ActivityKind::Flag => self.apply_flag(activity, raw).await,
            ActivityKind::Undo => self.apply_undo(activity).await,
        }
    }

    async fn local_actor(&self, actor_url: &str) -> Result<Value, AppError> {
        if !self.is_local(actor_url) {
            return Err(AppError::NotFound);
        }
        self.store
            .get_record(tables::ACTORS, actor_url)
            .await?
            .ok_or(AppError::NotFound)
    }

    async fn apply_follow(&self, activity: &Activity) -> Result<Dispatched, AppError> {
        let target = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Follow requires a target actor".to_string()))?
            .to_string();
        self.local_actor(&target).await?;

        let followers = collection_id(&target, CollectionName::Followers);
        self.collections
            .append(&followers, Value::from(activity.actor.clone()))
            .await?;

        let total = self.collections.total_items(&followers).await?;
        FOLLOWERS_TOTAL.set(total as i64);

        // Side record so the accepted relationship survives restarts.
        self.store
            .insert(
                tables::ACCEPTS,
                &serde_json::json!({
                    "id": activity.id,
                    "direction": "inbound",
                    "actor": activity.actor,
                    "object": target,
                    "accepted_at": chrono::Utc::now().to_rfc3339(),
                }),
            )
            .await?;

        let accept_id = format!("{}/accepts/{}", target, EntityId::new().0);
        let follow = object::build::follow(&activity.id, &activity.actor, &target);
        let accept = object::build::accept(&accept_id, &target, follow);

        tracing::info!(actor = %activity.actor, target = %target, "Follow applied");
        Ok(Dispatched {
            accept: Some(accept),
        })
    }

    async fn apply_accept(&self, activity: &Activity) -> Result<Dispatched, AppError> {
        // The object is the Follow we originally sent out.
        let (local_actor, remote_actor) = match &activity.object {
            ActivityObject::Embedded(follow) => {
                let actor = follow
                    .get("actor")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AppError::Validation("Accepted Follow is missing an actor".to_string())
                    })?;
                let object = follow
                    .get("object")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AppError::Validation("Accepted Follow is missing an object".to_string())
                    })?;
                (actor.to_string(), object.to_string())
            }
            ActivityObject::Reference(follow_id) => {
                let pending = self
                    .store
                    .get_record(tables::ACCEPTS, follow_id)
                    .await?
                    .ok_or(AppError::NotFollowing)?;
                let actor = pending
                    .get("actor")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AppError::Validation("Corrupt pending follow record".to_string())
                    })?;
                let object = pending
                    .get("object")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        AppError::Validation("Corrupt pending follow record".to_string())
                    })?;
                (actor.to_string(), object.to_string())
            }
        };

        self.local_actor(&local_actor).await?;
        if remote_actor != activity.actor {
            return Err(AppError::Validation(
                "Accept actor does not match the followed actor".to_string(),
            ));
        }

        let following = collection_id(&local_actor, CollectionName::Following);
        self.collections
            .append(&following, Value::from(remote_actor.clone()))
            .await?;

        tracing::info!(actor = %local_actor, target = %remote_actor, "Follow accepted");
        Ok(Dispatched::applied())
    }

    /// Local actors the sender is subscribed to (sender present in their
    /// followers collection). Content is only accepted along an existing
    /// follow relationship.
    async fn subscribed_recipients(&self, sender: &str) -> Result<Vec<String>, AppError> {
        let mut recipients = Vec::new();
        for actor_id in self.store.list_ids(tables::ACTORS).await? {
            let followers = collection_id(&actor_id, CollectionName::Followers);
            if self
                .collections
                .contains(&followers, &Value::from(sender))
                .await?
            {
                recipients.push(actor_id);
            }
        }
        Ok(recipients)
    }

    async fn apply_create(&self, activity: &Activity, raw: &Value) -> Result<Dispatched, AppError> {
        let ActivityObject::Embedded(embedded) = &activity.object else {
            return Err(AppError::Validation(
                "Create requires an embedded object".to_string(),
            ));
        };
        let object_id = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Object is missing an id".to_string()))?
            .to_string();

        let recipients = self.subscribed_recipients(&activity.actor).await?;
        let pooled = self.policy.is_pooled(&activity.actor).await;
        if recipients.is_empty() && !pooled {
            return Err(AppError::NotFollowing);
        }

        if self
            .store
            .get_record(tables::OBJECTS, &object_id)
            .await?
            .is_some()
        {
            return Err(AppError::DuplicateAction(object_id));
        }
        self.store.insert(tables::OBJECTS, embedded).await?;

        for recipient in &recipients {
            let inbox = collection_id(recipient, CollectionName::Inbox);
            match self.collections.append(&inbox, raw.clone()).await {
                Ok(()) | Err(AppError::DuplicateAction(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if pooled {
            let shared = collection_id(&self.local_origin, CollectionName::Inbox);
            match self.collections.append(&shared, raw.clone()).await {
                Ok(()) | Err(AppError::DuplicateAction(_)) => {}
                Err(e) => return Err(e),
            }
        }

        // Thread replies onto the parent's replies collection.
        if let Some(parent) = embedded.get("inReplyTo").and_then(Value::as_str) {
            if self.is_local(parent) {
                let replies = collection_id(parent, CollectionName::Replies);
                match self
                    .collections
                    .append(&replies, Value::from(object_id.clone()))
                    .await
                {
                    Ok(()) | Err(AppError::DuplicateAction(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::info!(actor = %activity.actor, object = %object_id, "Create applied");
        Ok(Dispatched::applied())
    }

    async fn apply_update(&self, activity: &Activity, raw: &Value) -> Result<Dispatched, AppError> {
        let ActivityObject::Embedded(embedded) = &activity.object else {
            return Err(AppError::Validation(
                "Update requires an embedded object".to_string(),
            ));
        };
        let object_id = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Object is missing an id".to_string()))?
            .to_string();

        let recipients = self.subscribed_recipients(&activity.actor).await?;
        if recipients.is_empty() && !self.policy.is_pooled(&activity.actor).await {
            return Err(AppError::NotFollowing);
        }

        let stored = self
            .store
            .get_record(tables::OBJECTS, &object_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if stored.get("attributedTo").and_then(Value::as_str) != Some(activity.actor.as_str()) {
            return Err(AppError::Unauthorized);
        }

        self.store.insert(tables::OBJECTS, embedded).await?;
        for recipient in &recipients {
            let inbox = collection_id(recipient, CollectionName::Inbox);
            match self.collections.append(&inbox, raw.clone()).await {
                Ok(()) | Err(AppError::DuplicateAction(_)) => {}
                Err(e) => return Err(e),
            }
        }

        tracing::info!(actor = %activity.actor, object = %object_id, "Update applied");
        Ok(Dispatched::applied())
    }

    async fn apply_delete(&self, activity: &Activity) -> Result<Dispatched, AppError> {
        let object_id = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Delete requires an object id".to_string()))?
            .to_string();

        let stored = self.store.get_record(tables::OBJECTS, &object_id).await?;
        if let Some(ref stored) = stored {
            if stored.get("attributedTo").and_then(Value::as_str) != Some(activity.actor.as_str())
            {
                return Err(AppError::Unauthorized);
            }
            self.store.delete(tables::OBJECTS, &object_id).await?;

            // Unthread from the parent's replies collection.
            if let Some(parent) = stored.get("inReplyTo").and_then(Value::as_str) {
                let replies = collection_id(parent, CollectionName::Replies);
                self.collections
                    .remove_by_value(&replies, &Value::from(object_id.clone()))
                    .await?;
            }
        }

        // Drop any inbox entries that carried the deleted object.
        let mut inboxes: Vec<String> = self
            .store
            .list_ids(tables::ACTORS)
            .await?
            .into_iter()
            .map(|actor| collection_id(&actor, CollectionName::Inbox))
            .collect();
        inboxes.push(collection_id(&self.local_origin, CollectionName::Inbox));

        for inbox in inboxes {
            let items = self.collections.items(&inbox).await?;
            for item in items {
                let carried = item
                    .get("object")
                    .map(|object| match object {
                        Value::String(url) => url == &object_id,
                        other => other.get("id").and_then(Value::as_str)
                            == Some(object_id.as_str()),
                    })
                    .unwrap_or(false);
                if carried {
                    self.collections.remove_by_value(&inbox, &item).await?;
                }
            }
        }

        tracing::info!(actor = %activity.actor, object = %object_id, "Delete applied");
        Ok(Dispatched::applied())
    }

    async fn apply_vote(
        &self,
        activity: &Activity,
        name: CollectionName,
    ) -> Result<Dispatched, AppError> {
        let object_id = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Vote requires an object id".to_string()))?
            .to_string();

        self.store
            .get_record(tables::OBJECTS, &object_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let votes = collection_id(&object_id, name);
        self.collections
            .append(&votes, Value::from(activity.actor.clone()))
            .await?;

        tracing::info!(actor = %activity.actor, object = %object_id, kind = name.as_str(), "Vote applied");
        Ok(Dispatched::applied())
    }

    async fn apply_flag(&self, activity: &Activity, raw: &Value) -> Result<Dispatched, AppError> {
        let object_id = activity
            .object
            .id()
            .ok_or_else(|| AppError::Validation("Flag requires an object id".to_string()))?
            .to_string();

        self.store
            .get_record(tables::OBJECTS, &object_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let flags = collection_id(&object_id, CollectionName::Flags);

        // One report per actor per object, whatever the stated reason.
        let existing = self.collections.items(&flags).await?;
        if existing
            .iter()
            .any(|item| item.get("actor").and_then(Value::as_str) == Some(activity.actor.as_str()))
        {
            return Err(AppError::DuplicateAction(activity.actor.clone()));
        }

        self.collections.append(&flags, raw.clone()).await?;
        tracing::info!(actor = %activity.actor, object = %object_id, "Flag recorded");
        Ok(Dispatched::applied())
    }

    async fn apply_undo(&self, activity: &Activity) -> Result<Dispatched, AppError> {
        let ActivityObject::Embedded(inner) = &activity.object else {
            return Err(AppError::Validation(
                "Undo requires the original activity embedded".to_string(),
            ));
        };

        let inner_kind = inner
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Undone activity has no type".to_string()))?;
        let inner_actor = inner.get("actor").and_then(Value::as_str).ok_or_else(|| {
            AppError::Validation("Undone activity has no actor".to_string())
        })?;
        let inner_object = inner
            .get("object")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Undone activity has no object".to_string()))?;

        // Only the original author may undo.
        if inner_actor != activity.actor {
            return Err(AppError::Unauthorized);
        }

        let collection = match inner_kind {
            "Follow" => {
                self.local_actor(inner_object).await?;
                collection_id(inner_object, CollectionName::Followers)
            }
            "Like" => collection_id(inner_object, CollectionName::Likes),
            "Dislike" => collection_id(inner_object, CollectionName::Dislikes),
            other => return Err(AppError::UnsupportedType(format!("Undo of {}", other))),
        };

        let removed = self
            .collections
            .remove_by_value(&collection, &Value::from(activity.actor.clone()))
            .await?;
        if !removed {
            return Err(AppError::NotFollowing);
        }

        if inner_kind == "Follow" {
            let total = self.collections.total_items(&collection).await?;
            FOLLOWERS_TOTAL.set(total as i64);
        }

        tracing::info!(actor = %activity.actor, kind = inner_kind, "Undo applied");
        Ok(Dispatched::applied())
    }
}
