//! Activity delivery
//!
//! Fans an activity out to recipient inboxes. Local recipients are applied
//! directly through the collection engine; remote recipients get a signed
//! HTTP POST. Remote sends run as bounded concurrent tasks and each task
//! returns its own result, which the caller folds into a summary.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;

use crate::data::ActorRecord;
use crate::error::AppError;
use crate::federation::collection::{CollectionName, Collections, collection_id};
use crate::federation::policy::{PolicyGate, origin_of};
use crate::federation::signature::{
    extract_actor_host, fetch_remote_actor, sign_request, validate_resolved_host,
};
use crate::metrics::{ACTIVITIES_SENT, DELIVERY_FAILURES_TOTAL, FEDERATION_REQUESTS_TOTAL};

/// Outcome of one recipient delivery.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub target: String,
    pub delivered: bool,
    pub detail: Option<String>,
}

/// Aggregate outcome of a fan-out.
#[derive(Debug, Clone)]
pub struct DeliverySummary {
    pub attempted: usize,
    pub failed: usize,
    pub results: Vec<DeliveryResult>,
}

/// Delivers activities to local and remote inboxes.
pub struct DeliveryEngine {
    http_client: reqwest::Client,
    collections: Arc<Collections>,
    policy: Arc<PolicyGate>,
    local_origin: String,
    max_concurrent: usize,
}

impl DeliveryEngine {
    pub fn new(
        http_client: reqwest::Client,
        collections: Arc<Collections>,
        policy: Arc<PolicyGate>,
        local_origin: String,
        max_concurrent: usize,
    ) -> Self {
        Self {
            http_client,
            collections,
            policy,
            local_origin,
            max_concurrent: max_concurrent.max(1),
        }
    }

    fn is_local(&self, actor_url: &str) -> bool {
        origin_of(actor_url)
            .map(|origin| origin == self.local_origin)
            .unwrap_or(false)
    }

    /// Deliver an activity to every recipient actor, once each.
    ///
    /// Recipients are deduplicated first. A policy-blocked remote recipient
    /// is skipped without a request and counted as a failure. Redelivery to
    /// a local inbox that already holds the activity counts as delivered.
    pub async fn deliver(
        &self,
        activity: &Value,
        sender: &ActorRecord,
        recipients: &[String],
    ) -> Result<DeliverySummary, AppError> {
        let mut unique: Vec<String> = Vec::new();
        for recipient in recipients {
            if !unique.contains(recipient) {
                unique.push(recipient.clone());
            }
        }

        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Unserializable activity: {}", e)))?;
        let key_id = format!("{}#main-key", sender.id);

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut remote_handles = Vec::new();
        let mut results = Vec::new();

        for target in unique {
            if self.is_local(&target) {
                results.push(self.deliver_local(&target, activity).await);
                continue;
            }

            if self.policy.is_blocked(&target).await {
                tracing::debug!(target = %target, "Skipping delivery to blocked target");
                results.push(DeliveryResult {
                    target,
                    delivered: false,
                    detail: Some("blocked by policy".to_string()),
                });
                continue;
            }

            let semaphore = semaphore.clone();
            let http_client = self.http_client.clone();
            let body = body.clone();
            let key_id = key_id.clone();
            let private_key_pem = sender.private_key_pem.clone();

            remote_handles.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return DeliveryResult {
                            target,
                            delivered: false,
                            detail: Some("delivery pool closed".to_string()),
                        };
                    }
                };
                deliver_remote(&http_client, &target, &body, &private_key_pem, &key_id).await
            }));
        }

        for handle in remote_handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::error!(error = %e, "Delivery task panicked");
                    results.push(DeliveryResult {
                        target: "unknown".to_string(),
                        delivered: false,
                        detail: Some(e.to_string()),
                    });
                }
            }
        }

        let attempted = results.len();
        let failed = results.iter().filter(|r| !r.delivered).count();

        let activity_type = activity
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        ACTIVITIES_SENT
            .with_label_values(&[activity_type])
            .inc_by(attempted.saturating_sub(failed) as u64);
        for result in results.iter().filter(|r| !r.delivered) {
            let reason = match result.detail.as_deref() {
                Some("blocked by policy") => "policy",
                _ => "transport",
            };
            DELIVERY_FAILURES_TOTAL.with_label_values(&[reason]).inc();
        }
        tracing::info!(attempted, failed, "Delivery fan-out complete");

        Ok(DeliverySummary {
            attempted,
            failed,
            results,
        })
    }

    async fn deliver_local(&self, target: &str, activity: &Value) -> DeliveryResult {
        let inbox = collection_id(target, CollectionName::Inbox);
        match self.collections.append(&inbox, activity.clone()).await {
            Ok(()) => DeliveryResult {
                target: target.to_string(),
                delivered: true,
                detail: None,
            },
            // Redelivery is not a failure.
            Err(AppError::DuplicateAction(_)) => DeliveryResult {
                target: target.to_string(),
                delivered: true,
                detail: Some("already delivered".to_string()),
            },
            Err(e) => DeliveryResult {
                target: target.to_string(),
                delivered: false,
                detail: Some(e.to_string()),
            },
        }
    }
}

async fn deliver_remote(
    http_client: &reqwest::Client,
    target: &str,
    body: &[u8],
    private_key_pem: &str,
    key_id: &str,
) -> DeliveryResult {
    let result = attempt_remote(http_client, target, body, private_key_pem, key_id).await;

    let status = if result.delivered { "delivered" } else { "failed" };
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["outbound", status])
        .inc();
    result
}

async fn attempt_remote(
    http_client: &reqwest::Client,
    target: &str,
    body: &[u8],
    private_key_pem: &str,
    key_id: &str,
) -> DeliveryResult {
    let failure = |detail: String| DeliveryResult {
        target: target.to_string(),
        delivered: false,
        detail: Some(detail),
    };

    // The recipient's actor document names its inbox.
    let actor_doc = match fetch_remote_actor(target, http_client).await {
        Ok(doc) => doc,
        Err(e) => return failure(e.to_string()),
    };
    let Some(inbox_url) = actor_doc.get("inbox").and_then(Value::as_str) else {
        return failure("actor document has no inbox".to_string());
    };

    // The advertised inbox may live on a different host than the actor id.
    let inbox_host = match extract_actor_host(inbox_url) {
        Ok(host) => host,
        Err(e) => return failure(e.to_string()),
    };
    let inbox_port = url::Url::parse(inbox_url)
        .ok()
        .and_then(|u| u.port_or_known_default())
        .unwrap_or(443);
    if let Err(e) = validate_resolved_host(&inbox_host, inbox_port).await {
        return failure(e.to_string());
    }

    let headers = match sign_request("POST", inbox_url, Some(body), private_key_pem, key_id) {
        Ok(headers) => headers,
        Err(e) => return failure(format!("signing failed: {}", e)),
    };

    let mut request = http_client
        .post(inbox_url)
        .header("Content-Type", "application/activity+json")
        .header("Date", &headers.date)
        .header("Signature", &headers.signature)
        .body(body.to_vec());
    if let Some(digest) = &headers.digest {
        request = request.header("Digest", digest);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(target = %target, "Activity delivered");
            DeliveryResult {
                target: target.to_string(),
                delivered: true,
                detail: None,
            }
        }
        Ok(response) => failure(format!("HTTP {}", response.status())),
        Err(e) => failure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Store;
    use crate::federation::keys::generate_actor_keypair;
    use crate::federation::policy::PolicyScope;
    use chrono::Utc;

    const LOCAL_ORIGIN: &str = "https://local.example";

    async fn engine() -> (DeliveryEngine, Arc<Collections>, Arc<PolicyGate>) {
        let store = Arc::new(Store::connect_in_memory().await.expect("store"));
        let collections = Arc::new(Collections::new(store.clone()));
        let policy = Arc::new(PolicyGate::load(store).await.expect("policy"));

        let engine = DeliveryEngine::new(
            reqwest::Client::new(),
            collections.clone(),
            policy.clone(),
            LOCAL_ORIGIN.to_string(),
            4,
        );
        (engine, collections, policy)
    }

    fn sender() -> ActorRecord {
        let (public_key_pem, private_key_pem) = generate_actor_keypair().expect("keypair");
        ActorRecord {
            id: format!("{}/users/alice", LOCAL_ORIGIN),
            username: "alice".to_string(),
            display_name: None,
            summary: None,
            public_key_pem,
            private_key_pem,
            created_at: Utc::now(),
        }
    }

    fn activity() -> Value {
        serde_json::json!({
            "id": "https://local.example/create/1",
            "type": "Create",
            "actor": "https://local.example/users/alice",
            "object": { "id": "https://local.example/notes/1", "type": "Note", "content": "hi" }
        })
    }

    #[tokio::test]
    async fn local_recipients_get_an_inbox_append() {
        let (engine, collections, _) = engine().await;
        let recipients = vec![format!("{}/users/carol", LOCAL_ORIGIN)];

        let summary = engine
            .deliver(&activity(), &sender(), &recipients)
            .await
            .expect("deliver");

        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.failed, 0);

        let inbox = collection_id(&recipients[0], CollectionName::Inbox);
        assert_eq!(collections.total_items(&inbox).await.expect("total"), 1);
    }

    #[tokio::test]
    async fn redelivery_to_local_inbox_is_not_a_failure() {
        let (engine, collections, _) = engine().await;
        let recipients = vec![format!("{}/users/carol", LOCAL_ORIGIN)];

        engine
            .deliver(&activity(), &sender(), &recipients)
            .await
            .expect("deliver");
        let summary = engine
            .deliver(&activity(), &sender(), &recipients)
            .await
            .expect("redeliver");

        assert_eq!(summary.failed, 0);
        let inbox = collection_id(&recipients[0], CollectionName::Inbox);
        assert_eq!(collections.total_items(&inbox).await.expect("total"), 1);
    }

    #[tokio::test]
    async fn blocked_remote_recipient_is_skipped_and_counted_failed() {
        let (engine, _, policy) = engine().await;
        policy
            .block(PolicyScope::Instance, "https://blocked.example")
            .await
            .expect("block");

        let recipients = vec![
            format!("{}/users/carol", LOCAL_ORIGIN),
            "https://blocked.example/users/mallory".to_string(),
        ];
        let summary = engine
            .deliver(&activity(), &sender(), &recipients)
            .await
            .expect("deliver");

        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.failed, 1);

        let blocked = summary
            .results
            .iter()
            .find(|r| r.target.contains("blocked.example"))
            .expect("blocked result");
        assert!(!blocked.delivered);
        assert_eq!(blocked.detail.as_deref(), Some("blocked by policy"));
    }

    #[tokio::test]
    async fn duplicate_recipients_are_delivered_once() {
        let (engine, collections, _) = engine().await;
        let carol = format!("{}/users/carol", LOCAL_ORIGIN);
        let recipients = vec![carol.clone(), carol.clone()];

        let summary = engine
            .deliver(&activity(), &sender(), &recipients)
            .await
            .expect("deliver");

        assert_eq!(summary.attempted, 1);
        let inbox = collection_id(&carol, CollectionName::Inbox);
        assert_eq!(collections.total_items(&inbox).await.expect("total"), 1);
    }
}
