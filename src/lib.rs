//! Driftwood: a small federated content node.
//!
//! Exchanges activities with peer instances over signed HTTP, maintains
//! per-actor ordered collections, and enforces a persistent block/pool
//! policy on everything that crosses the instance boundary.

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::data::{ActorRecord, Store, tables};
use crate::error::AppError;
use crate::federation::collection::{CollectionName, Collections, collection_id};
use crate::federation::delivery::DeliveryEngine;
use crate::federation::inbox::InboxProcessor;
use crate::federation::key_cache::PublicKeyCache;
use crate::federation::keys::{KeyStore, generate_actor_keypair};
use crate::federation::policy::PolicyGate;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<Store>,
    pub keys: Arc<KeyStore>,
    pub collections: Arc<Collections>,
    pub policy: Arc<PolicyGate>,
    pub key_cache: Arc<PublicKeyCache>,
    pub http_client: reqwest::Client,
    pub inbox: Arc<InboxProcessor>,
    pub delivery: Arc<DeliveryEngine>,
}

impl AppState {
    /// Initialize state against the configured database.
    pub async fn new(config: AppConfig) -> Result<Arc<Self>, AppError> {
        let store = Arc::new(Store::connect(&config.database.path).await?);
        Self::with_store(config, store).await
    }

    /// Initialize state over an existing store (tests use this with an
    /// in-memory database).
    pub async fn with_store(config: AppConfig, store: Arc<Store>) -> Result<Arc<Self>, AppError> {
        let keys = Arc::new(
            KeyStore::load_or_init(
                store.clone(),
                Duration::from_secs(config.federation.key_lifetime_seconds),
            )
            .await?,
        );
        let collections = Arc::new(Collections::new(store.clone()));
        let policy = Arc::new(PolicyGate::load(store.clone()).await?);
        let key_cache = Arc::new(PublicKeyCache::new(Duration::from_secs(
            config.federation.key_cache_ttl_seconds,
        )));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.federation.delivery_timeout_seconds))
            .user_agent(concat!("driftwood/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let base_url = config.server.base_url();
        let inbox = Arc::new(InboxProcessor::new(
            store.clone(),
            collections.clone(),
            policy.clone(),
            key_cache.clone(),
            http_client.clone(),
            base_url.clone(),
        ));
        let delivery = Arc::new(DeliveryEngine::new(
            http_client.clone(),
            collections.clone(),
            policy.clone(),
            base_url,
            config.federation.max_concurrent_deliveries,
        ));

        let state = Arc::new(Self {
            config,
            store,
            keys,
            collections,
            policy,
            key_cache,
            http_client,
            inbox,
            delivery,
        });
        state.ensure_local_actor().await?;
        Ok(state)
    }

    pub fn base_url(&self) -> String {
        self.config.server.base_url()
    }

    pub fn actor_id(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url(), username)
    }

    pub fn note_id(&self, id: &str) -> String {
        format!("{}/notes/{}", self.base_url(), id)
    }

    /// Create the configured local actor and its collections on first run.
    pub async fn ensure_local_actor(&self) -> Result<(), AppError> {
        let actor_id = self.actor_id(&self.config.actor.username);

        if self
            .store
            .get_record(tables::ACTORS, &actor_id)
            .await?
            .is_none()
        {
            let (public_key_pem, private_key_pem) = generate_actor_keypair()?;
            let record = ActorRecord {
                id: actor_id.clone(),
                username: self.config.actor.username.clone(),
                display_name: Some(self.config.actor.display_name.clone()),
                summary: self.config.actor.summary.clone(),
                public_key_pem,
                private_key_pem,
                created_at: chrono::Utc::now(),
            };
            let value =
                serde_json::to_value(&record).map_err(|e| AppError::Internal(e.into()))?;
            self.store.insert(tables::ACTORS, &value).await?;
            tracing::info!(actor = %actor_id, "Local actor created");
        }

        for name in [
            CollectionName::Inbox,
            CollectionName::Outbox,
            CollectionName::Followers,
            CollectionName::Following,
            CollectionName::Liked,
        ] {
            self.collections
                .ensure(&collection_id(&actor_id, name))
                .await?;
        }
        // Instance-shared inbox for pooled content.
        self.collections
            .ensure(&collection_id(&self.base_url(), CollectionName::Inbox))
            .await?;

        Ok(())
    }

    /// The configured local actor's full record.
    pub async fn local_actor(&self) -> Result<ActorRecord, AppError> {
        let actor_id = self.actor_id(&self.config.actor.username);
        let record = self
            .store
            .get_record(tables::ACTORS, &actor_id)
            .await?
            .ok_or(AppError::NotFound)?;
        serde_json::from_value(record)
            .map_err(|e| AppError::Validation(format!("Corrupt actor record: {}", e)))
    }

    /// Check the admin bearer token.
    pub fn require_admin(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let presented = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        if presented != self.config.admin.token {
            return Err(AppError::Unauthorized);
        }
        Ok(())
    }

    /// Deliver an Accept back to the follower, off the request path.
    pub async fn deliver_accept(&self, local_actor_id: &str, accept: serde_json::Value) {
        let follower = accept
            .get("object")
            .and_then(|follow| follow.get("actor"))
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        let Some(follower) = follower else {
            tracing::warn!("Accept payload has no follower to deliver to");
            return;
        };

        let record = match self.store.get_record(tables::ACTORS, local_actor_id).await {
            Ok(Some(record)) => record,
            _ => {
                tracing::warn!(actor = %local_actor_id, "Cannot deliver Accept for unknown actor");
                return;
            }
        };
        let sender: ActorRecord = match serde_json::from_value(record) {
            Ok(sender) => sender,
            Err(e) => {
                tracing::error!(error = %e, "Corrupt actor record");
                return;
            }
        };

        let delivery = self.delivery.clone();
        tokio::spawn(async move {
            if let Err(e) = delivery.deliver(&accept, &sender, &[follower]).await {
                tracing::warn!(error = %e, "Accept delivery failed");
            }
        });
    }
}

/// Build the application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Federation surface
        .route("/users/:username", get(api::activitypub::get_actor))
        .route("/users/:username/inbox", post(api::activitypub::post_inbox))
        .route(
            "/users/:username/:collection",
            get(api::activitypub::get_actor_collection),
        )
        .route("/notes/:id", get(api::activitypub::get_note))
        .route(
            "/notes/:id/:collection",
            get(api::activitypub::get_note_collection),
        )
        // Local publishing
        .route("/api/publish", post(api::activitypub::publish))
        .route("/api/follow", post(api::activitypub::follow))
        // Policy administration
        .route("/api/admin/block", post(api::admin::block))
        .route("/api/admin/unblock", post(api::admin::unblock))
        .route("/api/admin/pool", post(api::admin::pool))
        .route("/api/admin/unpool", post(api::admin::unpool))
        .route("/api/admin/policy", get(api::admin::policy))
        .route("/api/admin/rotate-key", post(api::admin::rotate_key))
        // Operational
        .route("/metrics", get(api::metrics::metrics))
        .route("/health", get(api::activitypub::health))
        .layer(axum::middleware::from_fn(api::metrics::track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}
