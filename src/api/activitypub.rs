//! Federation endpoints
//!
//! Serves actor documents and ordered collections, accepts signed inbox
//! POSTs, and exposes the local publishing API that fans activities out to
//! followers.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;

use crate::AppState;
use crate::data::{EntityId, tables};
use crate::error::AppError;
use crate::federation::collection::{CollectionName, collection_id};
use crate::federation::object;

const ACTIVITY_JSON: &str = "application/activity+json";

fn activity_json(value: Value) -> Response {
    (
        [(header::CONTENT_TYPE, ACTIVITY_JSON)],
        Json(value),
    )
        .into_response()
}

/// GET /users/{username}
pub async fn get_actor(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
) -> Result<Response, AppError> {
    let actor_id = state.actor_id(&username);
    let record = state
        .store
        .get_record(tables::ACTORS, &actor_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let document = object::build::actor(
        &actor_id,
        &username,
        record
            .get("display_name")
            .and_then(Value::as_str)
            .unwrap_or(&username),
        record.get("summary").and_then(Value::as_str).unwrap_or(""),
        record
            .get("public_key_pem")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::KeyFormat("Actor record has no public key".to_string()))?,
    );

    Ok(activity_json(document))
}

/// POST /users/{username}/inbox
pub async fn post_inbox(
    State(state): State<Arc<AppState>>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let actor_id = state.actor_id(&username);
    state
        .store
        .get_record(tables::ACTORS, &actor_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let path = format!("/users/{}/inbox", username);
    let dispatched = state.inbox.receive("POST", &path, &headers, &body).await?;

    if let Some(accept) = dispatched.accept {
        state.deliver_accept(&actor_id, accept).await;
    }

    Ok(StatusCode::ACCEPTED)
}

/// GET /users/{username}/{collection}
///
/// Serves outbox, followers, following and liked.
pub async fn get_actor_collection(
    State(state): State<Arc<AppState>>,
    Path((username, collection)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let actor_id = state.actor_id(&username);
    state
        .store
        .get_record(tables::ACTORS, &actor_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let id = match collection.as_str() {
        "outbox" => collection_id(&actor_id, CollectionName::Outbox),
        "followers" => collection_id(&actor_id, CollectionName::Followers),
        "following" => collection_id(&actor_id, CollectionName::Following),
        "liked" => collection_id(&actor_id, CollectionName::Liked),
        _ => return Err(AppError::NotFound),
    };

    Ok(activity_json(state.collections.document(&id).await?))
}

/// GET /notes/{id}
pub async fn get_note(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let note_id = state.note_id(&id);
    let note = state
        .store
        .get_record(tables::OBJECTS, &note_id)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(activity_json(note))
}

/// GET /notes/{id}/{collection}
///
/// Serves replies, likes and dislikes for a local note.
pub async fn get_note_collection(
    State(state): State<Arc<AppState>>,
    Path((id, collection)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let note_id = state.note_id(&id);
    state
        .store
        .get_record(tables::OBJECTS, &note_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let name = match collection.as_str() {
        "replies" => CollectionName::Replies,
        "likes" => CollectionName::Likes,
        "dislikes" => CollectionName::Dislikes,
        _ => return Err(AppError::NotFound),
    };

    let id = collection_id(&note_id, name);
    Ok(activity_json(state.collections.document(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub content: String,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

/// POST /api/publish
///
/// Wraps the content in a Create, stores the note, appends to the local
/// actor's outbox and fans out to followers. Guarded by the admin token.
pub async fn publish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Result<Response, AppError> {
    state.require_admin(&headers)?;
    if request.content.trim().is_empty() {
        return Err(AppError::Validation("Content must not be empty".to_string()));
    }

    let actor = state.local_actor().await?;
    let note_id = format!("{}/notes/{}", state.base_url(), EntityId::new().0);
    let published = chrono::Utc::now().to_rfc3339();

    let mut note = object::build::note(&note_id, &actor.id, &request.content, &published);
    if let Some(parent) = &request.in_reply_to {
        note["inReplyTo"] = Value::from(parent.clone());
    }

    state.store.insert(tables::OBJECTS, &note).await?;

    if let Some(parent) = &request.in_reply_to {
        let replies = collection_id(parent, CollectionName::Replies);
        match state
            .collections
            .append(&replies, Value::from(note_id.clone()))
            .await
        {
            Ok(()) | Err(AppError::DuplicateAction(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let create_id = format!("{}/creates/{}", state.base_url(), EntityId::new().0);
    let create = object::build::create(&create_id, &actor.id, note);

    let outbox = collection_id(&actor.id, CollectionName::Outbox);
    state.collections.append(&outbox, create.clone()).await?;

    let followers = state
        .collections
        .items(&collection_id(&actor.id, CollectionName::Followers))
        .await?
        .into_iter()
        .filter_map(|item| item.as_str().map(str::to_string))
        .collect::<Vec<_>>();

    let summary = state.delivery.deliver(&create, &actor, &followers).await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": note_id,
            "activity": create_id,
            "attempted": summary.attempted,
            "failed": summary.failed,
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct FollowRequest {
    pub target: String,
}

/// POST /api/follow
///
/// Sends a Follow to a remote actor and records it as pending until the
/// Accept comes back.
pub async fn follow(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<FollowRequest>,
) -> Result<Response, AppError> {
    state.require_admin(&headers)?;

    if state.policy.is_blocked(&request.target).await {
        return Err(AppError::Blocked);
    }

    let actor = state.local_actor().await?;
    let follow_id = format!("{}/follows/{}", actor.id, EntityId::new().0);
    let follow = object::build::follow(&follow_id, &actor.id, &request.target);

    state
        .store
        .insert(
            tables::ACCEPTS,
            &serde_json::json!({
                "id": follow_id,
                "direction": "outbound",
                "actor": actor.id,
                "object": request.target,
            }),
        )
        .await?;

    let summary = state
        .delivery
        .deliver(&follow, &actor, std::slice::from_ref(&request.target))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "id": follow_id,
            "attempted": summary.attempted,
            "failed": summary.failed,
        })),
    )
        .into_response())
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
