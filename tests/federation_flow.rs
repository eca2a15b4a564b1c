//! End-to-end router tests against an in-memory database.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use driftwood::config::{
    ActorConfig, AdminConfig, AppConfig, DatabaseConfig, FederationConfig, LoggingConfig,
    ServerConfig,
};
use driftwood::data::Store;
use driftwood::federation::keys::generate_actor_keypair;
use driftwood::federation::signature::sign_request;
use driftwood::{AppState, build_router};
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "integration-test-admin-token-0123456789";

fn test_config() -> AppConfig {
    AppConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            domain: "local.example".to_string(),
            protocol: "https".to_string(),
        },
        database: DatabaseConfig {
            path: PathBuf::from(":memory:"),
        },
        federation: FederationConfig {
            key_lifetime_seconds: 3600,
            key_cache_ttl_seconds: 3600,
            delivery_timeout_seconds: 5,
            max_concurrent_deliveries: 4,
        },
        actor: ActorConfig {
            username: "admin".to_string(),
            display_name: "Admin".to_string(),
            summary: Some("test instance".to_string()),
        },
        admin: AdminConfig {
            token: ADMIN_TOKEN.to_string(),
        },
        logging: LoggingConfig {
            level: "warn".to_string(),
            format: "pretty".to_string(),
        },
    }
}

async fn test_app() -> (Router, Arc<AppState>) {
    let store = Arc::new(Store::connect_in_memory().await.expect("store"));
    let state = AppState::with_store(test_config(), store)
        .await
        .expect("state");
    (build_router(state.clone()), state)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder
        .body(Body::from(serde_json::to_vec(&body).expect("body")))
        .expect("request")
}

#[tokio::test]
async fn actor_document_is_served_as_activity_json() {
    let (app, _) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/users/admin")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
        Some("application/activity+json")
    );

    let actor = body_json(response).await;
    assert_eq!(actor["id"], "https://local.example/users/admin");
    assert_eq!(actor["preferredUsername"], "admin");
    assert_eq!(
        actor["publicKey"]["id"],
        "https://local.example/users/admin#main-key"
    );
}

#[tokio::test]
async fn liked_collection_is_served_at_the_advertised_url() {
    let (app, _) = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/users/admin")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let actor = body_json(response).await;
    assert_eq!(actor["liked"], "https://local.example/users/admin/liked");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/users/admin/liked")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let liked = body_json(response).await;
    assert_eq!(liked["type"], "OrderedCollection");
    assert_eq!(liked["id"], "https://local.example/users/admin/liked");
    assert_eq!(liked["totalItems"], 0);
}

#[tokio::test]
async fn unknown_actor_is_404() {
    let (app, _) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/users/ghost")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unsigned_inbox_post_is_rejected() {
    let (app, _) = test_app().await;

    let activity = serde_json::json!({
        "id": "https://remote.example/follow/1",
        "type": "Follow",
        "actor": "https://remote.example/users/bob",
        "object": "https://local.example/users/admin",
    });
    let response = app
        .oneshot(json_request("POST", "/users/admin/inbox", None, activity))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "Missing Signature header");
}

#[tokio::test]
async fn signed_follow_lands_in_followers_collection() {
    let (app, state) = test_app().await;

    let remote_actor = "https://remote.example/users/bob";
    let key_id = format!("{}#main-key", remote_actor);
    let (public_pem, private_pem) = generate_actor_keypair().expect("keypair");
    state.key_cache.put(&key_id, &public_pem).await;

    let body = serde_json::to_vec(&serde_json::json!({
        "id": "https://remote.example/follow/1",
        "type": "Follow",
        "actor": remote_actor,
        "object": "https://local.example/users/admin",
    }))
    .expect("body");

    let signed = sign_request(
        "POST",
        "https://local.example/users/admin/inbox",
        Some(&body),
        &private_pem,
        &key_id,
    )
    .expect("sign");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/users/admin/inbox")
                .header("host", "local.example")
                .header("date", &signed.date)
                .header("digest", signed.digest.as_deref().expect("digest"))
                .header("signature", &signed.signature)
                .header(header::CONTENT_TYPE, "application/activity+json")
                .body(Body::from(body))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/users/admin/followers")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let followers = body_json(response).await;
    assert_eq!(followers["totalItems"], 1);
    assert_eq!(followers["orderedItems"][0], remote_actor);
}

#[tokio::test]
async fn admin_policy_endpoints_require_the_token() {
    let (app, _) = test_app().await;

    let request = serde_json::json!({ "scope": "instance", "target": "https://bad.example" });

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/admin/block", None, request.clone()))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/admin/block",
            Some("wrong-token-wrong-token-wrong-token"),
            request.clone(),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/admin/block",
            Some(ADMIN_TOKEN),
            request,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn blocking_twice_conflicts_and_policy_lists_entries() {
    let (app, _) = test_app().await;
    let request = serde_json::json!({ "scope": "instance", "target": "https://bad.example" });

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/admin/block",
            Some(ADMIN_TOKEN),
            request.clone(),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/admin/block",
            Some(ADMIN_TOKEN),
            request,
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/admin/policy")
                .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let policy = body_json(response).await;
    assert_eq!(policy["blocked"][0], "https://bad.example");
}

#[tokio::test]
async fn blocked_sender_is_refused_at_the_inbox() {
    let (app, state) = test_app().await;
    state
        .policy
        .block(
            driftwood::federation::policy::PolicyScope::Instance,
            "https://bad.example",
        )
        .await
        .expect("block");

    let body = serde_json::json!({
        "id": "https://bad.example/follow/1",
        "type": "Follow",
        "actor": "https://bad.example/users/mallory",
        "object": "https://local.example/users/admin",
    });
    let signature = "keyId=\"https://bad.example/users/mallory#main-key\",algorithm=\"hs2019\",headers=\"(request-target) host date digest\",signature=\"ZmFrZQ==\"";

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/users/admin/inbox")
                .header("signature", signature)
                .header(header::CONTENT_TYPE, "application/activity+json")
                .body(Body::from(serde_json::to_vec(&body).expect("body")))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn publish_appends_to_outbox_and_serves_the_note() {
    let (app, _) = test_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/publish",
            Some(ADMIN_TOKEN),
            serde_json::json!({ "content": "first post" }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let note_id = created["id"].as_str().expect("note id").to_string();
    assert_eq!(created["failed"], 0);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/users/admin/outbox")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let outbox = body_json(response).await;
    assert_eq!(outbox["totalItems"], 1);
    assert_eq!(outbox["orderedItems"][0]["type"], "Create");

    let path = note_id
        .strip_prefix("https://local.example")
        .expect("local note id");
    let response = app
        .oneshot(
            Request::builder()
                .uri(path)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let note = body_json(response).await;
    assert_eq!(note["content"], "first post");
}

#[tokio::test]
async fn publish_requires_content() {
    let (app, _) = test_app().await;

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/publish",
            Some(ADMIN_TOKEN),
            serde_json::json!({ "content": "   " }),
        ))
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reply_threads_onto_the_parent_replies_collection() {
    let (app, _) = test_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/publish",
            Some(ADMIN_TOKEN),
            serde_json::json!({ "content": "parent" }),
        ))
        .await
        .expect("response");
    let parent_id = body_json(response).await["id"]
        .as_str()
        .expect("id")
        .to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/publish",
            Some(ADMIN_TOKEN),
            serde_json::json!({ "content": "child", "in_reply_to": parent_id }),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let child_id = body_json(response).await["id"]
        .as_str()
        .expect("id")
        .to_string();

    let path = format!(
        "{}/replies",
        parent_id.strip_prefix("https://local.example").expect("local")
    );
    let response = app
        .oneshot(
            Request::builder()
                .uri(&path)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let replies = body_json(response).await;
    assert_eq!(replies["totalItems"], 1);
    assert_eq!(replies["orderedItems"][0], child_id.as_str());
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let (app, _) = test_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}
