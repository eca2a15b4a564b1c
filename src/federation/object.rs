//! Object model
//!
//! Typed construction of Activity/Actor/Collection JSON payloads, plus the
//! parsed activity envelope used by the inbox dispatcher. Constructors are
//! total and side-effect-free; callers supply all identifiers up front.

use serde_json::Value;

use crate::error::AppError;

/// The fixed vocabulary context marker stamped on every payload.
///
/// Activities are exchanged as flat JSON; no context resolution happens.
pub const CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Closed set of activity kinds this node understands.
///
/// Dispatch is an exhaustive match over this enum; anything outside the
/// vocabulary fails at parse time with `UnsupportedType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Create,
    Update,
    Delete,
    Like,
    Dislike,
    Undo,
    Follow,
    Accept,
    Flag,
}

impl ActivityKind {
    /// Parse an activity kind from its wire name.
    ///
    /// `Remove` is accepted as an alias for `Delete`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Delete" | "Remove" => Some(Self::Delete),
            "Like" => Some(Self::Like),
            "Dislike" => Some(Self::Dislike),
            "Undo" => Some(Self::Undo),
            "Follow" => Some(Self::Follow),
            "Accept" => Some(Self::Accept),
            "Flag" => Some(Self::Flag),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Like => "Like",
            Self::Dislike => "Dislike",
            Self::Undo => "Undo",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Flag => "Flag",
        }
    }
}

/// The object slot of an activity: embedded or a bare reference URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityObject {
    Reference(String),
    Embedded(Value),
}

impl ActivityObject {
    /// The object's identifier URL, whichever representation it uses.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Reference(url) => Some(url),
            Self::Embedded(value) => value.get("id").and_then(Value::as_str),
        }
    }
}

/// A parsed inbound activity envelope.
#[derive(Debug, Clone)]
pub struct Activity {
    pub id: String,
    pub kind: ActivityKind,
    pub actor: String,
    pub object: ActivityObject,
}

impl Activity {
    /// Parse and validate a flat JSON activity.
    ///
    /// `type` determines which fields are required: `Follow`/`Accept` need
    /// an actor-URL object reference, `Create`/`Update` an embedded object
    /// with an id. Unknown types are `UnsupportedType`.
    pub fn from_json(value: &Value) -> Result<Self, AppError> {
        let kind_str = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?;

        let kind = ActivityKind::parse(kind_str)
            .ok_or_else(|| AppError::UnsupportedType(kind_str.to_string()))?;

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Missing activity id".to_string()))?
            .to_string();

        let actor = value
            .get("actor")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?
            .to_string();

        let raw_object = value
            .get("object")
            .ok_or_else(|| AppError::Validation("Missing object field".to_string()))?;

        let object = match raw_object {
            Value::String(url) => ActivityObject::Reference(url.clone()),
            Value::Object(_) => ActivityObject::Embedded(raw_object.clone()),
            _ => {
                return Err(AppError::Validation(
                    "Object must be a URL or an embedded object".to_string(),
                ));
            }
        };

        match kind {
            ActivityKind::Follow | ActivityKind::Accept => {
                // The object names an actor.
                if object.id().is_none() {
                    return Err(AppError::Validation(format!(
                        "{} requires an actor URL object",
                        kind.as_str()
                    )));
                }
            }
            ActivityKind::Create | ActivityKind::Update => {
                let ActivityObject::Embedded(ref embedded) = object else {
                    return Err(AppError::Validation(format!(
                        "{} requires an embedded object",
                        kind.as_str()
                    )));
                };
                if embedded.get("id").and_then(Value::as_str).is_none() {
                    return Err(AppError::Validation(
                        "Embedded object is missing an id".to_string(),
                    ));
                }
            }
            _ => {
                if object.id().is_none() {
                    return Err(AppError::Validation(format!(
                        "{} requires an object reference",
                        kind.as_str()
                    )));
                }
            }
        }

        Ok(Self {
            id,
            kind,
            actor,
            object,
        })
    }
}

/// Build federation JSON payloads.
pub mod build {
    use serde_json::Value;

    use super::CONTEXT;

    /// Build a content Object (Note-like post, comment or list entry)
    ///
    /// # Arguments
    /// * `id` - Object ID (unique URI)
    /// * `attributed_to` - Actor URI (creator)
    /// * `content` - Content body
    /// * `published` - Publication timestamp (RFC3339)
    pub fn note(id: &str, attributed_to: &str, content: &str, published: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content,
            "published": published,
            "tag": [],
            "replies": format!("{}/replies", id),
            "to": [format!("{}/followers", attributed_to)]
        })
    }

    /// Build a vote activity (`Like` or `Dislike`)
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `kind` - "Like" or "Dislike"
    /// * `actor` - Actor URI (voter)
    /// * `object` - Object URI being voted on
    pub fn vote(id: &str, kind: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": kind,
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Actor descriptor
    ///
    /// # Arguments
    /// * `id` - Actor URL
    /// * `username` - Preferred username
    /// * `display_name` - Display name
    /// * `summary` - Profile summary
    /// * `public_key_pem` - RSA public key (PEM)
    pub fn actor(
        id: &str,
        username: &str,
        display_name: &str,
        summary: &str,
        public_key_pem: &str,
    ) -> Value {
        serde_json::json!({
            "@context": [CONTEXT, "https://w3id.org/security/v1"],
            "type": "Person",
            "id": id,
            "preferredUsername": username,
            "name": display_name,
            "summary": summary,
            "inbox": format!("{}/inbox", id),
            "outbox": format!("{}/outbox", id),
            "followers": format!("{}/followers", id),
            "following": format!("{}/following", id),
            "liked": format!("{}/liked", id),
            "publicKey": {
                "id": format!("{}#main-key", id),
                "owner": id,
                "publicKeyPem": public_key_pem
            }
        })
    }

    /// Build a Create activity wrapping an object
    pub fn create(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": object,
            "to": [format!("{}/followers", actor)],
            "published": chrono::Utc::now().to_rfc3339()
        })
    }

    /// Build a Follow activity
    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Accept activity (reply to a Follow or invitation)
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (accepter)
    /// * `object` - Original activity being accepted
    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build an Undo activity
    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object
        })
    }

    /// Build a Flag activity
    ///
    /// # Arguments
    /// * `id` - Activity ID (unique URI)
    /// * `actor` - Actor URI (reporter)
    /// * `object` - Object URI being reported
    /// * `summary` - Report reason
    pub fn flag(id: &str, actor: &str, object: &str, summary: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "Flag",
            "id": id,
            "actor": actor,
            "object": object,
            "summary": summary
        })
    }

    /// Build an empty OrderedCollection seeded with the given id
    pub fn empty_collection(id: &str) -> Value {
        serde_json::json!({
            "@context": CONTEXT,
            "type": "OrderedCollection",
            "id": id,
            "totalItems": 0,
            "orderedItems": []
        })
    }
}
