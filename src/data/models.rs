//! Data models
//!
//! Rust structs for records persisted through the store.
//! All models use ULID for generated IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Actor
// =============================================================================

/// A local actor record
///
/// Remote actors are never persisted in full; only their URLs appear in
/// collections and their key material in the public key cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorRecord {
    /// Stable actor URL, immutable after registration
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    /// RSA public key (PEM format)
    pub public_key_pem: String,
    /// RSA private key (PEM format), never serialized into actor documents
    pub private_key_pem: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Key material
// =============================================================================

/// Persisted instance signing key material
///
/// `proof` is a fixed plaintext signed with the key, checked after reload
/// to confirm the stored secret is still the expected one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub created_at: DateTime<Utc>,
    /// Base64 HMAC of [`crate::federation::KEY_PROOF_PLAINTEXT`]
    pub proof: String,
    /// Base64-encoded 32-byte secret
    pub secret: String,
}

// =============================================================================
// Federation policy
// =============================================================================

/// Persisted block/pool policy sets
///
/// Entries are exact actor URLs or origins (`https://host[:port]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyRecord {
    #[serde(default)]
    pub blocked: Vec<String>,
    #[serde(default)]
    pub pooled: Vec<String>,
}
