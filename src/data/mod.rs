//! Data layer
//!
//! - `store`: SQLite-backed opaque-record store (the persistence collaborator)
//! - `models`: typed records persisted through the store

mod models;
mod store;

pub use models::{ActorRecord, EntityId, KeyMaterial, PolicyRecord};
pub use store::{Store, tables};
