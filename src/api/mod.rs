//! HTTP surface
//!
//! Three route groups: the federation endpoints (actor documents, inboxes,
//! collections), the local publishing API, and the token-guarded policy
//! administration API.

pub mod activitypub;
pub mod admin;
pub mod metrics;
