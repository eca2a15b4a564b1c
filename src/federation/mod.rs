//! Federation engine
//!
//! Everything needed to exchange activities with other nodes: the object
//! model, signing keys, HTTP signatures, the collection engine, the policy
//! gate, outbound delivery and inbound inbox processing.

pub mod collection;
pub mod delivery;
pub mod inbox;
pub mod key_cache;
pub mod keys;
pub mod object;
pub mod policy;
pub mod signature;

pub use collection::{CollectionName, Collections, collection_id};
pub use delivery::{DeliveryEngine, DeliverySummary};
pub use inbox::{Dispatched, InboxProcessor};
pub use key_cache::PublicKeyCache;
pub use keys::{KEY_PROOF_PLAINTEXT, KeyStore, generate_actor_keypair};
pub use object::{Activity, ActivityKind, ActivityObject};
pub use policy::{PolicyGate, PolicyScope};
