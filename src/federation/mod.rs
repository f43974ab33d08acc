//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures
//! - Remote document fetching (signed on demand)
//! - Activity delivery (outbox)
//! - Activity processing (inbox)

mod activity;
mod delivery;
mod inbox;
mod resolver;
pub mod signature;

pub use activity::{
    ACTIVITY_STREAMS_CONTEXT, Activity, ObjectRef, SECURITY_CONTEXT, builder,
};
pub use delivery::{DeliveryBatch, DeliveryDispatcher, DeliveryResult, compute_recipients};
pub use inbox::{InboxOutcome, InboxProcessor, InboxTarget};
pub use resolver::{ACTIVITY_ACCEPT, ACTIVITY_CONTENT_TYPE, RemoteActor, RemoteResolver};
pub use signature::{
    Keypair, derive_public_key, generate_keypair, generate_keypair_with_bits, key_id_matches_actor,
    sign_request, verify_parts, verify_request,
};
