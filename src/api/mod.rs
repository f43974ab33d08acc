//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub (for federation)
//! - WebFinger discovery
//! - Local API (account and note management)
//! - Health and metrics (Prometheus)

mod activitypub;
mod local;
pub mod metrics;
mod wellknown;

pub use activitypub::{ActivityJson, activitypub_router};
pub use local::local_api_router;
pub use metrics::ops_router;
pub use wellknown::{WebFingerLink, WebFingerResponse, wellknown_router};
