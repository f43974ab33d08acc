//! Data layer module
//!
//! Handles all data persistence:
//! - Actor and object models and the local URL scheme
//! - In-memory repositories
//! - JSON snapshot files

mod models;
mod snapshot;
mod store;

pub use models::*;
pub use snapshot::JsonSnapshot;
pub use store::{
    ActorRepository, MemoryActorStore, MemoryObjectStore, ObjectRepository, SharedActors,
    SharedObjects,
};
