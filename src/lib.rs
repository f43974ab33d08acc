//! Hearth - A small federated ActivityPub node
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actors, inboxes, collections)     │
//! │  - WebFinger                                                │
//! │  - Local API (accounts, notes)                              │
//! │  - Health and metrics                                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Service / Federation Layer                    │
//! │  - HTTP signatures                                          │
//! │  - Signed fetch with escalation                             │
//! │  - Outbound delivery, inbound processing                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - In-memory actor and object stores                        │
//! │  - JSON snapshot files                                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Account registration and note authoring
//! - `federation`: Signatures, fetching, delivery, inbox processing
//! - `data`: Models and stores
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;

use std::sync::Arc;

use data::{
    JsonSnapshot, LocalUrls, MemoryActorStore, MemoryObjectStore, SharedActors, SharedObjects,
};
use federation::{DeliveryDispatcher, InboxProcessor, RemoteResolver};
use service::{AccountService, NoteService};

/// Application state shared across all handlers
///
/// This struct is cloned for each request; every field is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,
    /// URL scheme of this node
    pub urls: LocalUrls,
    pub actors: SharedActors,
    pub objects: SharedObjects,
    /// HTTP client for outbound federation
    pub http_client: Arc<reqwest::Client>,
    pub resolver: RemoteResolver,
    pub dispatcher: DeliveryDispatcher,
    pub inbox: InboxProcessor,
    pub accounts: Arc<AccountService>,
    pub notes: Arc<NoteService>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Load actor and object snapshots
    /// 2. Wire federation services
    /// 3. Create the instance actor and welcome note on first start
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        let urls = LocalUrls::new(config.server.base_url());

        let actors = MemoryActorStore::load(
            urls.clone(),
            config.federation.key_bits,
            JsonSnapshot::new(&config.storage.actors_path),
        )
        .await?;
        let objects =
            MemoryObjectStore::load(JsonSnapshot::new(&config.storage.objects_path)).await?;

        let state = Self::from_parts(config, Arc::new(actors), Arc::new(objects))?;
        state.bootstrap().await?;
        Ok(state)
    }

    /// Build state around existing stores
    pub fn from_parts(
        config: config::AppConfig,
        actors: SharedActors,
        objects: SharedObjects,
    ) -> Result<Self, error::AppError> {
        let urls = LocalUrls::new(config.server.base_url());

        let mut client =
            reqwest::Client::builder().user_agent(config.federation.user_agent.clone());
        if let Some(timeout) = config.federation.request_timeout() {
            client = client.timeout(timeout);
        }
        let http_client = Arc::new(client.build()?);

        let resolver = RemoteResolver::new(http_client.clone(), actors.clone(), urls.clone());
        let dispatcher = DeliveryDispatcher::new(
            http_client.clone(),
            actors.clone(),
            resolver.clone(),
            urls.clone(),
            config.federation.max_concurrent_deliveries,
        );
        let inbox = InboxProcessor::new(
            actors.clone(),
            dispatcher.clone(),
            urls.clone(),
            config.instance.auto_accept_follow,
        );
        let accounts = Arc::new(AccountService::new(actors.clone(), urls.clone()));
        let notes = Arc::new(NoteService::new(
            actors.clone(),
            objects.clone(),
            dispatcher.clone(),
            urls.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            urls,
            actors,
            objects,
            http_client,
            resolver,
            dispatcher,
            inbox,
            accounts,
            notes,
        })
    }

    /// Create the instance actor and the welcome note if missing
    pub async fn bootstrap(&self) -> Result<(), error::AppError> {
        self.accounts.ensure_instance_actor().await?;
        self.notes.seed_welcome_note().await?;
        Ok(())
    }
}

/// Build the application router
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    Router::new()
        .merge(api::activitypub_router())
        .merge(api::wellknown_router())
        .nest("/api", api::local_api_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::ops_router())
}
