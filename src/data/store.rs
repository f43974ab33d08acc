//! Actor and object repositories
//!
//! Both stores keep their records in memory behind a `tokio::sync::RwLock`
//! and optionally mirror them to a [`JsonSnapshot`] on `save`. Lookups and
//! mutations are consistent under concurrent access; persistence is a
//! separate step.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::models::{Actor, LocalUrls, Object, validate_username};
use super::snapshot::JsonSnapshot;
use crate::error::AppError;
use crate::federation::signature;

/// Local actor storage
#[async_trait]
pub trait ActorRepository: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Option<Actor>;

    /// Look up a local actor by its full identifier
    async fn find_by_id(&self, actor_id: &str) -> Option<Actor>;

    /// Register a new actor with a fresh keypair
    ///
    /// Fails with `Conflict` if the username is taken.
    async fn create(&self, username: &str) -> Result<Actor, AppError>;

    /// Private key PEM of an actor, regenerating it if it went missing
    async fn private_key(&self, username: &str) -> Result<String, AppError>;

    /// Public key PEM derived from the actor's private key
    async fn public_key(&self, username: &str) -> Result<String, AppError>;

    async fn append_inbox(&self, username: &str, object_id: &str) -> Result<(), AppError>;

    async fn append_outbox(&self, username: &str, object_id: &str) -> Result<(), AppError>;

    /// Record a follower; returns `false` if it was already recorded
    async fn add_follower(&self, username: &str, follower_id: &str) -> Result<bool, AppError>;

    async fn add_following(&self, username: &str, followee_id: &str) -> Result<bool, AppError>;

    async fn list(&self) -> Vec<Actor>;

    /// Persist the current state
    async fn save(&self) -> Result<(), AppError>;
}

/// Object storage keyed by full object identifier
#[async_trait]
pub trait ObjectRepository: Send + Sync {
    async fn find_by_id(&self, object_id: &str) -> Option<Object>;

    /// Store a new object
    ///
    /// Identifiers are never reassigned, so an existing id is a `Conflict`.
    async fn insert(&self, object: Object) -> Result<(), AppError>;

    async fn list(&self) -> Vec<Object>;

    async fn save(&self) -> Result<(), AppError>;
}

// =============================================================================
// Actors
// =============================================================================

/// In-memory actor store
pub struct MemoryActorStore {
    actors: RwLock<HashMap<String, Actor>>,
    urls: LocalUrls,
    key_bits: usize,
    snapshot: Option<JsonSnapshot>,
}

impl MemoryActorStore {
    pub fn new(urls: LocalUrls, key_bits: usize) -> Self {
        Self {
            actors: RwLock::new(HashMap::new()),
            urls,
            key_bits,
            snapshot: None,
        }
    }

    /// Load actors from a snapshot file and keep saving to it
    pub async fn load(
        urls: LocalUrls,
        key_bits: usize,
        snapshot: JsonSnapshot,
    ) -> Result<Self, AppError> {
        let actors: HashMap<String, Actor> = snapshot
            .read::<Actor>()
            .await?
            .map(|entries| entries.into_iter().collect())
            .unwrap_or_default();

        tracing::info!(
            path = %snapshot.path().display(),
            actors = actors.len(),
            "Actor store loaded"
        );

        Ok(Self {
            actors: RwLock::new(actors),
            urls,
            key_bits,
            snapshot: Some(snapshot),
        })
    }

    async fn generate_private_key(&self) -> Result<String, AppError> {
        let bits = self.key_bits;
        let keypair =
            tokio::task::spawn_blocking(move || signature::generate_keypair_with_bits(bits))
                .await
                .map_err(|e| AppError::Internal(e.into()))??;
        Ok(keypair.private_key_pem)
    }

    async fn update<T>(
        &self,
        username: &str,
        f: impl FnOnce(&mut Actor) -> T + Send,
    ) -> Result<T, AppError> {
        let mut actors = self.actors.write().await;
        let actor = actors.get_mut(username).ok_or(AppError::NotFound)?;
        Ok(f(actor))
    }
}

fn push_if_absent(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|v| v == value) {
        return false;
    }
    list.push(value.to_string());
    true
}

#[async_trait]
impl ActorRepository for MemoryActorStore {
    async fn find_by_username(&self, username: &str) -> Option<Actor> {
        self.actors.read().await.get(username).cloned()
    }

    async fn find_by_id(&self, actor_id: &str) -> Option<Actor> {
        let username = self.urls.username_of(actor_id)?;
        self.find_by_username(username).await
    }

    async fn create(&self, username: &str) -> Result<Actor, AppError> {
        validate_username(username)?;
        if self.actors.read().await.contains_key(username) {
            return Err(AppError::Conflict(format!("Username {} is taken", username)));
        }

        // Key generation is slow; keep it outside the lock.
        let private_key = self.generate_private_key().await?;

        let mut actors = self.actors.write().await;
        if actors.contains_key(username) {
            return Err(AppError::Conflict(format!("Username {} is taken", username)));
        }
        let actor = Actor::new(username, private_key);
        actors.insert(username.to_string(), actor.clone());
        Ok(actor)
    }

    async fn private_key(&self, username: &str) -> Result<String, AppError> {
        {
            let actors = self.actors.read().await;
            let actor = actors.get(username).ok_or(AppError::NotFound)?;
            if actor.has_private_key() {
                return Ok(actor.private_key.clone().unwrap_or_default());
            }
        }

        tracing::warn!(username = %username, "Private key missing, generating a new one");
        let generated = self.generate_private_key().await?;

        self.update(username, move |actor| {
            if !actor.has_private_key() {
                actor.private_key = Some(generated);
            }
            actor.private_key.clone().unwrap_or_default()
        })
        .await
    }

    async fn public_key(&self, username: &str) -> Result<String, AppError> {
        let private_key = self.private_key(username).await?;
        signature::derive_public_key(&private_key)
    }

    async fn append_inbox(&self, username: &str, object_id: &str) -> Result<(), AppError> {
        self.update(username, |actor| {
            push_if_absent(&mut actor.inbox, object_id);
        })
        .await
    }

    async fn append_outbox(&self, username: &str, object_id: &str) -> Result<(), AppError> {
        self.update(username, |actor| {
            push_if_absent(&mut actor.outbox, object_id);
        })
        .await
    }

    async fn add_follower(&self, username: &str, follower_id: &str) -> Result<bool, AppError> {
        self.update(username, |actor| push_if_absent(&mut actor.followers, follower_id))
            .await
    }

    async fn add_following(&self, username: &str, followee_id: &str) -> Result<bool, AppError> {
        self.update(username, |actor| push_if_absent(&mut actor.following, followee_id))
            .await
    }

    async fn list(&self) -> Vec<Actor> {
        let mut actors: Vec<Actor> = self.actors.read().await.values().cloned().collect();
        actors.sort_by(|a, b| a.username.cmp(&b.username));
        actors
    }

    async fn save(&self) -> Result<(), AppError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let entries: BTreeMap<String, Actor> = self
            .actors
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        snapshot.write(&entries).await
    }
}

// =============================================================================
// Objects
// =============================================================================

/// In-memory object store
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Object>>,
    snapshot: Option<JsonSnapshot>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(snapshot: JsonSnapshot) -> Result<Self, AppError> {
        let objects: HashMap<String, Object> = snapshot
            .read::<Object>()
            .await?
            .map(|entries| entries.into_iter().collect())
            .unwrap_or_default();

        tracing::info!(
            path = %snapshot.path().display(),
            objects = objects.len(),
            "Object store loaded"
        );

        Ok(Self {
            objects: RwLock::new(objects),
            snapshot: Some(snapshot),
        })
    }

    /// Whether the store holds no objects
    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectRepository for MemoryObjectStore {
    async fn find_by_id(&self, object_id: &str) -> Option<Object> {
        self.objects.read().await.get(object_id).cloned()
    }

    async fn insert(&self, object: Object) -> Result<(), AppError> {
        let mut objects = self.objects.write().await;
        if objects.contains_key(&object.id) {
            return Err(AppError::Conflict(format!("Object {} already exists", object.id)));
        }
        objects.insert(object.id.clone(), object);
        Ok(())
    }

    async fn list(&self) -> Vec<Object> {
        let mut objects: Vec<Object> = self.objects.read().await.values().cloned().collect();
        objects.sort_by(|a, b| a.published.cmp(&b.published).then_with(|| a.id.cmp(&b.id)));
        objects
    }

    async fn save(&self) -> Result<(), AppError> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let entries: BTreeMap<String, Object> = self
            .objects
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        snapshot.write(&entries).await
    }
}

/// Shared handles as held by application state
pub type SharedActors = Arc<dyn ActorRepository>;
pub type SharedObjects = Arc<dyn ObjectRepository>;
