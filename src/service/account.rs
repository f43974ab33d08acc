//! Account service
//!
//! Registers local actors and bootstraps the instance actor.

use crate::data::{Actor, INSTANCE_ACTOR, LocalUrls, SharedActors};
use crate::error::AppError;

/// Account service
pub struct AccountService {
    actors: SharedActors,
    urls: LocalUrls,
}

impl AccountService {
    pub fn new(actors: SharedActors, urls: LocalUrls) -> Self {
        Self { actors, urls }
    }

    /// Register a new local actor
    ///
    /// Generates the actor's RSA keypair and persists the actor store.
    ///
    /// # Errors
    /// - `Validation` for a username unusable in URLs
    /// - `Conflict` if the username is taken
    pub async fn register(&self, username: &str) -> Result<Actor, AppError> {
        let actor = self.actors.create(username).await?;
        self.actors.save().await?;

        tracing::info!(actor_id = %self.urls.actor(username), "Account registered");
        Ok(actor)
    }

    /// Make sure the instance actor exists, creating it on first start
    pub async fn ensure_instance_actor(&self) -> Result<Actor, AppError> {
        if let Some(actor) = self.actors.find_by_username(INSTANCE_ACTOR).await {
            return Ok(actor);
        }

        let actor = match self.actors.create(INSTANCE_ACTOR).await {
            Ok(actor) => actor,
            Err(AppError::Conflict(_)) => self
                .actors
                .find_by_username(INSTANCE_ACTOR)
                .await
                .ok_or(AppError::NotFound)?,
            Err(e) => return Err(e),
        };
        self.actors.save().await?;

        tracing::info!(actor_id = %self.urls.actor(INSTANCE_ACTOR), "Instance actor created");
        Ok(actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ActorRepository, MemoryActorStore};
    use std::sync::Arc;

    fn service() -> (AccountService, Arc<MemoryActorStore>) {
        let urls = LocalUrls::new("http://localhost");
        let store = Arc::new(MemoryActorStore::new(urls.clone(), 1024));
        (AccountService::new(store.clone(), urls), store)
    }

    #[tokio::test]
    async fn register_creates_actor_with_key() {
        let (service, store) = service();
        let actor = service.register("alice").await.unwrap();
        assert_eq!(actor.username, "alice");
        assert!(store.public_key("alice").await.is_ok());
    }

    #[tokio::test]
    async fn register_rejects_taken_and_invalid_names() {
        let (service, _) = service();
        service.register("alice").await.unwrap();
        assert!(matches!(
            service.register("alice").await,
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            service.register("no/slashes").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn instance_actor_is_created_once() {
        let (service, store) = service();
        let first = service.ensure_instance_actor().await.unwrap();
        let second = service.ensure_instance_actor().await.unwrap();
        assert_eq!(first.private_key, second.private_key);
        assert_eq!(store.list().await.len(), 1);
    }
}
