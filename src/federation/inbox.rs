//! Inbound activity processing
//!
//! Applies activities whose signature has already been verified:
//! - `Create`: record the object id in the inbox of every addressed local actor
//! - `Follow`: record the follower and, if configured, answer with `Accept`
//!
//! Anything else is acknowledged without effect.
//!
//! The object identifier of a `Create` is trusted as given; whether its
//! domain matches the signer is not checked.

use std::collections::HashSet;

use super::activity::Activity;
use super::delivery::DeliveryDispatcher;
use crate::data::{LocalUrls, SharedActors};
use crate::error::AppError;
use crate::metrics::ACTIVITIES_RECEIVED;

/// Which inbox an activity arrived at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxTarget<'a> {
    Shared,
    Actor(&'a str),
}

/// What processing an activity changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxOutcome {
    /// Object recorded for these local usernames
    Delivered {
        object_id: String,
        recipients: Vec<String>,
    },
    FollowRecorded {
        follower: String,
        followee: String,
        accepted: bool,
    },
    Ignored {
        kind: String,
    },
}

/// Applies verified inbound activities to local state
#[derive(Clone)]
pub struct InboxProcessor {
    actors: SharedActors,
    dispatcher: DeliveryDispatcher,
    urls: LocalUrls,
    auto_accept_follow: bool,
}

impl InboxProcessor {
    pub fn new(
        actors: SharedActors,
        dispatcher: DeliveryDispatcher,
        urls: LocalUrls,
        auto_accept_follow: bool,
    ) -> Self {
        Self {
            actors,
            dispatcher,
            urls,
            auto_accept_follow,
        }
    }

    /// Process one activity
    pub async fn process(
        &self,
        target: InboxTarget<'_>,
        activity: &Activity,
    ) -> Result<InboxOutcome, AppError> {
        ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind.as_str()])
            .inc();

        match activity.kind.as_str() {
            "Create" => self.handle_create(target, activity).await,
            "Follow" => self.handle_follow(target, activity).await,
            other => {
                tracing::debug!(activity_type = %other, "Ignoring unsupported activity");
                Ok(InboxOutcome::Ignored {
                    kind: other.to_string(),
                })
            }
        }
    }

    async fn handle_create(
        &self,
        target: InboxTarget<'_>,
        activity: &Activity,
    ) -> Result<InboxOutcome, AppError> {
        let object_id = activity
            .object_id()
            .ok_or_else(|| AppError::Validation("Create without object id".to_string()))?
            .to_string();

        let mut usernames = Vec::new();
        let mut seen = HashSet::new();
        let personal = match target {
            InboxTarget::Actor(username) => Some(username),
            InboxTarget::Shared => None,
        };
        let addressed = activity
            .to
            .iter()
            .filter_map(|address| self.urls.username_of(address));
        for username in personal.into_iter().chain(addressed) {
            if seen.insert(username) {
                usernames.push(username.to_string());
            }
        }

        let mut recipients = Vec::new();
        for username in usernames {
            match self.actors.append_inbox(&username, &object_id).await {
                Ok(()) => recipients.push(username),
                Err(AppError::NotFound) => {
                    tracing::debug!(username = %username, "Create addressed to unknown local actor");
                }
                Err(e) => return Err(e),
            }
        }

        if !recipients.is_empty() {
            if let Err(e) = self.actors.save().await {
                tracing::warn!(error = %e, "Failed to persist actors after Create");
            }
        }

        tracing::info!(
            object_id = %object_id,
            recipients = recipients.len(),
            "Create received"
        );
        Ok(InboxOutcome::Delivered {
            object_id,
            recipients,
        })
    }

    async fn handle_follow(
        &self,
        target: InboxTarget<'_>,
        activity: &Activity,
    ) -> Result<InboxOutcome, AppError> {
        let follower = activity
            .actor_id()
            .ok_or_else(|| AppError::Validation("Follow without actor".to_string()))?
            .to_string();
        let followee = activity
            .object_id()
            .ok_or_else(|| AppError::Validation("Follow without object".to_string()))?
            .to_string();

        let username = self
            .urls
            .username_of(&followee)
            .ok_or_else(|| AppError::Validation(format!("{} is not a local actor", followee)))?;
        if let InboxTarget::Actor(owner) = target {
            if owner != username {
                return Err(AppError::Validation(
                    "Follow object does not match inbox owner".to_string(),
                ));
            }
        }

        let actor = self
            .actors
            .find_by_username(username)
            .await
            .ok_or(AppError::NotFound)?;

        if self.actors.add_follower(username, &follower).await? {
            if let Err(e) = self.actors.save().await {
                tracing::warn!(error = %e, "Failed to persist actors after Follow");
            }
        }

        let accepted = if self.auto_accept_follow {
            self.dispatcher.send_accept(&actor, activity)?.detach();
            true
        } else {
            false
        };

        tracing::info!(follower = %follower, followee = %followee, accepted, "Follow received");
        Ok(InboxOutcome::FollowRecorded {
            follower,
            followee,
            accepted,
        })
    }
}
