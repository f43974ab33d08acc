//! Activity delivery
//!
//! Handles delivering activities to remote servers.
//!
//! Recipients are resolved to inbox endpoints (shared inbox preferred),
//! endpoints are deduplicated, and each endpoint receives exactly one signed
//! POST. Deliveries run in the background under a shared concurrency cap;
//! failures are logged and counted, never retried.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use http::Method;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::activity::{Activity, builder};
use super::resolver::{RemoteResolver, federation_request};
use super::signature;
use crate::data::{Actor, LocalUrls, Object, SharedActors, is_public_address};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_SENT, DELIVERIES_TOTAL, FEDERATION_REQUESTS_TOTAL};

/// Compute who an activity must be delivered to
///
/// Walks the addressees in order and
/// - skips the author and the sender,
/// - skips the public sentinel,
/// - expands the author's followers collection into the follower list,
/// - drops explicitly addressed followers of the author,
///
/// and returns the remaining actor identifiers without duplicates.
pub fn compute_recipients<'a>(
    sender_id: &str,
    attributed_to: &str,
    addressees: impl IntoIterator<Item = &'a str>,
    followers: &[String],
) -> Vec<String> {
    let followers_collection = format!("{}/followers", attributed_to);

    let mut seen_addressees = HashSet::new();
    let addressees: Vec<&str> = addressees
        .into_iter()
        .filter(|a| !a.is_empty() && seen_addressees.insert(*a))
        .collect();

    let follower_set: HashSet<&str> = followers.iter().map(String::as_str).collect();

    let mut seen = HashSet::new();
    let mut recipients = Vec::new();
    let mut push = |recipient: &str| {
        if recipient != sender_id && recipient != attributed_to && seen.insert(recipient.to_string()) {
            recipients.push(recipient.to_string());
        }
    };

    for addressee in addressees {
        if addressee == sender_id || addressee == attributed_to || is_public_address(addressee) {
            continue;
        }
        if addressee == followers_collection {
            for follower in followers {
                push(follower.as_str());
            }
            continue;
        }
        if follower_set.contains(addressee) {
            continue;
        }
        push(addressee);
    }

    recipients
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    /// Recipients served by this attempt
    pub recipients: Vec<String>,
    /// Inbox the activity was posted to, if one was resolved
    pub endpoint: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub status_code: Option<u16>,
}

impl DeliveryResult {
    fn failed(recipients: Vec<String>, endpoint: Option<String>, error: &AppError) -> Self {
        Self {
            recipients,
            endpoint,
            success: false,
            error: Some(error.to_string()),
            status_code: error.remote_status(),
        }
    }
}

/// Handle on a dispatched batch
///
/// Dropping it leaves the deliveries running; awaiting it yields one result
/// per endpoint plus one per recipient whose endpoint could not be resolved.
#[must_use = "drop the batch explicitly to deliver in the background"]
pub struct DeliveryBatch {
    handle: JoinHandle<Vec<DeliveryResult>>,
}

impl DeliveryBatch {
    pub async fn wait(self) -> Vec<DeliveryResult> {
        match self.handle.await {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(error = %e, "Delivery batch task failed");
                Vec::new()
            }
        }
    }

    /// Let the batch finish in the background
    pub fn detach(self) {}
}

/// Outbound delivery service
#[derive(Clone)]
pub struct DeliveryDispatcher {
    http_client: Arc<reqwest::Client>,
    actors: SharedActors,
    resolver: RemoteResolver,
    urls: LocalUrls,
    permits: Arc<Semaphore>,
}

impl DeliveryDispatcher {
    pub fn new(
        http_client: Arc<reqwest::Client>,
        actors: SharedActors,
        resolver: RemoteResolver,
        urls: LocalUrls,
        max_concurrent: usize,
    ) -> Self {
        Self {
            http_client,
            actors,
            resolver,
            urls,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Send Create activity for a locally authored object
    pub fn send_create(&self, sender: &Actor, object: &Object) -> Result<DeliveryBatch, AppError> {
        let sender_id = self.urls.actor(&sender.username);
        let activity = builder::create(&sender_id, object)?;
        let recipients = compute_recipients(
            &sender_id,
            &object.attributed_to,
            object.addressees(),
            &sender.followers,
        );

        tracing::info!(
            object_id = %object.id,
            recipients = recipients.len(),
            "Dispatching Create"
        );
        self.deliver(&sender.username, &activity, recipients)
    }

    /// Send Accept activity answering a Follow
    pub fn send_accept(&self, sender: &Actor, follow: &Activity) -> Result<DeliveryBatch, AppError> {
        let sender_id = self.urls.actor(&sender.username);
        let activity = builder::accept(&sender_id, follow)?;
        let recipients = follow
            .actor_id()
            .map(|follower| vec![follower.to_string()])
            .unwrap_or_default();

        self.deliver(&sender.username, &activity, recipients)
    }

    /// Deliver an activity to actors, signed as `sender_username`
    ///
    /// Returns immediately; resolution and delivery happen on a spawned task.
    pub fn deliver(
        &self,
        sender_username: &str,
        activity: &Activity,
        recipients: Vec<String>,
    ) -> Result<DeliveryBatch, AppError> {
        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Validation(format!("Failed to serialize activity: {}", e)))?;
        ACTIVITIES_SENT
            .with_label_values(&[activity.kind.as_str()])
            .inc();

        let dispatcher = self.clone();
        let sender = sender_username.to_string();
        let handle = tokio::spawn(async move {
            dispatcher
                .run_batch(sender, Arc::new(body), recipients)
                .await
        });

        Ok(DeliveryBatch { handle })
    }

    async fn run_batch(
        &self,
        sender: String,
        body: Arc<Vec<u8>>,
        recipients: Vec<String>,
    ) -> Vec<DeliveryResult> {
        let mut results = Vec::new();
        if recipients.is_empty() {
            return results;
        }

        // 1. Resolve every recipient's endpoint concurrently.
        let lookups = recipients.into_iter().map(|recipient| async move {
            let resolved = match self.permits.acquire().await {
                Ok(_permit) => self.resolver.resolve_inbox(&recipient).await,
                Err(_) => Err(AppError::Federation("Delivery pool closed".to_string())),
            };
            (recipient, resolved)
        });

        // 2. Group recipients by endpoint, keeping first-seen order.
        let mut endpoints: Vec<(String, Vec<String>)> = Vec::new();
        for (recipient, resolved) in join_all(lookups).await {
            match resolved {
                Ok(endpoint) => match endpoints.iter_mut().find(|(e, _)| *e == endpoint) {
                    Some((_, grouped)) => grouped.push(recipient),
                    None => endpoints.push((endpoint, vec![recipient])),
                },
                Err(e) => {
                    tracing::warn!(recipient = %recipient, error = %e, "Failed to resolve inbox");
                    DELIVERIES_TOTAL.with_label_values(&["unresolved"]).inc();
                    results.push(DeliveryResult::failed(vec![recipient], None, &e));
                }
            }
        }

        let total_endpoints = endpoints.len();

        // 3. One signed POST per endpoint.
        let private_key = match self.actors.private_key(&sender).await {
            Ok(key) => Arc::new(key),
            Err(e) => {
                tracing::error!(sender = %sender, error = %e, "Cannot sign deliveries");
                for (endpoint, grouped) in endpoints {
                    DELIVERIES_TOTAL.with_label_values(&["failure"]).inc();
                    results.push(DeliveryResult::failed(grouped, Some(endpoint), &e));
                }
                return results;
            }
        };
        let key_id = Arc::new(self.urls.key_id(&sender));

        let tasks: Vec<_> = endpoints
            .into_iter()
            .map(|(endpoint, grouped)| {
                let dispatcher = self.clone();
                let private_key = private_key.clone();
                let key_id = key_id.clone();
                let body = body.clone();
                tokio::spawn(async move {
                    let outcome = match dispatcher.permits.clone().acquire_owned().await {
                        Ok(_permit) => {
                            dispatcher
                                .post_signed(&endpoint, &private_key, &key_id, &body)
                                .await
                        }
                        Err(_) => Err(AppError::Federation("Delivery pool closed".to_string())),
                    };
                    match outcome {
                        Ok(status) => {
                            tracing::debug!(inbox = %endpoint, status, "Delivered activity");
                            DELIVERIES_TOTAL.with_label_values(&["success"]).inc();
                            DeliveryResult {
                                recipients: grouped,
                                endpoint: Some(endpoint),
                                success: true,
                                error: None,
                                status_code: Some(status),
                            }
                        }
                        Err(e) => {
                            tracing::warn!(inbox = %endpoint, error = %e, "Delivery failed");
                            DELIVERIES_TOTAL.with_label_values(&["failure"]).inc();
                            DeliveryResult::failed(grouped, Some(endpoint), &e)
                        }
                    }
                })
            })
            .collect();

        for joined in join_all(tasks).await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Delivery task failed"),
            }
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        tracing::info!(
            sender = %sender,
            endpoints = total_endpoints,
            succeeded,
            failed = results.len() - succeeded,
            "Batch delivery complete"
        );

        results
    }

    /// POST a signed body to one inbox; any 2xx counts as delivered
    async fn post_signed(
        &self,
        inbox: &str,
        private_key_pem: &str,
        key_id: &str,
        body: &[u8],
    ) -> Result<u16, AppError> {
        let mut request = federation_request(Method::POST, inbox, body.to_vec())?;
        signature::sign_request(private_key_pem, key_id, &mut request)?;

        let request = reqwest::Request::try_from(request)?;
        let response = self.http_client.execute(request).await.inspect_err(|_| {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["deliver", "error"])
                .inc();
        })?;

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["deliver", status.as_str()])
            .inc();

        // Mastodon answers inbox POSTs with 202 Accepted, so any 2xx is delivered.
        if !status.is_success() {
            return Err(AppError::RemoteStatus {
                url: inbox.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(status.as_u16())
    }
}
