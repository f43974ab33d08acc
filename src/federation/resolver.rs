//! Remote resource resolution
//!
//! Fetches ActivityPub documents from other servers. A fetch starts
//! unsigned unless told otherwise; if the remote answers with the
//! "Request not signed" marker the fetch is repeated once, signed on behalf
//! of a local actor. A second refusal ends the attempt.

use std::sync::Arc;

use chrono::Utc;
use http::{Method, Request, header};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::signature;
use crate::data::{INSTANCE_ACTOR, LocalUrls, SharedActors};
use crate::error::AppError;
use crate::metrics::FEDERATION_REQUESTS_TOTAL;

/// Accept header sent on every federation request
pub const ACTIVITY_ACCEPT: &str = "application/activity+json, application/ld+json";

/// Content type of outgoing activities
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";

const SIGNATURE_REQUIRED_MARKER: &str = "Request not signed";

/// Build a request carrying the federation headers every peer expects
///
/// Sets `Accept`, `Date` and `Host`; the caller signs it afterwards if needed.
pub(crate) fn federation_request(
    method: Method,
    url: &str,
    body: Vec<u8>,
) -> Result<Request<Vec<u8>>, AppError> {
    let parsed =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL {}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported URL scheme: {}",
                scheme
            )));
        }
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation(format!("Missing host in URL {}", url)))?;
    let host = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let mut builder = Request::builder()
        .method(method)
        .uri(parsed.as_str())
        .header(header::ACCEPT, ACTIVITY_ACCEPT)
        .header(header::DATE, signature::http_date(Utc::now()))
        .header(header::HOST, host);
    if !body.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE);
    }

    builder
        .body(body)
        .map_err(|e| AppError::Validation(format!("Invalid request for {}: {}", url, e)))
}

/// Actor document as seen from this node
///
/// Only the fields federation needs are typed; the rest is ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteActor {
    pub id: String,
    #[serde(default)]
    pub inbox: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    endpoints: Option<Value>,
    #[serde(default)]
    public_key: Option<Value>,
}

impl RemoteActor {
    /// Shared inbox, when the actor advertises one as a string
    pub fn shared_inbox(&self) -> Option<&str> {
        self.endpoints.as_ref()?.get("sharedInbox")?.as_str()
    }

    /// Where deliveries for this actor go: the shared inbox if any,
    /// otherwise the personal inbox.
    pub fn delivery_endpoint(&self) -> Option<&str> {
        self.shared_inbox().or(self.inbox.as_deref())
    }

    pub fn public_key_id(&self) -> Option<&str> {
        self.public_key.as_ref()?.get("id")?.as_str()
    }

    pub fn public_key_pem(&self) -> Option<&str> {
        self.public_key.as_ref()?.get("publicKeyPem")?.as_str()
    }
}

enum FetchOutcome {
    Document(Map<String, Value>),
    SignatureRequired,
}

/// Fetches remote documents, signing on behalf of local actors when asked
#[derive(Clone)]
pub struct RemoteResolver {
    http_client: Arc<reqwest::Client>,
    actors: SharedActors,
    urls: LocalUrls,
}

impl RemoteResolver {
    pub fn new(http_client: Arc<reqwest::Client>, actors: SharedActors, urls: LocalUrls) -> Self {
        Self {
            http_client,
            actors,
            urls,
        }
    }

    /// Fetch a remote document by identifier
    ///
    /// # Arguments
    /// * `id` - URL of the document
    /// * `acting_as` - Local username that signs the request if signing is needed
    /// * `force_signed` - Sign the first attempt instead of waiting to be asked
    ///
    /// # Errors
    /// - `RemoteStatus` for any status other than 200
    /// - `Federation` for a non-object body, an `error` field, or a refusal
    ///   of the signed attempt
    pub async fn fetch(
        &self,
        id: &str,
        acting_as: &str,
        force_signed: bool,
    ) -> Result<Map<String, Value>, AppError> {
        match self.fetch_once(id, acting_as, force_signed).await? {
            FetchOutcome::Document(document) => Ok(document),
            FetchOutcome::SignatureRequired if !force_signed => {
                tracing::debug!(url = %id, acting_as = %acting_as, "Remote requires a signature, retrying signed");
                match self.fetch_once(id, acting_as, true).await? {
                    FetchOutcome::Document(document) => Ok(document),
                    FetchOutcome::SignatureRequired => Err(signature_refused(id)),
                }
            }
            FetchOutcome::SignatureRequired => Err(signature_refused(id)),
        }
    }

    async fn fetch_once(
        &self,
        id: &str,
        acting_as: &str,
        signed: bool,
    ) -> Result<FetchOutcome, AppError> {
        let mut request = federation_request(Method::GET, id, Vec::new())?;
        if signed {
            let private_key = self.actors.private_key(acting_as).await?;
            signature::sign_request(&private_key, &self.urls.key_id(acting_as), &mut request)?;
        }

        let request = reqwest::Request::try_from(request)?;
        let response = self.http_client.execute(request).await.inspect_err(|_| {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["fetch", "error"])
                .inc();
        })?;

        let status = response.status();
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["fetch", status.as_str()])
            .inc();

        if status != reqwest::StatusCode::OK {
            return Err(AppError::RemoteStatus {
                url: id.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        let document = match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(document)) => document,
            Ok(_) => {
                return Err(AppError::Federation(format!(
                    "{} did not return a JSON object",
                    id
                )));
            }
            Err(e) => {
                return Err(AppError::Federation(format!(
                    "{} returned invalid JSON: {}",
                    id, e
                )));
            }
        };

        match document.get("error") {
            None | Some(Value::Null) => Ok(FetchOutcome::Document(document)),
            Some(error) => {
                let message = match error {
                    Value::String(message) => message.clone(),
                    other => other.to_string(),
                };
                if message.contains(SIGNATURE_REQUIRED_MARKER) {
                    Ok(FetchOutcome::SignatureRequired)
                } else {
                    Err(AppError::Federation(format!(
                        "{} answered with error: {}",
                        id, message
                    )))
                }
            }
        }
    }

    /// Fetch an actor document, acting as the instance actor
    pub async fn fetch_actor(&self, actor_id: &str) -> Result<RemoteActor, AppError> {
        let document = self.fetch(actor_id, INSTANCE_ACTOR, false).await?;
        serde_json::from_value(Value::Object(document))
            .map_err(|e| AppError::Federation(format!("Invalid actor document {}: {}", actor_id, e)))
    }

    /// Resolve the inbox that deliveries for `actor_id` should go to
    ///
    /// Prefers `endpoints.sharedInbox`; falls back to `inbox` when the actor
    /// advertises no shared inbox.
    pub async fn resolve_inbox(&self, actor_id: &str) -> Result<String, AppError> {
        let actor = self.fetch_actor(actor_id).await?;
        actor
            .delivery_endpoint()
            .map(str::to_string)
            .ok_or_else(|| AppError::Federation(format!("Actor {} has no inbox", actor_id)))
    }

    /// Fetch the public key PEM referenced by a signature keyId
    pub async fn fetch_public_key(&self, key_id: &str) -> Result<String, AppError> {
        let actor_url = key_id.split('#').next().unwrap_or(key_id);
        let actor = self.fetch_actor(actor_url).await?;

        // If a key fragment is provided, ensure actor advertises exactly that key id.
        if key_id.contains('#') {
            let advertised = actor.public_key_id().ok_or_else(|| {
                AppError::Federation(format!("Missing publicKey.id in actor {}", actor_url))
            })?;
            if advertised != key_id {
                return Err(AppError::Validation(
                    "Signature keyId does not match actor public key id".to_string(),
                ));
            }
        }

        actor
            .public_key_pem()
            .map(str::to_string)
            .ok_or_else(|| AppError::Federation(format!("Missing publicKeyPem in actor {}", actor_url)))
    }
}

fn signature_refused(id: &str) -> AppError {
    AppError::Federation(format!("{} refused the signed request", id))
}
