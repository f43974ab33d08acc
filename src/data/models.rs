//! Data models
//!
//! Actors and objects as stored by this node, plus the URL scheme that maps
//! local usernames and object keys onto ActivityPub identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Username of the distinguished actor that signs instance-level requests.
pub const INSTANCE_ACTOR: &str = "instance.actor";

/// The public-collection sentinel address.
pub const PUBLIC_ADDRESS: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Whether an addressee denotes public visibility rather than a recipient.
///
/// Accepts the compacted JSON-LD forms as well as the full IRI.
pub fn is_public_address(address: &str) -> bool {
    matches!(address, PUBLIC_ADDRESS | "as:Public" | "Public")
}

// =============================================================================
// ID Types
// =============================================================================

/// Local object key (ULID format, 26 characters, time-sortable)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub String);

impl ObjectId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Actor
// =============================================================================

/// A local federation identity
///
/// The identifier is derived from the username and never changes. The
/// private key is generated once and only regenerated if it goes missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub username: String,
    /// RSA private key (PEM format)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// Identifiers of objects delivered to this actor, oldest first
    #[serde(default)]
    pub inbox: Vec<String>,
    /// Identifiers of objects authored by this actor, oldest first
    #[serde(default)]
    pub outbox: Vec<String>,
    #[serde(default)]
    pub followers: Vec<String>,
    #[serde(default)]
    pub following: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Actor {
    pub fn new(username: impl Into<String>, private_key_pem: String) -> Self {
        Self {
            username: username.into(),
            private_key: Some(private_key_pem),
            inbox: Vec::new(),
            outbox: Vec::new(),
            followers: Vec::new(),
            following: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Whether a usable private key is present.
    pub fn has_private_key(&self) -> bool {
        self.private_key
            .as_deref()
            .is_some_and(|pem| !pem.trim().is_empty())
    }
}

/// Check that a username is usable as a path segment of an actor URL.
pub fn validate_username(username: &str) -> Result<(), crate::error::AppError> {
    let valid = !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && !username.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(crate::error::AppError::Validation(format!(
            "Invalid username: {:?}",
            username
        )))
    }
}

// =============================================================================
// Object
// =============================================================================

/// Mention tag attached to an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub href: String,
}

/// A federation document authored on this node
///
/// Recipient fields keep insertion order and are deduplicated on insert;
/// consumers still deduplicate across fields when computing recipients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub attributed_to: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bto: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audience: Vec<String>,
    pub published: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Mention>,
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

impl Object {
    /// Create a Note with a fresh identifier under `urls`.
    pub fn note(urls: &LocalUrls, attributed_to: &str, content: impl Into<String>) -> Self {
        Self {
            id: urls.object(&ObjectId::new()),
            kind: "Note".to_string(),
            attributed_to: attributed_to.to_string(),
            content: content.into(),
            to: Vec::new(),
            bto: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            audience: Vec::new(),
            published: Utc::now(),
            in_reply_to: None,
            tag: Vec::new(),
        }
    }

    pub fn add_to(&mut self, address: &str) {
        push_unique(&mut self.to, address);
    }

    pub fn add_bto(&mut self, address: &str) {
        push_unique(&mut self.bto, address);
    }

    pub fn add_cc(&mut self, address: &str) {
        push_unique(&mut self.cc, address);
    }

    pub fn add_bcc(&mut self, address: &str) {
        push_unique(&mut self.bcc, address);
    }

    pub fn add_audience(&mut self, address: &str) {
        push_unique(&mut self.audience, address);
    }

    /// Add a Mention tag, ignoring duplicates by name.
    pub fn add_mention(&mut self, name: &str, href: &str) {
        if self.tag.iter().any(|t| t.name == name) {
            return;
        }
        self.tag.push(Mention {
            kind: "Mention".to_string(),
            name: name.to_string(),
            href: href.to_string(),
        });
    }

    /// Union of to, bto, cc, bcc and audience in that order, without duplicates.
    pub fn addressees(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.to
            .iter()
            .chain(&self.bto)
            .chain(&self.cc)
            .chain(&self.bcc)
            .chain(&self.audience)
            .map(String::as_str)
            .filter(|address| seen.insert(*address))
            .collect()
    }

    /// Copy of this object suitable for sending to other servers.
    ///
    /// Blind recipients are dropped from the payload.
    pub fn without_blind_recipients(&self) -> Self {
        Self {
            bto: Vec::new(),
            bcc: Vec::new(),
            ..self.clone()
        }
    }
}

// =============================================================================
// URL scheme
// =============================================================================

/// ActivityPub URLs of this node
///
/// - actors: `{base}/users/{username}`
/// - shared inbox: `{base}/inbox`
/// - objects: `{base}/objects/{key}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUrls {
    base_url: String,
}

impl LocalUrls {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn actor_prefix(&self) -> String {
        format!("{}/users/", self.base_url)
    }

    pub fn actor(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url, username)
    }

    /// Key ID advertised in the actor document and used in signatures
    pub fn key_id(&self, username: &str) -> String {
        format!("{}#main-key", self.actor(username))
    }

    pub fn inbox(&self, username: &str) -> String {
        format!("{}/inbox", self.actor(username))
    }

    pub fn outbox(&self, username: &str) -> String {
        format!("{}/outbox", self.actor(username))
    }

    pub fn followers(&self, username: &str) -> String {
        format!("{}/followers", self.actor(username))
    }

    pub fn following(&self, username: &str) -> String {
        format!("{}/following", self.actor(username))
    }

    pub fn shared_inbox(&self) -> String {
        format!("{}/inbox", self.base_url)
    }

    pub fn object(&self, key: &ObjectId) -> String {
        format!("{}/objects/{}", self.base_url, key)
    }

    /// Username of a local actor identifier, if `actor_id` is one.
    pub fn username_of<'a>(&self, actor_id: &'a str) -> Option<&'a str> {
        let rest = actor_id.strip_prefix(&self.actor_prefix())?;
        if rest.is_empty() || rest.contains(['/', '#', '?']) {
            return None;
        }
        Some(rest)
    }
}
