//! Activity envelopes
//!
//! Typed view of the activities this node sends and receives. Addressing
//! fields accept a single value, an array, or embedded objects carrying an
//! `id`; everything else about the activity is left untyped.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::data::{Object, ObjectId};
use crate::error::AppError;

pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// Reference to another document, either by identifier or embedded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(String),
    Embedded(Map<String, Value>),
}

impl ObjectRef {
    /// Embed a serializable document
    pub fn embed<T: Serialize>(document: &T) -> Result<Self, AppError> {
        match serde_json::to_value(document) {
            Ok(Value::Object(map)) => Ok(Self::Embedded(map)),
            Ok(_) => Err(AppError::Validation(
                "Embedded document must be a JSON object".to_string(),
            )),
            Err(e) => Err(AppError::Validation(format!(
                "Failed to serialize embedded document: {}",
                e
            ))),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Id(id) => Some(id),
            Self::Embedded(map) => map.get("id").and_then(Value::as_str),
        }
    }

    /// `type` of an embedded document
    pub fn kind(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Embedded(map) => map.get("type").and_then(Value::as_str),
        }
    }
}

/// An ActivityPub activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub audience: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
}

impl Activity {
    fn new(kind: &str, id: String, actor: &str, object: ObjectRef) -> Self {
        Self {
            context: Some(Value::String(ACTIVITY_STREAMS_CONTEXT.to_string())),
            id: Some(id),
            kind: kind.to_string(),
            actor: Some(ObjectRef::Id(actor.to_string())),
            object: Some(object),
            to: Vec::new(),
            cc: Vec::new(),
            audience: Vec::new(),
            published: None,
        }
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor.as_ref()?.id()
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object.as_ref()?.id()
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    fn id_of(value: Value) -> Option<String> {
        match value {
            Value::String(id) => Some(id),
            Value::Object(map) => map.get("id").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }
    }

    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(items)) => items.into_iter().filter_map(id_of).collect(),
        Some(value) => id_of(value).into_iter().collect(),
        None => Vec::new(),
    })
}

/// Activity builders
pub mod builder {
    use super::*;

    /// Wrap a locally authored object in a Create
    ///
    /// The activity id is derived from the object id. Blind recipients are
    /// not copied into the payload.
    pub fn create(actor_id: &str, object: &Object) -> Result<Activity, AppError> {
        let outgoing = object.without_blind_recipients();
        let mut activity = Activity::new(
            "Create",
            format!("{}/activity", object.id),
            actor_id,
            ObjectRef::embed(&outgoing)?,
        );
        activity.to = outgoing.to.clone();
        activity.cc = outgoing.cc.clone();
        activity.audience = outgoing.audience.clone();
        activity.published = Some(
            object
                .published
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        Ok(activity)
    }

    /// Accept a received Follow
    pub fn accept(actor_id: &str, follow: &Activity) -> Result<Activity, AppError> {
        let mut embedded = Activity {
            context: None,
            ..follow.clone()
        };
        embedded.published = None;

        let mut activity = Activity::new(
            "Accept",
            format!("{}/accept/{}", actor_id, ObjectId::new()),
            actor_id,
            ObjectRef::embed(&embedded)?,
        );
        if let Some(follower) = follow.actor_id() {
            activity.to.push(follower.to_string());
        }
        activity.published = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true));
        Ok(activity)
    }
}
