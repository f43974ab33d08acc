//! Note service
//!
//! Authors notes on behalf of local actors and hands them to the delivery
//! dispatcher.

use serde::Deserialize;

use crate::data::{
    INSTANCE_ACTOR, LocalUrls, Object, PUBLIC_ADDRESS, SharedActors, SharedObjects,
};
use crate::error::AppError;
use crate::federation::{DeliveryBatch, DeliveryDispatcher};

const MAX_NOTE_LENGTH: usize = 5000;
const WELCOME_NOTE: &str = "Hello, World!";

/// Who a note is addressed to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Unlisted,
    Private,
    Direct,
}

/// `to` and `cc` audiences for a visibility level
pub fn audience_for_visibility(actor_id: &str, visibility: Visibility) -> (Vec<String>, Vec<String>) {
    let public_audience = PUBLIC_ADDRESS.to_string();
    let followers_audience = format!("{}/followers", actor_id);

    match visibility {
        Visibility::Public => (vec![public_audience], vec![followers_audience]),
        Visibility::Unlisted => (vec![followers_audience], vec![public_audience]),
        Visibility::Private => (vec![followers_audience], Vec::new()),
        Visibility::Direct => (Vec::new(), Vec::new()),
    }
}

/// Request to author a note
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewNote {
    pub content: String,
    #[serde(default)]
    pub visibility: Visibility,
    /// Actor identifiers to mention
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

fn mention_name(actor_id: &str) -> String {
    match url::Url::parse(actor_id) {
        Ok(url) => {
            let username = url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|segment| !segment.is_empty())
                .unwrap_or_default();
            let host = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{}:{}", host, port),
                (Some(host), None) => host.to_string(),
                (None, _) => String::new(),
            };
            format!("@{}@{}", username, host)
        }
        Err(_) => actor_id.to_string(),
    }
}

/// Note service
pub struct NoteService {
    actors: SharedActors,
    objects: SharedObjects,
    dispatcher: DeliveryDispatcher,
    urls: LocalUrls,
}

impl NoteService {
    pub fn new(
        actors: SharedActors,
        objects: SharedObjects,
        dispatcher: DeliveryDispatcher,
        urls: LocalUrls,
    ) -> Self {
        Self {
            actors,
            objects,
            dispatcher,
            urls,
        }
    }

    /// Author a note and dispatch its Create
    ///
    /// The note is stored and appended to the author's outbox before
    /// delivery starts. The returned batch may be awaited or dropped.
    pub async fn post(
        &self,
        username: &str,
        request: NewNote,
    ) -> Result<(Object, DeliveryBatch), AppError> {
        let content = request.content.trim();
        if content.is_empty() {
            return Err(AppError::Validation("Note content is empty".to_string()));
        }
        if content.chars().count() > MAX_NOTE_LENGTH {
            return Err(AppError::Validation(format!(
                "Note content exceeds {} characters",
                MAX_NOTE_LENGTH
            )));
        }

        self.actors
            .find_by_username(username)
            .await
            .ok_or(AppError::NotFound)?;

        let actor_id = self.urls.actor(username);
        let mut note = Object::note(&self.urls, &actor_id, content);

        let (to, cc) = audience_for_visibility(&actor_id, request.visibility);
        to.iter().for_each(|address| note.add_to(address));
        cc.iter().for_each(|address| note.add_cc(address));

        for mention in &request.mentions {
            if request.visibility == Visibility::Direct {
                note.add_to(mention);
            } else {
                note.add_cc(mention);
            }
            note.add_mention(&mention_name(mention), mention);
        }
        note.in_reply_to = request.in_reply_to;

        let author = self.store(username, note.clone()).await?;
        let batch = self.dispatcher.send_create(&author, &note)?;
        Ok((note, batch))
    }

    /// Seed the instance actor's first note when the object store is empty
    pub async fn seed_welcome_note(&self) -> Result<Option<Object>, AppError> {
        if !self.objects.list().await.is_empty() {
            return Ok(None);
        }

        let mut note = Object::note(&self.urls, &self.urls.actor(INSTANCE_ACTOR), WELCOME_NOTE);
        note.add_to(PUBLIC_ADDRESS);
        self.store(INSTANCE_ACTOR, note.clone()).await?;

        tracing::info!(object_id = %note.id, "Welcome note created");
        Ok(Some(note))
    }

    async fn store(&self, username: &str, note: Object) -> Result<crate::data::Actor, AppError> {
        let object_id = note.id.clone();
        self.objects.insert(note).await?;
        self.actors.append_outbox(username, &object_id).await?;

        if let Err(e) = self.objects.save().await {
            tracing::warn!(error = %e, "Failed to persist objects");
        }
        if let Err(e) = self.actors.save().await {
            tracing::warn!(error = %e, "Failed to persist actors");
        }

        self.actors
            .find_by_username(username)
            .await
            .ok_or(AppError::NotFound)
    }
}
