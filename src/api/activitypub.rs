//! ActivityPub endpoints
//!
//! - Actor profile
//! - Inbox (activity receiving), personal and shared
//! - Outbox
//! - Followers/Following collections
//! - Object documents

use axum::body::Bytes;
use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, Uri, header::CONTENT_TYPE},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::AppState;
use crate::data::{INSTANCE_ACTOR, ObjectId, is_public_address};
use crate::error::AppError;
use crate::federation::{
    ACTIVITY_CONTENT_TYPE, ACTIVITY_STREAMS_CONTEXT, Activity, InboxTarget, SECURITY_CONTEXT,
    builder, key_id_matches_actor, signature, verify_parts,
};
use crate::metrics::{FEDERATION_REQUESTS_TOTAL, SIGNATURE_VERIFICATIONS_TOTAL};

/// JSON response labelled `application/activity+json`
pub struct ActivityJson<T>(pub T);

impl<T: Serialize> IntoResponse for ActivityJson<T> {
    fn into_response(self) -> Response {
        let mut response = Json(self.0).into_response();
        if response.status().is_success() {
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_CONTENT_TYPE));
        }
        response
    }
}

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor profile
/// - GET /users/:username/inbox - Inbox collection
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
/// - GET /objects/:id - Object document
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", get(inbox_collection).post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/outbox", get(outbox))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
        .route("/objects/:id", get(object))
}

/// GET /users/:username
///
/// Returns ActivityPub Actor document.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson<Value>, AppError> {
    let actor = state
        .actors
        .find_by_username(&username)
        .await
        .ok_or(AppError::NotFound)?;
    let public_key_pem = state.actors.public_key(&actor.username).await?;

    let urls = &state.urls;
    let actor_url = urls.actor(&actor.username);
    let kind = if actor.username == INSTANCE_ACTOR {
        "Application"
    } else {
        "Person"
    };

    Ok(ActivityJson(json!({
        "@context": [ACTIVITY_STREAMS_CONTEXT, SECURITY_CONTEXT],
        "type": kind,
        "id": actor_url,
        "preferredUsername": actor.username,
        "name": actor.username,
        "inbox": urls.inbox(&actor.username),
        "outbox": urls.outbox(&actor.username),
        "followers": urls.followers(&actor.username),
        "following": urls.following(&actor.username),
        "url": actor_url,
        "published": actor.created_at.to_rfc3339(),
        "endpoints": {
            "sharedInbox": urls.shared_inbox()
        },
        "publicKey": {
            "id": urls.key_id(&actor.username),
            "owner": actor_url,
            "publicKeyPem": public_key_pem
        }
    })))
}

/// POST /users/:username/inbox
///
/// Receives incoming ActivityPub activities.
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ActivityJson<Value>, AppError> {
    if state.actors.find_by_username(&username).await.is_none() {
        return Err(AppError::NotFound);
    }

    receive(&state, InboxTarget::Actor(&username), &uri, &headers, &body).await?;
    Ok(ActivityJson(json!({
        "id": state.urls.inbox(&username),
        "type": "OrderedCollection"
    })))
}

/// POST /inbox
///
/// Shared inbox for all users on this instance.
async fn shared_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<ActivityJson<Value>, AppError> {
    receive(&state, InboxTarget::Shared, &uri, &headers, &body).await?;
    Ok(ActivityJson(json!({
        "id": state.urls.shared_inbox(),
        "type": "OrderedCollection"
    })))
}

/// Authenticate and apply one inbound delivery
///
/// # Steps
/// 1. Require a Signature header
/// 2. Parse the activity
/// 3. Check the keyId belongs to the activity's actor
/// 4. Fetch the actor's public key and verify the signature
/// 5. Process based on type
async fn receive(
    state: &AppState,
    target: InboxTarget<'_>,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    // Check for Signature header first (reject unsigned requests immediately)
    if headers.get("signature").is_none() {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
        return Err(AppError::Unauthorized);
    }

    let activity: Activity = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("Invalid activity: {}", e)))?;

    let actor_id = activity
        .actor_id()
        .ok_or_else(|| AppError::Validation("Missing actor field".to_string()))?;

    // Ensure keyId points to the same actor before fetching remote key material.
    let key_id = signature::extract_key_id(headers).ok_or(AppError::Unauthorized)?;
    if !key_id_matches_actor(&key_id, actor_id) {
        FEDERATION_REQUESTS_TOTAL
            .with_label_values(&["inbound", "unauthorized"])
            .inc();
        return Err(AppError::Validation(
            "Signature keyId actor mismatch".to_string(),
        ));
    }

    let public_key_pem = state
        .resolver
        .fetch_public_key(&key_id)
        .await
        .inspect_err(|e| tracing::warn!(key_id = %key_id, error = %e, "Failed to fetch signer key"))?;

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    if !verify_parts(&public_key_pem, &Method::POST, path_and_query, headers, body) {
        SIGNATURE_VERIFICATIONS_TOTAL
            .with_label_values(&["invalid"])
            .inc();
        tracing::warn!(key_id = %key_id, "Rejected activity with invalid signature");
        return Err(AppError::InvalidSignature);
    }
    SIGNATURE_VERIFICATIONS_TOTAL.with_label_values(&["valid"]).inc();

    state.inbox.process(target, &activity).await?;

    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", "success"])
        .inc();
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    #[serde(default)]
    page: Option<bool>,
}

/// GET /users/:username/outbox
///
/// Without `?page=true` returns the collection head; with it, the page of
/// publicly addressed Create activities, newest first.
async fn outbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<ActivityJson<Value>, AppError> {
    let actor = state
        .actors
        .find_by_username(&username)
        .await
        .ok_or(AppError::NotFound)?;
    let outbox_url = state.urls.outbox(&username);

    if query.page != Some(true) {
        return Ok(ActivityJson(json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "OrderedCollection",
            "id": outbox_url,
            "totalItems": actor.outbox.len(),
            "first": format!("{}?page=true", outbox_url),
        })));
    }

    let actor_id = state.urls.actor(&username);
    let mut items = Vec::new();
    for object_id in actor.outbox.iter().rev() {
        let Some(object) = state.objects.find_by_id(object_id).await else {
            continue;
        };
        if !object.addressees().into_iter().any(is_public_address) {
            continue;
        }
        let mut activity = builder::create(&actor_id, &object)?;
        activity.context = None;
        items.push(activity);
    }

    Ok(ActivityJson(json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "type": "OrderedCollectionPage",
        "id": format!("{}?page=true", outbox_url),
        "partOf": outbox_url,
        "orderedItems": items,
    })))
}

/// GET /users/:username/inbox
///
/// Collection head, or with `?page=true` the received object ids, newest first.
async fn inbox_collection(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<ActivityJson<Value>, AppError> {
    let actor = state
        .actors
        .find_by_username(&username)
        .await
        .ok_or(AppError::NotFound)?;
    let inbox_url = state.urls.inbox(&username);

    if query.page != Some(true) {
        return Ok(ActivityJson(json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "OrderedCollection",
            "id": inbox_url,
            "totalItems": actor.inbox.len(),
            "first": format!("{}?page=true", inbox_url),
        })));
    }

    let items: Vec<&String> = actor.inbox.iter().rev().collect();
    Ok(ActivityJson(json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "type": "OrderedCollectionPage",
        "id": format!("{}?page=true", inbox_url),
        "partOf": inbox_url,
        "orderedItems": items,
    })))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson<Value>, AppError> {
    let actor = state
        .actors
        .find_by_username(&username)
        .await
        .ok_or(AppError::NotFound)?;

    Ok(ActivityJson(json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "type": "OrderedCollection",
        "id": state.urls.followers(&username),
        "totalItems": actor.followers.len(),
        "orderedItems": actor.followers,
    })))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<ActivityJson<Value>, AppError> {
    let actor = state
        .actors
        .find_by_username(&username)
        .await
        .ok_or(AppError::NotFound)?;

    Ok(ActivityJson(json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "type": "OrderedCollection",
        "id": state.urls.following(&username),
        "totalItems": actor.following.len(),
        "orderedItems": actor.following,
    })))
}

/// GET /objects/:id
///
/// Only publicly addressed objects are served.
async fn object(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ActivityJson<Value>, AppError> {
    let object_id = state.urls.object(&ObjectId(id));
    let object = state
        .objects
        .find_by_id(&object_id)
        .await
        .ok_or(AppError::NotFound)?;
    if !object.addressees().into_iter().any(is_public_address) {
        return Err(AppError::NotFound);
    }

    let mut document = serde_json::to_value(object.without_blind_recipients())
        .map_err(|e| AppError::Internal(e.into()))?;
    if let Value::Object(map) = &mut document {
        map.insert("@context".to_string(), json!(ACTIVITY_STREAMS_CONTEXT));
    }
    Ok(ActivityJson(document))
}
