//! Local API
//!
//! Administrative endpoints for registering actors, authoring notes and
//! reading an actor's timeline.
//! Every request needs `Authorization: Bearer <api.admin_token>`; without a
//! configured token the whole API answers 404.

use std::collections::HashSet;

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use subtle::ConstantTimeEq;

use crate::AppState;
use crate::error::AppError;
use crate::federation::{ACTIVITY_STREAMS_CONTEXT, SECURITY_CONTEXT};
use crate::service::NewNote;

/// Extract bearer token from headers
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Compare tokens without short-circuiting on the first differing byte
fn token_matches(token: &str, expected: &str) -> bool {
    if expected.is_empty() || token.len() != expected.len() {
        return false;
    }
    token.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Reject requests not carrying the configured admin token
async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(expected) = state.config.api.admin_token.as_deref() else {
        return Err(AppError::NotFound);
    };

    match extract_bearer_token(request.headers()) {
        Some(token) if token_matches(token, expected) => Ok(next.run(request).await),
        Some(_) => Err(AppError::Forbidden),
        None => Err(AppError::Unauthorized),
    }
}

/// Create local API router
///
/// Routes:
/// - POST /api/v1/accounts - Register an actor
/// - POST /api/v1/accounts/:username/notes - Author a note
/// - GET /api/v1/accounts/:username/timeline - Received and authored objects
pub fn local_api_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/v1/accounts", post(register_account))
        .route("/v1/accounts/:username/notes", post(create_note))
        .route("/v1/accounts/:username/timeline", get(timeline))
        .route_layer(middleware::from_fn_with_state(state, require_admin_token))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
}

/// POST /api/v1/accounts
async fn register_account(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let actor = state.accounts.register(&request.username).await?;
    let urls = &state.urls;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": urls.actor(&actor.username),
            "username": actor.username,
            "inbox": urls.inbox(&actor.username),
            "outbox": urls.outbox(&actor.username),
        })),
    ))
}

/// POST /api/v1/accounts/:username/notes
///
/// Stores the note and starts delivery; the response does not wait for it.
async fn create_note(
    State(state): State<AppState>,
    Path(username): Path<String>,
    Json(request): Json<NewNote>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let (note, batch) = state.notes.post(&username, request).await?;
    batch.detach();

    let body = serde_json::to_value(&note).map_err(|e| AppError::Internal(e.into()))?;
    Ok((StatusCode::CREATED, Json(body)))
}

/// GET /api/v1/accounts/:username/timeline
///
/// Inbox and outbox objects wrapped as `Create` activities, newest first.
/// Local objects come from the store; everything else is fetched acting as
/// the timeline owner. Objects that cannot be fetched are left out.
async fn timeline(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<Value>, AppError> {
    let actor = state
        .actors
        .find_by_username(&username)
        .await
        .ok_or(AppError::NotFound)?;
    let owner_id = state.urls.actor(&username);

    let mut seen = HashSet::new();
    let ids: Vec<&str> = actor
        .inbox
        .iter()
        .chain(actor.outbox.iter())
        .map(String::as_str)
        .filter(|id| seen.insert(*id))
        .collect();

    let lookups = ids.into_iter().map(|id| {
        let state = &state;
        let username = username.as_str();
        async move { (id, timeline_object(state, id, username).await) }
    });

    let mut entries: Vec<(Option<DateTime<Utc>>, Value)> = Vec::new();
    for (id, fetched) in join_all(lookups).await {
        let object = match fetched {
            Ok(object) => object,
            Err(e) => {
                tracing::warn!(object_id = %id, error = %e, "Skipping timeline object");
                continue;
            }
        };

        let published = object.get("published").cloned().unwrap_or(Value::Null);
        let sort_key = published
            .as_str()
            .and_then(|p| DateTime::parse_from_rfc3339(p).ok())
            .map(|p| p.with_timezone(&Utc));
        let author = object
            .get("attributedTo")
            .and_then(Value::as_str)
            .unwrap_or(&owner_id)
            .to_string();

        entries.push((
            sort_key,
            json!({
                "type": "Create",
                "actor": author,
                "published": published,
                "object": object,
            }),
        ));
    }
    // Undated objects sort last.
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let items: Vec<Value> = entries.into_iter().map(|(_, item)| item).collect();
    Ok(Json(json!({
        "@context": [ACTIVITY_STREAMS_CONTEXT, SECURITY_CONTEXT],
        "id": format!("{}/api/v1/accounts/{}/timeline", state.urls.base_url(), username),
        "type": "OrderedCollection",
        "totalItems": items.len(),
        "orderedItems": items,
    })))
}

async fn timeline_object(
    state: &AppState,
    id: &str,
    username: &str,
) -> Result<Map<String, Value>, AppError> {
    match state.objects.find_by_id(id).await {
        Some(object) => match serde_json::to_value(object.without_blind_recipients()) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(AppError::Internal(anyhow::anyhow!(
                "Object {} did not serialize to a map",
                id
            ))),
            Err(e) => Err(AppError::Internal(e.into())),
        },
        None => state.resolver.fetch(id, username, false).await,
    }
}
