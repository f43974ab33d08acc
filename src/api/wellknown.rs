//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderValue, header::CONTENT_TYPE},
    response::{IntoResponse, Json, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::AppError;
use crate::federation::ACTIVITY_CONTENT_TYPE;

const JRD_CONTENT_TYPE: &str = "application/jrd+json";
const PROFILE_PAGE_REL: &str = "http://webfinger.net/rel/profile-page";

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl IntoResponse for WebFingerResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self).into_response();
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(JRD_CONTENT_TYPE));
        response
    }
}

/// Build the JRD document for a local actor
pub fn webfinger_response(username: &str, domain: &str, actor_url: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: vec![actor_url.to_string()],
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some(ACTIVITY_CONTENT_TYPE.to_string()),
                href: Some(actor_url.to_string()),
            },
            WebFingerLink {
                rel: PROFILE_PAGE_REL.to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_url.to_string()),
            },
        ],
    }
}

/// Split `acct:[@]user[@domain]` into username and optional domain
fn parse_acct(resource: &str) -> Result<(&str, Option<&str>), AppError> {
    let acct = resource
        .strip_prefix("acct:")
        .ok_or_else(|| AppError::Validation("Resource must start with 'acct:'".to_string()))?;
    let acct = acct.strip_prefix('@').unwrap_or(acct);

    let (username, domain) = match acct.split_once('@') {
        Some((username, domain)) => (username, Some(domain)),
        None => (acct, None),
    };
    if username.is_empty() || domain.is_some_and(|d| d.is_empty() || d.contains('@')) {
        return Err(AppError::Validation("Invalid acct format".to_string()));
    }
    Ok((username, domain))
}

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: Option<String>,
}

/// GET /.well-known/webfinger
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<WebFingerResponse, AppError> {
    let resource = query
        .resource
        .ok_or_else(|| AppError::Validation("Missing resource parameter".to_string()))?;
    let (username, domain) = parse_acct(&resource)?;

    let local_domain = &state.config.server.domain;
    if domain.is_some_and(|d| !d.eq_ignore_ascii_case(local_domain)) {
        return Err(AppError::NotFound);
    }

    let actor = state
        .actors
        .find_by_username(username)
        .await
        .ok_or(AppError::NotFound)?;

    Ok(webfinger_response(
        &actor.username,
        local_domain,
        &state.urls.actor(&actor.username),
    ))
}
