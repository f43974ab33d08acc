//! Common test utilities for E2E tests
//!
//! `TestNode` runs a full node on a loopback port. `FakeRemote` plays a
//! remote server: it serves actor and object documents, records every
//! request it gets, can demand signed fetches and can hold inbox POSTs to
//! observe how many arrive at once.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use hearth::federation::signature::{self, Keypair};
use hearth::federation::{ACTIVITY_CONTENT_TYPE, sign_request};
use hearth::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const ADMIN_TOKEN: &str = "test-admin-token";
const TEST_KEY_BITS: usize = 1024;

/// Test node instance
pub struct TestNode {
    pub addr: String,
    pub state: AppState,
    pub client: reqwest::Client,
    pub _temp_dir: TempDir,
}

impl TestNode {
    /// Create a new test node with default test configuration
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test node, letting the caller adjust the configuration
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();

        // Bind first so the public domain can carry the real port
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: format!("127.0.0.1:{}", addr.port()),
                protocol: "http".to_string(),
            },
            storage: config::StorageConfig {
                actors_path: temp_dir.path().join("actor.json"),
                objects_path: temp_dir.path().join("object.json"),
            },
            federation: config::FederationConfig {
                max_concurrent_deliveries: 4,
                key_bits: TEST_KEY_BITS,
                request_timeout_seconds: Some(10),
                user_agent: "Hearth/test".to_string(),
            },
            instance: config::InstanceConfig {
                auto_accept_follow: true,
            },
            api: config::ApiConfig {
                admin_token: Some(ADMIN_TOKEN.to_string()),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };
        adjust(&mut config);

        let state = AppState::new(config).await.unwrap();
        let app = hearth::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{}", addr),
            state,
            client,
            _temp_dir: temp_dir,
        }
    }

    /// Get full URL for a path on this node
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Register a local actor and return its identifier
    pub async fn register(&self, username: &str) -> String {
        self.state.accounts.register(username).await.unwrap();
        self.state.urls.actor(username)
    }

    pub async fn public_key(&self, username: &str) -> String {
        self.state.actors.public_key(username).await.unwrap()
    }
}

/// How the fake remote treats unsigned fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignaturePolicy {
    /// Serve every fetch
    Open,
    /// Answer unsigned fetches with the "Request not signed" error
    RequireSigned,
    /// Answer every fetch with the "Request not signed" error
    AlwaysReject,
}

/// A request received by the fake remote
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn is_signed(&self) -> bool {
        self.headers.contains_key("signature")
    }
}

struct RemoteAccount {
    keypair: Keypair,
    shared_inbox: bool,
}

struct FakeState {
    base: String,
    accounts: Mutex<HashMap<String, RemoteAccount>>,
    objects: Mutex<HashMap<String, Value>>,
    policy: Mutex<SignaturePolicy>,
    requests: Mutex<Vec<RecordedRequest>>,
    inbox_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeState {
    fn record(&self, method: Method, uri: &Uri, headers: HeaderMap, body: Vec<u8>) {
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        self.requests.lock().unwrap().push(RecordedRequest {
            method,
            path,
            headers,
            body,
        });
    }
}

/// Fake remote ActivityPub server
pub struct FakeRemote {
    pub base: String,
    state: Arc<FakeState>,
    client: reqwest::Client,
}

impl FakeRemote {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let state = Arc::new(FakeState {
            base: base.clone(),
            accounts: Mutex::new(HashMap::new()),
            objects: Mutex::new(HashMap::new()),
            policy: Mutex::new(SignaturePolicy::Open),
            requests: Mutex::new(Vec::new()),
            inbox_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/users/:username", get(remote_actor))
            .route("/objects/:id", get(remote_object))
            .route("/users/:username/inbox", post(remote_inbox))
            .route("/inbox", post(remote_inbox))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            state,
            client: reqwest::Client::new(),
        }
    }

    /// Add a remote actor with a fresh keypair and return its identifier
    pub fn add_actor(&self, username: &str, shared_inbox: bool) -> String {
        let keypair = signature::generate_keypair_with_bits(TEST_KEY_BITS).unwrap();
        self.state.accounts.lock().unwrap().insert(
            username.to_string(),
            RemoteAccount {
                keypair,
                shared_inbox,
            },
        );
        self.actor_id(username)
    }

    pub fn actor_id(&self, username: &str) -> String {
        format!("{}/users/{}", self.base, username)
    }

    /// Serve a Note at `/objects/{id}` and return its identifier
    pub fn add_object(&self, id: &str, author: &str, published: &str, content: &str) -> String {
        let object_id = format!("{}/objects/{}", self.base, id);
        let object = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": object_id,
            "type": "Note",
            "attributedTo": self.actor_id(author),
            "content": content,
            "published": published,
            "to": ["https://www.w3.org/ns/activitystreams#Public"]
        });
        self.state
            .objects
            .lock()
            .unwrap()
            .insert(id.to_string(), object);
        object_id
    }

    pub fn set_policy(&self, policy: SignaturePolicy) {
        *self.state.policy.lock().unwrap() = policy;
    }

    /// Hold every inbox POST for `delay` before answering
    pub fn set_inbox_delay(&self, delay: Duration) {
        *self.state.inbox_delay.lock().unwrap() = delay;
    }

    /// Most inbox POSTs ever being handled at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn gets(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::GET && r.path == path)
            .collect()
    }

    pub fn posts(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::POST)
            .collect()
    }

    /// Poll until at least `count` POSTs arrived, or give up after a few seconds
    pub async fn wait_for_posts(&self, count: usize) -> Vec<RecordedRequest> {
        for _ in 0..100 {
            let posts = self.posts();
            if posts.len() >= count {
                return posts;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.posts()
    }

    /// POST an activity to `url`, signed as the remote actor `username`
    pub async fn signed_post(&self, username: &str, url: &str, activity: &Value) -> reqwest::Response {
        let request = self.signed_request(username, url, activity);
        self.client.execute(request).await.unwrap()
    }

    /// Like `signed_post`, but the actor's advertised key is replaced
    /// between signing and sending
    pub async fn signed_post_after_rotation(
        &self,
        username: &str,
        url: &str,
        activity: &Value,
    ) -> reqwest::Response {
        let request = self.signed_request(username, url, activity);
        let keypair = signature::generate_keypair_with_bits(TEST_KEY_BITS).unwrap();
        if let Some(account) = self.state.accounts.lock().unwrap().get_mut(username) {
            account.keypair = keypair;
        }
        self.client.execute(request).await.unwrap()
    }

    fn signed_request(&self, username: &str, url: &str, activity: &Value) -> reqwest::Request {
        let private_key = self.state.accounts.lock().unwrap()[username]
            .keypair
            .private_key_pem
            .clone();
        let key_id = format!("{}#main-key", self.actor_id(username));

        let parsed = url::Url::parse(url).unwrap();
        let host = format!(
            "{}:{}",
            parsed.host_str().unwrap(),
            parsed.port_or_known_default().unwrap()
        );

        let mut request = http::Request::builder()
            .method(Method::POST)
            .uri(url)
            .header("date", signature::http_date(Utc::now()))
            .header("host", host)
            .header("content-type", ACTIVITY_CONTENT_TYPE)
            .body(serde_json::to_vec(activity).unwrap())
            .unwrap();
        sign_request(&private_key, &key_id, &mut request).unwrap();

        reqwest::Request::try_from(request).unwrap()
    }
}

fn signature_required() -> Response {
    Json(json!({ "error": "Request not signed" })).into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

/// Refusal to send for a fetch under the current policy, if any
fn refuse_fetch(state: &FakeState, signed: bool) -> Option<Response> {
    match *state.policy.lock().unwrap() {
        SignaturePolicy::Open => None,
        SignaturePolicy::RequireSigned if signed => None,
        SignaturePolicy::RequireSigned | SignaturePolicy::AlwaysReject => {
            Some(signature_required())
        }
    }
}

async fn remote_actor(
    State(state): State<Arc<FakeState>>,
    Path(username): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let signed = headers.contains_key("signature");
    state.record(Method::GET, &uri, headers, Vec::new());

    if let Some(refusal) = refuse_fetch(&state, signed) {
        return refusal;
    }

    let accounts = state.accounts.lock().unwrap();
    let Some(account) = accounts.get(&username) else {
        return not_found();
    };

    let id = format!("{}/users/{}", state.base, username);
    let mut document = json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "id": id,
        "type": "Person",
        "preferredUsername": username,
        "inbox": format!("{}/inbox", id),
        "outbox": format!("{}/outbox", id),
        "publicKey": {
            "id": format!("{}#main-key", id),
            "owner": id,
            "publicKeyPem": account.keypair.public_key_pem
        }
    });
    if account.shared_inbox {
        document["endpoints"] = json!({ "sharedInbox": format!("{}/inbox", state.base) });
    }

    (
        [(axum::http::header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)],
        Json(document),
    )
        .into_response()
}

async fn remote_object(
    State(state): State<Arc<FakeState>>,
    Path(id): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let signed = headers.contains_key("signature");
    state.record(Method::GET, &uri, headers, Vec::new());

    if let Some(refusal) = refuse_fetch(&state, signed) {
        return refusal;
    }

    match state.objects.lock().unwrap().get(&id) {
        Some(object) => (
            [(axum::http::header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)],
            Json(object.clone()),
        )
            .into_response(),
        None => not_found(),
    }
}

async fn remote_inbox(
    State(state): State<Arc<FakeState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_in_flight.fetch_max(current, Ordering::SeqCst);

    let delay = *state.inbox_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    state.record(Method::POST, &uri, headers, body.to_vec());
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    StatusCode::ACCEPTED
}
