#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use r2e_oidc_client::{
    AuthStorage, CallbackOutcome, CallbackParams, ClientConfiguration, InMemorySessionStore,
    OidcClient, OidcError,
};
use rand::rngs::OsRng;
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};

pub const CLIENT_ID: &str = "test-client";
pub const CLIENT_SECRET: &str = "test-secret";
pub const SUBJECT: &str = "user-1";
pub const APP_BASE_URL: &str = "http://app.test";

/// RSA signing key with its public JWK.
pub struct TestKey {
    pub kid: String,
    encoding_key: EncodingKey,
    jwk: Value,
}

impl TestKey {
    fn generate(kid: &str) -> Self {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, 2048).expect("failed to generate RSA-2048 key");
        let public_key = RsaPublicKey::from(&private_key);

        let pkcs8_pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .expect("failed to export RSA key as PKCS8 PEM");
        let encoding_key = EncodingKey::from_rsa_pem(pkcs8_pem.as_bytes())
            .expect("failed to create EncodingKey from RSA PEM");

        let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());

        Self {
            kid: kid.to_string(),
            encoding_key,
            jwk: json!({ "kty": "RSA", "alg": "RS256", "use": "sig", "kid": kid, "n": n, "e": e }),
        }
    }

    pub fn sign(&self, claims: &Value) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding_key).expect("failed to sign token")
    }

    pub fn sign_without_kid(&self, claims: &Value) -> String {
        encode(&Header::new(Algorithm::RS256), claims, &self.encoding_key)
            .expect("failed to sign token")
    }

    pub fn jwk(&self) -> Value {
        self.jwk.clone()
    }
}

/// Key generation is slow in debug builds, so each test binary shares two keys.
pub fn primary_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| TestKey::generate("key-1"))
}

pub fn rotated_key() -> &'static TestKey {
    static KEY: OnceLock<TestKey> = OnceLock::new();
    KEY.get_or_init(|| TestKey::generate("key-2"))
}

pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[derive(Default)]
pub struct Counters {
    pub discovery: AtomicUsize,
    pub jwks: AtomicUsize,
    pub token: AtomicUsize,
    pub refresh: AtomicUsize,
    pub userinfo: AtomicUsize,
}

struct IdpState {
    issuer: String,
    counters: Counters,
    published: Mutex<Vec<Value>>,
    jwks_delay: Mutex<Duration>,
    jwks_status: Mutex<u16>,
    token_response: Mutex<(u16, Value)>,
    refresh_response: Mutex<(u16, Value)>,
    refresh_delay: Mutex<Duration>,
    userinfo: Mutex<Value>,
    token_requests: Mutex<Vec<(HashMap<String, String>, Option<String>)>>,
}

/// In-process identity provider serving discovery, JWKS, token and userinfo
/// on a loopback port. Its end-session endpoint is advertised but not served.
#[derive(Clone)]
pub struct MockIdp {
    pub base_url: String,
    state: Arc<IdpState>,
}

impl MockIdp {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let state = Arc::new(IdpState {
            issuer: base_url.clone(),
            counters: Counters::default(),
            published: Mutex::new(vec![primary_key().jwk()]),
            jwks_delay: Mutex::new(Duration::ZERO),
            jwks_status: Mutex::new(200),
            token_response: Mutex::new((500, json!({ "error": "not_configured" }))),
            refresh_response: Mutex::new((400, json!({ "error": "invalid_grant" }))),
            refresh_delay: Mutex::new(Duration::ZERO),
            userinfo: Mutex::new(json!({ "sub": SUBJECT, "email": "alice@example.com" })),
            token_requests: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/.well-known/openid-configuration", get(discovery))
            .route("/jwks", get(jwks))
            .route("/token", post(token))
            .route("/userinfo", get(userinfo))
            .with_state(Arc::clone(&state));

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, state }
    }

    pub fn issuer(&self) -> &str {
        &self.state.issuer
    }

    pub fn jwks_uri(&self) -> String {
        format!("{}/jwks", self.base_url)
    }

    /// Client configuration pointing at this provider.
    pub fn config(&self) -> ClientConfiguration {
        ClientConfiguration::new(
            self.base_url.clone(),
            CLIENT_ID,
            CLIENT_SECRET,
            "${baseURL}/callback",
        )
    }

    pub fn client(&self, config: ClientConfiguration) -> OidcClient {
        OidcClient::new(config).expect("valid configuration")
    }

    /// Standard ID token claims for [`SUBJECT`], valid for five minutes.
    pub fn id_claims(&self, nonce: Option<&str>) -> Value {
        let now = now_secs();
        let mut claims = json!({
            "iss": self.issuer(),
            "sub": SUBJECT,
            "aud": CLIENT_ID,
            "iat": now,
            "exp": now + 300,
            "preferred_username": "alice",
            "groups": ["admin", "dev"],
        });
        if let Some(nonce) = nonce {
            claims["nonce"] = nonce.into();
        }
        claims
    }

    pub fn publish_keys(&self, keys: &[&TestKey]) {
        *self.state.published.lock().unwrap() = keys.iter().map(|k| k.jwk()).collect();
    }

    pub fn publish_jwks(&self, jwks: Vec<Value>) {
        *self.state.published.lock().unwrap() = jwks;
    }

    pub fn set_jwks_delay(&self, delay: Duration) {
        *self.state.jwks_delay.lock().unwrap() = delay;
    }

    pub fn set_jwks_status(&self, status: u16) {
        *self.state.jwks_status.lock().unwrap() = status;
    }

    pub fn set_token_response(&self, status: u16, body: Value) {
        *self.state.token_response.lock().unwrap() = (status, body);
    }

    pub fn set_refresh_response(&self, status: u16, body: Value) {
        *self.state.refresh_response.lock().unwrap() = (status, body);
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.state.refresh_delay.lock().unwrap() = delay;
    }

    pub fn set_userinfo(&self, body: Value) {
        *self.state.userinfo.lock().unwrap() = body;
    }

    pub fn counters(&self) -> &Counters {
        &self.state.counters
    }

    pub fn discovery_hits(&self) -> usize {
        self.state.counters.discovery.load(Ordering::SeqCst)
    }

    pub fn jwks_hits(&self) -> usize {
        self.state.counters.jwks.load(Ordering::SeqCst)
    }

    pub fn token_hits(&self) -> usize {
        self.state.counters.token.load(Ordering::SeqCst)
    }

    pub fn refresh_hits(&self) -> usize {
        self.state.counters.refresh.load(Ordering::SeqCst)
    }

    pub fn userinfo_hits(&self) -> usize {
        self.state.counters.userinfo.load(Ordering::SeqCst)
    }

    /// Form fields and `Authorization` header of every token endpoint call.
    pub fn token_requests(&self) -> Vec<(HashMap<String, String>, Option<String>)> {
        self.state.token_requests.lock().unwrap().clone()
    }
}

async fn discovery(State(state): State<Arc<IdpState>>) -> Json<Value> {
    state.counters.discovery.fetch_add(1, Ordering::SeqCst);
    let base = &state.issuer;
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/token"),
        "userinfo_endpoint": format!("{base}/userinfo"),
        "jwks_uri": format!("{base}/jwks"),
        "end_session_endpoint": format!("{base}/logout"),
        "id_token_signing_alg_values_supported": ["RS256"],
        "scopes_supported": ["openid", "email", "profile"],
        "response_types_supported": ["code"],
    }))
}

async fn jwks(State(state): State<Arc<IdpState>>) -> Response {
    state.counters.jwks.fetch_add(1, Ordering::SeqCst);
    let delay = *state.jwks_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let status = *state.jwks_status.lock().unwrap();
    if status != 200 {
        return StatusCode::from_u16(status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response();
    }
    let keys = state.published.lock().unwrap().clone();
    Json(json!({ "keys": keys })).into_response()
}

async fn token(
    State(state): State<Arc<IdpState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    state.counters.token.fetch_add(1, Ordering::SeqCst);
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let grant = form.get("grant_type").cloned().unwrap_or_default();
    state
        .token_requests
        .lock()
        .unwrap()
        .push((form, authorization));

    let (status, body) = if grant == "refresh_token" {
        state.counters.refresh.fetch_add(1, Ordering::SeqCst);
        let delay = *state.refresh_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        state.refresh_response.lock().unwrap().clone()
    } else {
        state.token_response.lock().unwrap().clone()
    };
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(body)).into_response()
}

async fn userinfo(State(state): State<Arc<IdpState>>, headers: HeaderMap) -> Response {
    state.counters.userinfo.fetch_add(1, Ordering::SeqCst);
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !bearer.starts_with("Bearer ") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(state.userinfo.lock().unwrap().clone()).into_response()
}

/// Query parameters of a URL, first value per key.
pub fn query_params(url: &str) -> HashMap<String, String> {
    let query = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
    let mut params = HashMap::new();
    for (k, v) in form_urlencoded::parse(query.as_bytes()) {
        params.entry(k.into_owned()).or_insert(v.into_owned());
    }
    params
}

/// Start a login and return `(state, nonce)` from the redirect.
pub async fn begin(client: &OidcClient, store: &InMemorySessionStore) -> (String, Option<String>) {
    let redirect = client
        .begin_authentication(AuthStorage::single(store), "/protected", APP_BASE_URL)
        .await
        .expect("redirect");
    let params = query_params(redirect.url());
    (params["state"].clone(), params.get("nonce").cloned())
}

/// Token endpoint body carrying `id_token` and a refresh token.
pub fn token_body(id_token: &str, expires_in: i64) -> Value {
    json!({
        "access_token": "access-1",
        "token_type": "Bearer",
        "expires_in": expires_in,
        "refresh_token": "refresh-1",
        "id_token": id_token,
        "scope": "openid email profile",
    })
}

pub fn callback(state: &str, code: &str) -> CallbackParams {
    CallbackParams {
        state: Some(state.to_string()),
        code: Some(code.to_string()),
        ..Default::default()
    }
}

/// Full happy-path login for `session_id`, with tokens valid for `expires_in` seconds.
pub async fn login(
    client: &OidcClient,
    idp: &MockIdp,
    store: &InMemorySessionStore,
    session_id: &str,
    expires_in: i64,
) -> Result<CallbackOutcome, OidcError> {
    let (state, nonce) = begin(client, store).await;
    let id_token = primary_key().sign(&idp.id_claims(nonce.as_deref()));
    idp.set_token_response(200, token_body(&id_token, expires_in));
    client
        .handle_callback(AuthStorage::single(store), session_id, &callback(&state, "code-1"))
        .await
}
