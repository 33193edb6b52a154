use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;

use crate::claims::Identity;
use crate::validator::{numeric_claim, peek_claims, IdTokenClaims};

/// Successful response of the token endpoint, for both the authorization code
/// and the refresh token grants.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Some providers send `expires_in` as a string.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .field("scope", &self.scope)
            .finish()
    }
}

/// A validated ID token. Only the validator creates these.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdToken {
    raw: String,
    claims: IdTokenClaims,
}

impl IdToken {
    pub(crate) fn new(raw: String, claims: IdTokenClaims) -> Self {
        Self { raw, claims }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn claims(&self) -> &IdTokenClaims {
        &self.claims
    }
}

impl std::fmt::Debug for IdToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdToken")
            .field("sub", &self.claims.subject())
            .field("exp", &self.claims.expires_at())
            .finish_non_exhaustive()
    }
}

/// An access token, opaque or JWT. JWT claims are read without verification.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccessToken {
    raw: String,
    claims: Option<serde_json::Value>,
}

impl AccessToken {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let claims = peek_claims(&raw);
        Self { raw, claims }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn claims(&self) -> Option<&serde_json::Value> {
        self.claims.as_ref()
    }

    pub fn is_jwt(&self) -> bool {
        self.claims.is_some()
    }

    /// `exp` in milliseconds since the Unix epoch, when the token is a JWT.
    pub fn expires_at(&self) -> Option<i64> {
        numeric_claim(self.claims.as_ref()?, "exp").map(|secs| secs.saturating_mul(1000))
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("jwt", &self.is_jwt())
            .finish_non_exhaustive()
    }
}

/// Tokens held for one session.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub id_token: IdToken,
    pub access_token: AccessToken,
    pub refresh_token: Option<String>,
    /// Milliseconds since the Unix epoch. `None` when nothing told us.
    pub expires_at: Option<i64>,
    pub scope: Vec<String>,
    pub token_type: String,
}

impl TokenSet {
    /// Build from a token endpoint response whose ID token has been validated.
    ///
    /// Expiry comes from `expires_in`, else the access token's `exp`, else the
    /// ID token's `exp`.
    pub(crate) fn from_response(response: TokenResponse, id_token: IdToken, now_millis: i64) -> Self {
        let access_token = AccessToken::new(response.access_token);
        let expires_at = expiry(response.expires_in, &access_token, Some(&id_token), now_millis);

        Self {
            id_token,
            access_token,
            refresh_token: response.refresh_token,
            expires_at,
            scope: split_scope(response.scope.as_deref()),
            token_type: response.token_type.unwrap_or_else(|| "Bearer".into()),
        }
    }

    /// Apply a refresh response. Whatever the provider omits is kept from `self`,
    /// except the expiry: the previous ID token's `exp` is never reused, so a
    /// response that says nothing about expiry leaves it unknown.
    pub(crate) fn refreshed(
        &self,
        response: TokenResponse,
        id_token: Option<IdToken>,
        now_millis: i64,
    ) -> Self {
        let access_token = AccessToken::new(response.access_token);
        let expires_at = expiry(response.expires_in, &access_token, id_token.as_ref(), now_millis);

        Self {
            id_token: id_token.unwrap_or_else(|| self.id_token.clone()),
            access_token,
            refresh_token: response.refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at,
            scope: match response.scope {
                Some(scope) => split_scope(Some(&scope)),
                None => self.scope.clone(),
            },
            token_type: response.token_type.unwrap_or_else(|| self.token_type.clone()),
        }
    }

    /// Milliseconds of validity left, if the expiry is known.
    pub fn remaining(&self, now_millis: i64) -> Option<i64> {
        self.expires_at.map(|exp| exp.saturating_sub(now_millis))
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("id_token", &self.id_token)
            .field("access_token", &self.access_token)
            .field("has_refresh_token", &self.has_refresh_token())
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// `expires_in`, else the access token's `exp`, else the ID token's `exp`.
fn expiry(
    expires_in: Option<i64>,
    access_token: &AccessToken,
    id_token: Option<&IdToken>,
    now_millis: i64,
) -> Option<i64> {
    expires_in
        .map(|secs| now_millis.saturating_add(secs.saturating_mul(1000)))
        .or_else(|| access_token.expires_at())
        .or_else(|| id_token?.claims().expires_at().map(|exp| exp.saturating_mul(1000)))
}

pub(crate) fn split_scope(scope: Option<&str>) -> Vec<String> {
    scope
        .map(|s| s.split_whitespace().map(String::from).collect())
        .unwrap_or_default()
}

/// An established login: the caller's tokens and identity.
#[derive(Clone, Debug)]
pub struct AuthenticatedSession {
    pub tokens: TokenSet,
    pub identity: Identity,
}

pub(crate) type SessionSlot = Arc<Mutex<AuthenticatedSession>>;

/// In-memory map of session id to established session.
///
/// Each session sits behind its own async mutex so that concurrent requests of
/// one caller serialize token refreshes while other callers are unaffected.
#[derive(Default)]
pub struct TokenStore {
    sessions: DashMap<String, SessionSlot>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a session, replacing any previous one under the same id.
    pub fn put(&self, session_id: impl Into<String>, session: AuthenticatedSession) {
        self.sessions
            .insert(session_id.into(), Arc::new(Mutex::new(session)));
    }

    /// Snapshot of the session, waiting for any refresh in progress.
    pub async fn get(&self, session_id: &str) -> Option<AuthenticatedSession> {
        let slot = self.slot(session_id)?;
        let session = slot.lock().await;
        Some(session.clone())
    }

    /// Drop the session, waiting for any refresh in progress to finish first.
    pub async fn remove(&self, session_id: &str) -> Option<AuthenticatedSession> {
        let (_, slot) = self.sessions.remove(session_id)?;
        let session = slot.lock().await;
        Some(session.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub(crate) fn slot(&self, session_id: &str) -> Option<SessionSlot> {
        self.sessions.get(session_id).map(|s| Arc::clone(s.value()))
    }
}
