use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::OidcError;
use crate::session::SessionStore;

/// Session key for pending state when `use_session` is on.
pub const SESSION_STATE_KEY: &str = "r2e.oidc.pending_auth";
/// Cookie name for pending state when `use_session` is off.
pub const COOKIE_STATE_NAME: &str = "r2e_oidc_pending_auth";

/// Phases of one login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthPhase {
    Unauthenticated,
    Redirecting,
    AwaitingCallback,
    ExchangingCode,
    Validating,
    Established,
    Failed,
}

impl AuthPhase {
    pub fn can_transition_to(self, next: AuthPhase) -> bool {
        use AuthPhase::*;
        match (self, next) {
            (Unauthenticated, Redirecting) => true,
            (Redirecting, AwaitingCallback) => true,
            (AwaitingCallback, ExchangingCode) => true,
            (ExchangingCode, Validating) => true,
            (Validating, Established) => true,
            (Established, Unauthenticated) => true,
            (Unauthenticated, _) | (Established, _) | (Failed, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

/// Tracks the phase of a single attempt and logs each transition.
pub(crate) struct AuthFlow {
    phase: AuthPhase,
}

impl AuthFlow {
    pub fn starting_at(phase: AuthPhase) -> Self {
        Self { phase }
    }

    pub fn advance(&mut self, next: AuthPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal auth transition {:?} -> {next:?}",
            self.phase
        );
        debug!(from = ?self.phase, to = ?next, "Auth phase transition");
        self.phase = next;
    }

    /// Move to `Failed` and hand the error back.
    pub fn fail(&mut self, err: OidcError) -> OidcError {
        warn!(phase = ?self.phase, kind = %err.kind(), "Authentication failed");
        self.advance(AuthPhase::Failed);
        err
    }
}

/// One in-flight login attempt, persisted between redirect and callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationState {
    pub state: String,
    pub nonce: Option<String>,
    /// Where to send the caller once authenticated.
    pub requested_resource: String,
    /// The exact `redirect_uri` sent to the provider, reused for the code exchange.
    pub redirect_uri: String,
    /// Creation time, in milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl AuthenticationState {
    pub fn is_expired(&self, now_millis: i64, ttl: Duration) -> bool {
        now_millis.saturating_sub(self.created_at) > ttl.as_millis() as i64
    }

    pub(crate) fn save(&self, store: &dyn SessionStore, use_session: bool) -> Result<(), OidcError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| OidcError::Internal(format!("failed to encode auth state: {e}")))?;
        if use_session {
            store.put(SESSION_STATE_KEY, json);
        } else {
            // Cookie values must stay within the cookie-octet charset.
            store.put(COOKIE_STATE_NAME, URL_SAFE_NO_PAD.encode(json).into_bytes());
        }
        Ok(())
    }

    /// Remove and return the pending state. Unreadable entries are removed too.
    pub(crate) fn take(store: &dyn SessionStore, use_session: bool) -> Option<Self> {
        let key = if use_session {
            SESSION_STATE_KEY
        } else {
            COOKIE_STATE_NAME
        };
        let raw = store.remove(key)?;
        let json = if use_session {
            raw
        } else {
            URL_SAFE_NO_PAD.decode(&raw).ok()?
        };
        match serde_json::from_slice(&json) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable pending auth state");
                None
            }
        }
    }
}
