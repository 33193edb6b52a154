use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ClientConfiguration;
use crate::discovery::ProviderMetadataCache;
use crate::error::{ErrorKind, OidcError};
use crate::store::{AuthenticatedSession, IdToken, TokenSet};
use crate::token::TokenEndpoint;
use crate::validator::TokenValidator;

/// Whether `tokens` should be refreshed at `now_millis`.
///
/// Never when auto refresh is off or the expiry is unknown; otherwise when the
/// remaining validity is at most `token_min_validity`.
pub fn should_refresh(tokens: &TokenSet, config: &ClientConfiguration, now_millis: i64) -> bool {
    if !config.token_auto_refresh {
        return false;
    }
    match tokens.remaining(now_millis) {
        Some(remaining) => remaining <= config.token_min_validity.as_millis() as i64,
        None => false,
    }
}

/// Fold a failure of any refresh step into `RefreshFailed`, keeping timeouts
/// retryable.
fn refresh_failed(err: OidcError) -> OidcError {
    match err {
        OidcError::Timeout { message, .. } => OidcError::Timeout {
            kind: ErrorKind::RefreshFailed,
            message,
        },
        other => OidcError::RefreshFailed(other.to_string()),
    }
}

/// Keeps a session's tokens usable by running the refresh token grant when
/// they are close to expiry.
///
/// Callers hold the session's lock across [`TokenRefresher::ensure_valid`],
/// so concurrent requests of one session refresh at most once.
pub struct TokenRefresher {
    config: Arc<ClientConfiguration>,
    discovery: Arc<ProviderMetadataCache>,
    endpoint: Arc<TokenEndpoint>,
    validator: Arc<TokenValidator>,
    clock: Arc<dyn Clock>,
}

impl TokenRefresher {
    pub(crate) fn new(
        config: Arc<ClientConfiguration>,
        discovery: Arc<ProviderMetadataCache>,
        endpoint: Arc<TokenEndpoint>,
        validator: Arc<TokenValidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            discovery,
            endpoint,
            validator,
            clock,
        }
    }

    /// Refresh the session's tokens in place if needed.
    ///
    /// On failure the session is left exactly as it was.
    pub(crate) async fn ensure_valid(&self, session: &mut AuthenticatedSession) -> Result<(), OidcError> {
        let now = self.clock.now_millis();
        if !should_refresh(&session.tokens, &self.config, now) {
            return Ok(());
        }
        debug!(
            remaining_ms = ?session.tokens.remaining(now),
            sub = %session.identity.subject,
            "Tokens close to expiry, refreshing"
        );

        match self.refresh(&session.tokens).await {
            Ok(tokens) => {
                info!(sub = %session.identity.subject, expires_at = ?tokens.expires_at, "Tokens refreshed");
                session.tokens = tokens;
                Ok(())
            }
            Err(err) => {
                warn!(sub = %session.identity.subject, error = %err, "Token refresh failed");
                Err(err)
            }
        }
    }

    /// Run the refresh token grant for `tokens` and return the replacement set.
    pub async fn refresh(&self, tokens: &TokenSet) -> Result<TokenSet, OidcError> {
        let refresh_token = match tokens.refresh_token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => return Err(OidcError::RefreshFailed("no refresh token".into())),
        };

        let metadata = self
            .discovery
            .get(&self.config)
            .await
            .map_err(refresh_failed)?;

        let mut response = self
            .endpoint
            .refresh(&metadata.token_endpoint, refresh_token)
            .await
            .map_err(refresh_failed)?;

        let id_token = match response.id_token.take() {
            Some(raw) => {
                let claims = self
                    .validator
                    .validate(&raw, &metadata, &self.config, None)
                    .await
                    .map_err(refresh_failed)?;
                if claims.subject() != tokens.id_token.claims().subject() {
                    return Err(OidcError::RefreshFailed(
                        "refreshed ID token belongs to another subject".into(),
                    ));
                }
                Some(IdToken::new(raw, claims))
            }
            None => None,
        };

        Ok(tokens.refreshed(response, id_token, self.clock.now_millis()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TokenResponse;
    use crate::validator::IdTokenClaims;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000_000;

    fn tokens(expires_at: Option<i64>) -> TokenSet {
        let response: TokenResponse =
            serde_json::from_value(serde_json::json!({ "access_token": "opaque" })).unwrap();
        let mut set = TokenSet::from_response(
            response,
            IdToken::new("x.y.z".into(), IdTokenClaims::new(serde_json::json!({ "sub": "u1" }))),
            NOW,
        );
        set.expires_at = expires_at;
        set
    }

    fn config(auto_refresh: bool) -> ClientConfiguration {
        ClientConfiguration::new("https://idp", "client", "secret", "https://app/cb")
            .with_token_auto_refresh(auto_refresh)
            .with_token_min_validity(Duration::from_millis(10_000))
    }

    #[test]
    fn refresh_inside_min_validity() {
        assert!(should_refresh(&tokens(Some(NOW + 5_000)), &config(true), NOW));
        assert!(should_refresh(&tokens(Some(NOW + 10_000)), &config(true), NOW));
        assert!(should_refresh(&tokens(Some(NOW - 1)), &config(true), NOW));
    }

    #[test]
    fn no_refresh_with_enough_validity() {
        assert!(!should_refresh(&tokens(Some(NOW + 20_000)), &config(true), NOW));
    }

    #[test]
    fn auto_refresh_off_never_refreshes() {
        assert!(!should_refresh(&tokens(Some(NOW - 60_000)), &config(false), NOW));
    }

    #[test]
    fn refresh_failures_keep_timeouts() {
        let timeout = refresh_failed(OidcError::Timeout {
            kind: ErrorKind::TokenExchangeError,
            message: "read timed out".into(),
        });
        assert_eq!(timeout.kind(), ErrorKind::RefreshFailed);
        assert!(timeout.is_retryable());

        let rejected = refresh_failed(OidcError::TokenExchangeError("invalid_grant".into()));
        assert!(matches!(rejected, OidcError::RefreshFailed(_)));
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn unknown_expiry_never_refreshes() {
        assert!(!should_refresh(&tokens(None), &config(true), NOW));
    }
}
