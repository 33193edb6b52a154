use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::claims::{ClaimsMapper, Identity};
use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfiguration;
use crate::discovery::{ProviderMetadata, ProviderMetadataCache};
use crate::error::OidcError;
use crate::http::{HttpClient, ReqwestHttpClient, SharedHttpClient};
use crate::jwks::JwksCache;
use crate::random::{OsRandom, SecureRandom};
use crate::refresh::TokenRefresher;
use crate::secret::{DefaultSecretResolver, SecretResolver};
use crate::session::AuthStorage;
use crate::state::{AuthFlow, AuthPhase, AuthenticationState};
use crate::store::{AuthenticatedSession, IdToken, TokenSet, TokenStore};
use crate::token::TokenEndpoint;
use crate::validator::{validate_scope, TokenValidator};

/// Browser redirect to the provider (login) or to the end-session endpoint (logout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRedirect {
    url: String,
}

impl AuthRedirect {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn into_url(self) -> String {
        self.url
    }
}

impl IntoResponse for AuthRedirect {
    fn into_response(self) -> Response {
        Redirect::to(&self.url).into_response()
    }
}

/// Query parameters the provider sends back to the redirect URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse a raw query string (without the leading `?`).
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            let slot = match key.as_ref() {
                "state" => &mut params.state,
                "code" => &mut params.code,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }
}

/// Result of a successful callback.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub identity: Identity,
    /// The resource the caller originally asked for.
    pub redirect_to: String,
}

impl IntoResponse for CallbackOutcome {
    fn into_response(self) -> Response {
        Redirect::to(&self.redirect_to).into_response()
    }
}

/// Builder for [`OidcClient`].
///
/// Every collaborator has a production default; tests swap in their own.
pub struct OidcClientBuilder {
    config: ClientConfiguration,
    http: Option<SharedHttpClient>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn SecureRandom>,
    secret_resolver: Box<dyn SecretResolver>,
    jwks_min_refresh_interval: Duration,
}

impl OidcClientBuilder {
    pub fn with_http_client(mut self, http: impl HttpClient) -> Self {
        self.http = Some(Arc::new(http));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_random(mut self, random: impl SecureRandom + 'static) -> Self {
        self.random = Arc::new(random);
        self
    }

    pub fn with_secret_resolver(mut self, resolver: impl SecretResolver + 'static) -> Self {
        self.secret_resolver = Box::new(resolver);
        self
    }

    /// Minimum age of a JWKS entry before an unknown `kid` may force a refetch.
    pub fn with_jwks_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.jwks_min_refresh_interval = interval;
        self
    }

    /// Validate the configuration, resolve the client secret and wire the engine.
    pub fn build(self) -> Result<OidcClient, OidcError> {
        self.config.validate()?;
        let client_secret = self.config.client_secret.resolve(self.secret_resolver.as_ref())?;

        let config = Arc::new(self.config);
        let http: SharedHttpClient = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::new()),
        };

        let discovery = Arc::new(ProviderMetadataCache::new(Arc::clone(&http)));
        let jwks = Arc::new(
            JwksCache::with_shared_client(Arc::clone(&http), config.jwks_timeouts())
                .with_min_refresh_interval(self.jwks_min_refresh_interval),
        );
        let validator = Arc::new(TokenValidator::new(Arc::clone(&jwks), Arc::clone(&self.clock)));
        let endpoint = Arc::new(TokenEndpoint::new(Arc::clone(&http), &config, client_secret));
        let refresher = TokenRefresher::new(
            Arc::clone(&config),
            Arc::clone(&discovery),
            Arc::clone(&endpoint),
            Arc::clone(&validator),
            Arc::clone(&self.clock),
        );
        let mapper = ClaimsMapper::new(http, &config);

        info!(
            provider = %config.provider_uri,
            client_id = %config.client_id,
            use_nonce = config.use_nonce,
            use_session = config.use_session,
            auto_refresh = config.token_auto_refresh,
            "OIDC client configured"
        );

        Ok(OidcClient {
            inner: Arc::new(Inner {
                config,
                discovery,
                jwks,
                validator,
                endpoint,
                refresher,
                mapper,
                store: TokenStore::new(),
                clock: self.clock,
                random: self.random,
            }),
        })
    }
}

struct Inner {
    config: Arc<ClientConfiguration>,
    discovery: Arc<ProviderMetadataCache>,
    jwks: Arc<JwksCache>,
    validator: Arc<TokenValidator>,
    endpoint: Arc<TokenEndpoint>,
    refresher: TokenRefresher,
    mapper: ClaimsMapper,
    store: TokenStore,
    clock: Arc<dyn Clock>,
    random: Arc<dyn SecureRandom>,
}

/// OpenID Connect relying party engine.
///
/// Drives the authorization code flow: [`begin_authentication`] builds the
/// provider redirect, [`handle_callback`] completes the login for a session,
/// and [`ensure_valid`] keeps the session's tokens fresh afterwards.
///
/// Cheap to clone; clones share caches and sessions.
///
/// [`begin_authentication`]: OidcClient::begin_authentication
/// [`handle_callback`]: OidcClient::handle_callback
/// [`ensure_valid`]: OidcClient::ensure_valid
#[derive(Clone)]
pub struct OidcClient {
    inner: Arc<Inner>,
}

impl OidcClient {
    pub fn builder(config: ClientConfiguration) -> OidcClientBuilder {
        OidcClientBuilder {
            config,
            http: None,
            clock: Arc::new(SystemClock),
            random: Arc::new(OsRandom),
            secret_resolver: Box::new(DefaultSecretResolver),
            jwks_min_refresh_interval: Duration::ZERO,
        }
    }

    /// Build with default collaborators.
    pub fn new(config: ClientConfiguration) -> Result<Self, OidcError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ClientConfiguration {
        &self.inner.config
    }

    pub fn jwks(&self) -> &JwksCache {
        &self.inner.jwks
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.inner.validator
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.inner.store
    }

    /// Provider metadata, discovered on first use.
    pub async fn provider_metadata(&self) -> Result<Arc<ProviderMetadata>, OidcError> {
        self.inner.discovery.get(&self.inner.config).await
    }

    /// Forget the discovered metadata; the next call discovers again.
    pub fn invalidate_provider_metadata(&self) {
        self.inner.discovery.invalidate(&self.inner.config.provider_uri);
    }

    /// Start a login: persist fresh state (and nonce) and return the
    /// authorization redirect.
    ///
    /// `base_url` replaces `${baseURL}` in the configured redirect URI.
    pub async fn begin_authentication(
        &self,
        storage: AuthStorage<'_>,
        requested_resource: &str,
        base_url: &str,
    ) -> Result<AuthRedirect, OidcError> {
        let config = &self.inner.config;
        let mut flow = AuthFlow::starting_at(AuthPhase::Unauthenticated);
        flow.advance(AuthPhase::Redirecting);

        let metadata = self.provider_metadata().await.map_err(|e| flow.fail(e))?;

        let pending = AuthenticationState {
            state: self.inner.random.token(),
            nonce: config.use_nonce.then(|| self.inner.random.token()),
            requested_resource: requested_resource.to_string(),
            redirect_uri: config.resolve_redirect_uri(base_url),
            created_at: self.inner.clock.now_millis(),
        };

        let url = authorization_url(&metadata, config, &pending).map_err(|e| flow.fail(e))?;
        pending
            .save(storage.select(config.use_session), config.use_session)
            .map_err(|e| flow.fail(e))?;

        flow.advance(AuthPhase::AwaitingCallback);
        debug!(resource = %requested_resource, "Redirecting to provider");
        Ok(AuthRedirect { url })
    }

    /// Complete a login from the provider's callback and establish `session_id`.
    ///
    /// The pending state is consumed before anything else, so it is gone
    /// whether this succeeds or fails.
    pub async fn handle_callback(
        &self,
        storage: AuthStorage<'_>,
        session_id: &str,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, OidcError> {
        let config = &self.inner.config;
        let mut flow = AuthFlow::starting_at(AuthPhase::AwaitingCallback);
        let pending = AuthenticationState::take(storage.select(config.use_session), config.use_session);

        let result = self.complete_callback(&mut flow, pending, session_id, params).await;
        result.map_err(|e| flow.fail(e))
    }

    async fn complete_callback(
        &self,
        flow: &mut AuthFlow,
        pending: Option<AuthenticationState>,
        session_id: &str,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, OidcError> {
        let config = &self.inner.config;
        let now = self.inner.clock.now_millis();

        let pending = match pending {
            Some(p) if !p.is_expired(now, config.state_ttl) => p,
            Some(_) => {
                debug!("Pending authentication state expired");
                return Err(OidcError::StateMismatch);
            }
            None => return Err(OidcError::StateMismatch),
        };
        if params.state.as_deref() != Some(pending.state.as_str()) {
            return Err(OidcError::StateMismatch);
        }

        if let Some(error) = &params.error {
            return Err(OidcError::ProviderError {
                error: error.clone(),
                description: params.error_description.clone(),
            });
        }
        let code = params
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OidcError::TokenExchangeError("callback carries no authorization code".into()))?;

        flow.advance(AuthPhase::ExchangingCode);
        let metadata = self.provider_metadata().await?;
        let mut response = self
            .inner
            .endpoint
            .exchange_code(&metadata.token_endpoint, code, &pending.redirect_uri)
            .await?;
        let raw_id_token = response
            .id_token
            .take()
            .ok_or_else(|| OidcError::TokenExchangeError("token response has no id_token".into()))?;

        flow.advance(AuthPhase::Validating);
        let expected_nonce = if config.use_nonce {
            pending.nonce.as_deref()
        } else {
            None
        };
        let claims = self
            .inner
            .validator
            .validate(&raw_id_token, &metadata, config, expected_nonce)
            .await?;
        validate_scope(response.scope.as_deref(), config)?;

        let identity = self
            .inner
            .mapper
            .map_identity(&claims, &response.access_token, &metadata)
            .await?;
        let tokens = TokenSet::from_response(response, IdToken::new(raw_id_token, claims), now);

        self.inner.store.put(
            session_id,
            AuthenticatedSession {
                tokens,
                identity: identity.clone(),
            },
        );
        flow.advance(AuthPhase::Established);
        info!(sub = %identity.subject, caller = %identity.caller_name, "Session established");

        Ok(CallbackOutcome {
            identity,
            redirect_to: pending.requested_resource,
        })
    }

    /// Tokens for `session_id`, refreshed first when auto refresh is on and
    /// they are close to expiry.
    ///
    /// Concurrent calls for one session wait for each other, so at most one
    /// refresh runs. A failed refresh leaves the stored tokens untouched.
    pub async fn ensure_valid(&self, session_id: &str) -> Result<TokenSet, OidcError> {
        let slot = self
            .inner
            .store
            .slot(session_id)
            .ok_or(OidcError::NotAuthenticated)?;
        let mut session = slot.lock().await;
        self.inner.refresher.ensure_valid(&mut session).await?;
        Ok(session.tokens.clone())
    }

    /// The identity established for `session_id`, if any.
    pub async fn identity(&self, session_id: &str) -> Option<Identity> {
        self.inner.store.get(session_id).await.map(|s| s.identity)
    }

    /// End the session locally. When provider notification is configured and
    /// the provider has an end-session endpoint, also return the redirect for
    /// RP-initiated logout.
    pub async fn logout(&self, session_id: &str) -> Result<Option<AuthRedirect>, OidcError> {
        let session = self.inner.store.remove(session_id).await;
        if session.is_some() {
            let mut flow = AuthFlow::starting_at(AuthPhase::Established);
            flow.advance(AuthPhase::Unauthenticated);
        }

        let logout = &self.inner.config.logout;
        if !logout.notify_provider {
            return Ok(None);
        }
        let metadata = self.provider_metadata().await?;
        let Some(endpoint) = metadata.end_session_endpoint.as_deref() else {
            debug!("Provider has no end-session endpoint");
            return Ok(None);
        };

        let mut url = Url::parse(endpoint)
            .map_err(|e| OidcError::DiscoveryError(format!("invalid end-session endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(session) = &session {
                query.append_pair("id_token_hint", session.tokens.id_token.raw());
            }
            if !logout.redirect_uri.is_empty() {
                query.append_pair("post_logout_redirect_uri", &logout.redirect_uri);
            }
        }
        Ok(Some(AuthRedirect { url: url.into() }))
    }
}

/// Authorization request URL, parameters in a fixed order with extras last.
fn authorization_url(
    metadata: &ProviderMetadata,
    config: &ClientConfiguration,
    pending: &AuthenticationState,
) -> Result<String, OidcError> {
    let mut url = Url::parse(&metadata.authorization_endpoint)
        .map_err(|e| OidcError::DiscoveryError(format!("invalid authorization endpoint: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &pending.redirect_uri)
            .append_pair("scope", &config.scope_param())
            .append_pair("response_type", &config.response_type);
        if !config.response_mode.is_empty() {
            query.append_pair("response_mode", &config.response_mode);
        }
        if !config.prompt.is_empty() {
            let prompt: Vec<&str> = config.prompt.iter().map(|p| p.as_str()).collect();
            query.append_pair("prompt", &prompt.join(" "));
        }
        query
            .append_pair("display", config.display.as_str())
            .append_pair("state", &pending.state);
        if let Some(nonce) = &pending.nonce {
            query.append_pair("nonce", nonce);
        }
        for (key, value) in &config.extra_parameters {
            query.append_pair(key, value);
        }
    }
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisplayType, PromptType};

    fn metadata() -> ProviderMetadata {
        serde_json::from_value(serde_json::json!({
            "issuer": "https://idp",
            "authorization_endpoint": "https://idp/auth",
            "token_endpoint": "https://idp/token",
            "jwks_uri": "https://idp/jwks",
        }))
        .unwrap()
    }

    fn pending(nonce: Option<&str>) -> AuthenticationState {
        AuthenticationState {
            state: "st".into(),
            nonce: nonce.map(String::from),
            requested_resource: "/".into(),
            redirect_uri: "https://app/cb".into(),
            created_at: 0,
        }
    }

    fn query_of(url: &str) -> Vec<(String, String)> {
        Url::parse(url)
            .unwrap()
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn authorization_url_parameter_order() {
        let config = ClientConfiguration::new("https://idp", "client", "secret", "https://app/cb")
            .with_response_mode("form_post")
            .with_prompt([PromptType::Login, PromptType::Consent])
            .with_display(DisplayType::Popup)
            .with_extra_parameter("kc_idp_hint", "google")
            .with_extra_parameter("acr_values", "a")
            .with_extra_parameter("acr_values", "b");

        let url = authorization_url(&metadata(), &config, &pending(Some("nn"))).unwrap();
        let keys: Vec<String> = query_of(&url).into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec![
                "client_id",
                "redirect_uri",
                "scope",
                "response_type",
                "response_mode",
                "prompt",
                "display",
                "state",
                "nonce",
                "kc_idp_hint",
                "acr_values",
                "acr_values"
            ]
        );
        let query = query_of(&url);
        assert!(query.contains(&("scope".into(), "openid email profile".into())));
        assert!(query.contains(&("prompt".into(), "login consent".into())));
        assert!(query.contains(&("display".into(), "popup".into())));
    }

    #[test]
    fn optional_parameters_are_omitted() {
        let config = ClientConfiguration::new("https://idp", "client", "secret", "https://app/cb");
        let url = authorization_url(&metadata(), &config, &pending(None)).unwrap();
        let keys: Vec<String> = query_of(&url).into_iter().map(|(k, _)| k).collect();
        assert!(!keys.contains(&"response_mode".to_string()));
        assert!(!keys.contains(&"prompt".to_string()));
        assert!(!keys.contains(&"nonce".to_string()));
    }

    #[test]
    fn callback_params_from_query() {
        let params = CallbackParams::from_query("?state=abc&code=x%2By&unused=1");
        assert_eq!(params.state.as_deref(), Some("abc"));
        assert_eq!(params.code.as_deref(), Some("x+y"));
        assert_eq!(params.error, None);
    }
}
