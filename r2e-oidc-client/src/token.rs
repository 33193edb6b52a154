use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{ClientAuthMethod, ClientConfiguration};
use crate::error::{ErrorKind, OidcError};
use crate::http::{HttpRequest, SharedHttpClient, Timeouts};
use crate::store::TokenResponse;

/// Error body of the token endpoint (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Client for the provider's token endpoint, authenticating as the relying party.
pub(crate) struct TokenEndpoint {
    http: SharedHttpClient,
    client_id: String,
    client_secret: String,
    auth_method: ClientAuthMethod,
    timeouts: Timeouts,
}

impl TokenEndpoint {
    /// `client_secret` must already be resolved.
    pub fn new(http: SharedHttpClient, config: &ClientConfiguration, client_secret: String) -> Self {
        Self {
            http,
            client_id: config.client_id.clone(),
            client_secret,
            auth_method: config.client_auth_method,
            timeouts: config.http_timeouts(),
        }
    }

    /// `grant_type=authorization_code`
    pub async fn exchange_code(
        &self,
        token_endpoint: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OidcError> {
        let form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), redirect_uri.to_string()),
        ];
        self.post(token_endpoint, form).await
    }

    /// `grant_type=refresh_token`
    pub async fn refresh(
        &self,
        token_endpoint: &str,
        refresh_token: &str,
    ) -> Result<TokenResponse, OidcError> {
        let form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        self.post(token_endpoint, form).await
    }

    async fn post(
        &self,
        token_endpoint: &str,
        mut form: Vec<(String, String)>,
    ) -> Result<TokenResponse, OidcError> {
        let grant = form[0].1.clone();
        let mut request = match self.auth_method {
            ClientAuthMethod::ClientSecretBasic => {
                HttpRequest::post_form(token_endpoint, form).header("Authorization", self.basic_auth())
            }
            ClientAuthMethod::ClientSecretPost => {
                form.push(("client_id".into(), self.client_id.clone()));
                form.push(("client_secret".into(), self.client_secret.clone()));
                HttpRequest::post_form(token_endpoint, form)
            }
        };
        request = request.header("Accept", "application/json").timeouts(self.timeouts);

        let response = self.http.execute(request).await.map_err(|e| {
            warn!(%grant, error = %e, timeout = e.is_timeout(), "Token endpoint unreachable");
            OidcError::transport(ErrorKind::TokenExchangeError, e, OidcError::TokenExchangeError)
        })?;

        if !response.is_success() {
            let detail = match response.json::<TokenErrorBody>() {
                Ok(body) => match body.error_description {
                    Some(description) => format!("{}: {description}", body.error),
                    None => body.error,
                },
                Err(_) => format!("HTTP {}", response.status),
            };
            warn!(%grant, status = response.status, %detail, "Token endpoint rejected the request");
            return Err(OidcError::TokenExchangeError(detail));
        }

        let tokens: TokenResponse = response.json().map_err(|e| {
            OidcError::TokenExchangeError(format!("invalid token response: {e}"))
        })?;
        debug!(%grant, token_type = ?tokens.token_type, "Token endpoint call succeeded");
        Ok(tokens)
    }

    /// `client_id` and secret are form-encoded before base64 (RFC 6749 section 2.3.1).
    fn basic_auth(&self) -> String {
        let encode = |s: &str| form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        let credentials = format!("{}:{}", encode(&self.client_id), encode(&self.client_secret));
        format!("Basic {}", STANDARD.encode(credentials))
    }
}
