use std::time::Duration;

use crate::http::Timeouts;
use crate::secret::ClientSecret;

/// The `openid` scope, required for every OpenID Connect request.
pub const OPENID_SCOPE: &str = "openid";

/// Placeholder in `redirect_uri` replaced by the base URL of the current request.
pub const BASE_URL_PLACEHOLDER: &str = "${baseURL}";

/// Errors raised while building or validating a [`ClientConfiguration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is empty.
    Missing(&'static str),
    /// A setting has an unusable value.
    Invalid { key: String, reason: String },
    /// A secret reference could not be resolved.
    Secret(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "Missing required setting '{key}'"),
            ConfigError::Invalid { key, reason } => write!(f, "Invalid value for '{key}': {reason}"),
            ConfigError::Secret(msg) => write!(f, "Secret resolution failed: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Values of the `prompt` authorization parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptType {
    None,
    Login,
    Consent,
    SelectAccount,
}

impl PromptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptType::None => "none",
            PromptType::Login => "login",
            PromptType::Consent => "consent",
            PromptType::SelectAccount => "select_account",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(PromptType::None),
            "login" => Some(PromptType::Login),
            "consent" => Some(PromptType::Consent),
            "select_account" => Some(PromptType::SelectAccount),
            _ => None,
        }
    }
}

/// Values of the `display` authorization parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DisplayType {
    #[default]
    Page,
    Popup,
    Touch,
    Wap,
}

impl DisplayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayType::Page => "page",
            DisplayType::Popup => "popup",
            DisplayType::Touch => "touch",
            DisplayType::Wap => "wap",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "page" => Some(DisplayType::Page),
            "popup" => Some(DisplayType::Popup),
            "touch" => Some(DisplayType::Touch),
            "wap" => Some(DisplayType::Wap),
            _ => None,
        }
    }
}

/// How the client authenticates at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuthMethod {
    /// HTTP Basic with the url-encoded client id and secret.
    #[default]
    ClientSecretBasic,
    /// `client_id` and `client_secret` in the form body.
    ClientSecretPost,
}

/// Claim names used to derive the caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimsDefinition {
    /// Claim holding the caller name. Dotted paths reach into nested objects.
    pub caller_name_claim: String,
    /// Claim holding the caller groups. Dotted paths reach into nested objects.
    pub caller_groups_claim: String,
}

impl Default for ClaimsDefinition {
    fn default() -> Self {
        Self {
            caller_name_claim: "preferred_username".into(),
            caller_groups_claim: "groups".into(),
        }
    }
}

/// RP-initiated logout settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutDefinition {
    /// Send the user to the provider's end-session endpoint on logout.
    pub notify_provider: bool,
    /// Where the provider should send the user after logout. Empty means none.
    pub redirect_uri: String,
}

/// Per-field overrides of the discovered provider metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderMetadataOverrides {
    pub issuer: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub end_session_endpoint: Option<String>,
    pub jwks_uri: Option<String>,
    pub id_token_signing_alg_values_supported: Option<Vec<String>>,
}

impl ProviderMetadataOverrides {
    /// Whether the overrides alone are enough to run the flow without discovery.
    pub fn is_complete(&self) -> bool {
        self.issuer.is_some()
            && self.authorization_endpoint.is_some()
            && self.token_endpoint.is_some()
            && self.jwks_uri.is_some()
    }
}

/// Relying party configuration.
///
/// Built once (defaults, then `with_*` builders, then optional external
/// property overrides via [`ClientConfiguration::apply_properties`]) and
/// treated as immutable by the engine.
#[derive(Clone, Debug)]
pub struct ClientConfiguration {
    /// Base URI of the provider; discovery reads `/.well-known/openid-configuration` below it.
    pub provider_uri: String,
    pub provider_metadata: ProviderMetadataOverrides,
    pub client_id: String,
    pub client_secret: ClientSecret,
    pub client_auth_method: ClientAuthMethod,
    /// May contain `${baseURL}`.
    pub redirect_uri: String,
    /// Requested scopes, in request order.
    pub scopes: Vec<String>,
    pub response_type: String,
    /// Omitted from the request when empty.
    pub response_mode: String,
    pub prompt: Vec<PromptType>,
    pub display: DisplayType,
    pub use_nonce: bool,
    /// Keep pending authentication state in the session (`true`) or in cookies.
    pub use_session: bool,
    /// Appended verbatim to the authorization request. Keys may repeat.
    pub extra_parameters: Vec<(String, String)>,
    /// Zero means no timeout.
    pub jwks_connect_timeout: Duration,
    /// Zero means no timeout.
    pub jwks_read_timeout: Duration,
    /// Timeouts for discovery, token, refresh and userinfo calls. Zero means no timeout.
    pub http_connect_timeout: Duration,
    pub http_read_timeout: Duration,
    pub token_auto_refresh: bool,
    /// Tokens with less remaining validity than this are refreshed.
    pub token_min_validity: Duration,
    pub user_claims_from_id_token: bool,
    pub disable_scope_validation: bool,
    pub claims: ClaimsDefinition,
    pub logout: LogoutDefinition,
    /// Lifetime of a pending authentication state.
    pub state_ttl: Duration,
    /// Tolerance applied to `exp` and `nbf`.
    pub clock_skew: Duration,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self {
            provider_uri: String::new(),
            provider_metadata: ProviderMetadataOverrides::default(),
            client_id: String::new(),
            client_secret: ClientSecret::default(),
            client_auth_method: ClientAuthMethod::default(),
            redirect_uri: format!("{BASE_URL_PLACEHOLDER}/Callback"),
            scopes: vec![OPENID_SCOPE.into(), "email".into(), "profile".into()],
            response_type: "code".into(),
            response_mode: String::new(),
            prompt: Vec::new(),
            display: DisplayType::Page,
            use_nonce: true,
            use_session: true,
            extra_parameters: Vec::new(),
            jwks_connect_timeout: Duration::from_millis(500),
            jwks_read_timeout: Duration::from_millis(500),
            http_connect_timeout: Duration::from_millis(5000),
            http_read_timeout: Duration::from_millis(5000),
            token_auto_refresh: false,
            token_min_validity: Duration::from_millis(10_000),
            user_claims_from_id_token: false,
            disable_scope_validation: false,
            claims: ClaimsDefinition::default(),
            logout: LogoutDefinition::default(),
            state_ttl: Duration::from_secs(600),
            clock_skew: Duration::ZERO,
        }
    }
}

impl ClientConfiguration {
    /// Create a configuration with the required settings and defaults for the rest.
    pub fn new(
        provider_uri: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<ClientSecret>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            provider_uri: provider_uri.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            ..Default::default()
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_response_mode(mut self, mode: impl Into<String>) -> Self {
        self.response_mode = mode.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl IntoIterator<Item = PromptType>) -> Self {
        self.prompt = prompt.into_iter().collect();
        self
    }

    pub fn with_display(mut self, display: DisplayType) -> Self {
        self.display = display;
        self
    }

    pub fn with_nonce(mut self, use_nonce: bool) -> Self {
        self.use_nonce = use_nonce;
        self
    }

    pub fn with_session(mut self, use_session: bool) -> Self {
        self.use_session = use_session;
        self
    }

    /// Append one extra authorization parameter. Repeated keys are kept.
    pub fn with_extra_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_parameters.push((key.into(), value.into()));
        self
    }

    pub fn with_jwks_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.jwks_connect_timeout = connect;
        self.jwks_read_timeout = read;
        self
    }

    pub fn with_http_timeouts(mut self, connect: Duration, read: Duration) -> Self {
        self.http_connect_timeout = connect;
        self.http_read_timeout = read;
        self
    }

    pub fn with_token_auto_refresh(mut self, enabled: bool) -> Self {
        self.token_auto_refresh = enabled;
        self
    }

    pub fn with_token_min_validity(mut self, min_validity: Duration) -> Self {
        self.token_min_validity = min_validity;
        self
    }

    pub fn with_user_claims_from_id_token(mut self, enabled: bool) -> Self {
        self.user_claims_from_id_token = enabled;
        self
    }

    pub fn with_scope_validation_disabled(mut self, disabled: bool) -> Self {
        self.disable_scope_validation = disabled;
        self
    }

    pub fn with_claims(mut self, claims: ClaimsDefinition) -> Self {
        self.claims = claims;
        self
    }

    pub fn with_logout(mut self, logout: LogoutDefinition) -> Self {
        self.logout = logout;
        self
    }

    pub fn with_provider_metadata(mut self, overrides: ProviderMetadataOverrides) -> Self {
        self.provider_metadata = overrides;
        self
    }

    pub fn with_client_auth_method(mut self, method: ClientAuthMethod) -> Self {
        self.client_auth_method = method;
        self
    }

    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    pub fn with_clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    pub fn jwks_timeouts(&self) -> Timeouts {
        Timeouts::new(self.jwks_connect_timeout, self.jwks_read_timeout)
    }

    pub fn http_timeouts(&self) -> Timeouts {
        Timeouts::new(self.http_connect_timeout, self.http_read_timeout)
    }

    /// The requested scopes joined for the `scope` parameter.
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }

    /// The `redirect_uri` with `${baseURL}` replaced.
    pub fn resolve_redirect_uri(&self, base_url: &str) -> String {
        self.redirect_uri
            .replace(BASE_URL_PLACEHOLDER, base_url.trim_end_matches('/'))
    }

    /// Overlay external properties on top of the current values.
    ///
    /// Keys are the property names without any prefix (`clientId`,
    /// `tokenMinValidity`, ...). Unknown keys are ignored so one property
    /// source can serve several consumers.
    pub fn apply_properties<'a, I>(mut self, properties: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in properties {
            match key {
                "providerURI" => self.provider_uri = value.to_string(),
                "clientId" => self.client_id = value.to_string(),
                "clientSecret" => self.client_secret = ClientSecret::new(value),
                "redirectURI" => self.redirect_uri = value.to_string(),
                "scope" => {
                    self.scopes = value
                        .split(|c: char| c.is_whitespace() || c == ',')
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                "responseType" => self.response_type = value.to_string(),
                "responseMode" => self.response_mode = value.to_string(),
                "prompt" => {
                    self.prompt = value
                        .split_whitespace()
                        .map(|p| {
                            PromptType::parse(p)
                                .ok_or_else(|| invalid(key, format!("unknown prompt '{p}'")))
                        })
                        .collect::<Result<_, _>>()?;
                }
                "display" => {
                    self.display = DisplayType::parse(value)
                        .ok_or_else(|| invalid(key, format!("unknown display '{value}'")))?;
                }
                "useNonce" => self.use_nonce = parse_bool(key, value)?,
                "useSession" => self.use_session = parse_bool(key, value)?,
                "extraParameters" => self.extra_parameters = parse_extra_parameters(value),
                "jwksConnectTimeout" => self.jwks_connect_timeout = parse_millis(key, value)?,
                "jwksReadTimeout" => self.jwks_read_timeout = parse_millis(key, value)?,
                "tokenAutoRefresh" => self.token_auto_refresh = parse_bool(key, value)?,
                "tokenMinValidity" => self.token_min_validity = parse_millis(key, value)?,
                "userClaimsFromIDToken" => {
                    self.user_claims_from_id_token = parse_bool(key, value)?
                }
                "disableScopeValidation" => {
                    self.disable_scope_validation = parse_bool(key, value)?
                }
                "callerNameClaim" => self.claims.caller_name_claim = value.to_string(),
                "callerGroupsClaim" => self.claims.caller_groups_claim = value.to_string(),
                _ => {}
            }
        }
        Ok(self)
    }

    /// Check the configuration before the engine is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.is_empty() {
            return Err(ConfigError::Missing("clientId"));
        }
        if self.redirect_uri.is_empty() {
            return Err(ConfigError::Missing("redirectURI"));
        }
        if self.provider_uri.is_empty() && !self.provider_metadata.is_complete() {
            return Err(ConfigError::Missing("providerURI"));
        }
        if self.response_type.is_empty() {
            return Err(ConfigError::Missing("responseType"));
        }
        if !self.scopes.iter().any(|s| s == OPENID_SCOPE) {
            return Err(invalid("scope", "must include 'openid'"));
        }
        if self.prompt.contains(&PromptType::None) && self.prompt.len() > 1 {
            return Err(invalid("prompt", "'none' cannot be combined with other values"));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(invalid(key, format!("expected a boolean, got '{other}'"))),
    }
}

fn parse_millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| invalid(key, format!("expected non-negative milliseconds, got '{value}'")))
}

/// Parse extra parameters from URL query format (`a=1&b=two+words`).
pub fn parse_extra_parameters(raw: &str) -> Vec<(String, String)> {
    form_urlencoded::parse(raw.trim_start_matches('?').as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}
