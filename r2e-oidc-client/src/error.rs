use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::config::ConfigError;
use crate::http::TransportError;

/// Stable tag for each failure, surfaced to callers alongside the
/// authentication-denied outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    StateMismatch,
    NonceMismatch,
    ProviderError,
    TokenExchangeError,
    MalformedToken,
    SignatureInvalid,
    IssuerMismatch,
    AudienceMismatch,
    Expired,
    NotYetValid,
    ScopeMismatch,
    JwksUnavailable,
    RefreshFailed,
    MissingCallerClaim,
    UserinfoError,
    DiscoveryError,
    NotAuthenticated,
    Configuration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StateMismatch => "state_mismatch",
            ErrorKind::NonceMismatch => "nonce_mismatch",
            ErrorKind::ProviderError => "provider_error",
            ErrorKind::TokenExchangeError => "token_exchange_error",
            ErrorKind::MalformedToken => "malformed_token",
            ErrorKind::SignatureInvalid => "signature_invalid",
            ErrorKind::IssuerMismatch => "issuer_mismatch",
            ErrorKind::AudienceMismatch => "audience_mismatch",
            ErrorKind::Expired => "expired",
            ErrorKind::NotYetValid => "not_yet_valid",
            ErrorKind::ScopeMismatch => "scope_mismatch",
            ErrorKind::JwksUnavailable => "jwks_unavailable",
            ErrorKind::RefreshFailed => "refresh_failed",
            ErrorKind::MissingCallerClaim => "missing_caller_claim",
            ErrorKind::UserinfoError => "userinfo_error",
            ErrorKind::DiscoveryError => "discovery_error",
            ErrorKind::NotAuthenticated => "not_authenticated",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the relying party engine.
///
/// Every variant is terminal for the authentication attempt that produced it.
/// The type is `Clone` so a single shared fetch can hand the same failure to
/// every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OidcError {
    /// The callback `state` did not match the pending authentication state,
    /// or no pending state exists.
    StateMismatch,

    /// The ID token `nonce` claim did not match the stored nonce.
    NonceMismatch,

    /// The provider answered the authorization request with an `error`.
    ProviderError {
        error: String,
        description: Option<String>,
    },

    /// The token endpoint returned a non-2xx or unusable response.
    TokenExchangeError(String),

    /// The token is not a decodable JWT.
    MalformedToken(String),

    /// Signature verification failed or no usable key was found.
    SignatureInvalid(String),

    /// The `iss` claim is not the provider issuer.
    IssuerMismatch { expected: String, actual: String },

    /// The `aud` claim does not contain the client id.
    AudienceMismatch(String),

    /// The token `exp` is in the past.
    Expired,

    /// The token `nbf` is in the future.
    NotYetValid,

    /// The granted scope does not include `openid`.
    ScopeMismatch(String),

    /// The JWKS could not be fetched or parsed.
    JwksUnavailable(String),

    /// Token refresh was required but could not be performed.
    RefreshFailed(String),

    /// The configured caller-name claim is absent.
    MissingCallerClaim(String),

    /// The userinfo endpoint failed or returned inconsistent claims.
    UserinfoError(String),

    /// The provider discovery document could not be fetched or parsed.
    DiscoveryError(String),

    /// No established session exists for the given session id.
    NotAuthenticated,

    /// The engine configuration is unusable.
    Configuration(String),

    /// Unexpected internal failure (e.g. a fetch task panicked).
    Internal(String),

    /// A provider call ran out of time. `kind` is the failure the call would
    /// otherwise have reported (`TokenExchangeError`, `RefreshFailed`, ...).
    Timeout { kind: ErrorKind, message: String },
}

impl OidcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OidcError::StateMismatch => ErrorKind::StateMismatch,
            OidcError::NonceMismatch => ErrorKind::NonceMismatch,
            OidcError::ProviderError { .. } => ErrorKind::ProviderError,
            OidcError::TokenExchangeError(_) => ErrorKind::TokenExchangeError,
            OidcError::MalformedToken(_) => ErrorKind::MalformedToken,
            OidcError::SignatureInvalid(_) => ErrorKind::SignatureInvalid,
            OidcError::IssuerMismatch { .. } => ErrorKind::IssuerMismatch,
            OidcError::AudienceMismatch(_) => ErrorKind::AudienceMismatch,
            OidcError::Expired => ErrorKind::Expired,
            OidcError::NotYetValid => ErrorKind::NotYetValid,
            OidcError::ScopeMismatch(_) => ErrorKind::ScopeMismatch,
            OidcError::JwksUnavailable(_) => ErrorKind::JwksUnavailable,
            OidcError::RefreshFailed(_) => ErrorKind::RefreshFailed,
            OidcError::MissingCallerClaim(_) => ErrorKind::MissingCallerClaim,
            OidcError::UserinfoError(_) => ErrorKind::UserinfoError,
            OidcError::DiscoveryError(_) => ErrorKind::DiscoveryError,
            OidcError::NotAuthenticated => ErrorKind::NotAuthenticated,
            OidcError::Configuration(_) => ErrorKind::Configuration,
            OidcError::Internal(_) => ErrorKind::Internal,
            OidcError::Timeout { kind, .. } => *kind,
        }
    }

    /// Map a transport failure of a provider call. Timeouts keep their
    /// classification; everything else becomes `wrap(message)`.
    pub(crate) fn transport(
        kind: ErrorKind,
        err: TransportError,
        wrap: fn(String) -> OidcError,
    ) -> OidcError {
        if err.is_timeout() {
            OidcError::Timeout {
                kind,
                message: err.to_string(),
            }
        } else {
            wrap(err.to_string())
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, OidcError::Timeout { .. })
    }

    /// Whether this error came out of token validation.
    pub fn is_invalid_token(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MalformedToken
                | ErrorKind::SignatureInvalid
                | ErrorKind::IssuerMismatch
                | ErrorKind::AudienceMismatch
                | ErrorKind::Expired
                | ErrorKind::NotYetValid
                | ErrorKind::NonceMismatch
                | ErrorKind::ScopeMismatch
        )
    }

    /// Whether the caller may retry the operation later.
    ///
    /// True for timeouts of any provider call and for failed shared fetches
    /// (JWKS, discovery). A retried login still needs a fresh redirect, since
    /// the failed callback consumed its code and pending state.
    pub fn is_retryable(&self) -> bool {
        self.is_timeout()
            || matches!(
                self.kind(),
                ErrorKind::JwksUnavailable | ErrorKind::DiscoveryError
            )
    }

    pub fn public_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Configuration | ErrorKind::Internal => "Internal Server Error",
            _ => "Unauthorized",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Configuration | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl std::fmt::Display for OidcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OidcError::StateMismatch => write!(f, "State mismatch"),
            OidcError::NonceMismatch => write!(f, "Nonce mismatch"),
            OidcError::ProviderError { error, description } => match description {
                Some(desc) => write!(f, "Provider error: {error} ({desc})"),
                None => write!(f, "Provider error: {error}"),
            },
            OidcError::TokenExchangeError(msg) => write!(f, "Token exchange failed: {msg}"),
            OidcError::MalformedToken(msg) => write!(f, "Malformed token: {msg}"),
            OidcError::SignatureInvalid(msg) => write!(f, "Invalid signature: {msg}"),
            OidcError::IssuerMismatch { expected, actual } => {
                write!(f, "Issuer mismatch: expected {expected}, got {actual}")
            }
            OidcError::AudienceMismatch(msg) => write!(f, "Audience mismatch: {msg}"),
            OidcError::Expired => write!(f, "Token expired"),
            OidcError::NotYetValid => write!(f, "Token not yet valid"),
            OidcError::ScopeMismatch(msg) => write!(f, "Scope mismatch: {msg}"),
            OidcError::JwksUnavailable(msg) => write!(f, "JWKS unavailable: {msg}"),
            OidcError::RefreshFailed(msg) => write!(f, "Token refresh failed: {msg}"),
            OidcError::MissingCallerClaim(claim) => write!(f, "Missing caller claim: {claim}"),
            OidcError::UserinfoError(msg) => write!(f, "Userinfo request failed: {msg}"),
            OidcError::DiscoveryError(msg) => write!(f, "Provider discovery failed: {msg}"),
            OidcError::NotAuthenticated => write!(f, "Not authenticated"),
            OidcError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            OidcError::Internal(msg) => write!(f, "Internal error: {msg}"),
            OidcError::Timeout { kind, message } => write!(f, "Provider call timed out ({kind}): {message}"),
        }
    }
}

impl std::error::Error for OidcError {}

impl From<ConfigError> for OidcError {
    fn from(err: ConfigError) -> Self {
        OidcError::Configuration(err.to_string())
    }
}

impl IntoResponse for OidcError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.public_message(),
            "kind": self.kind().as_str(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
