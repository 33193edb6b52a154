//! OpenID Connect relying party for R2E.
//!
//! Runs the authorization code flow against an external identity provider:
//! builds the login redirect, completes the callback, validates the ID token
//! against the provider's JWKS, maps the caller identity and keeps the
//! session's tokens fresh with the refresh token grant.
//!
//! # Example
//!
//! ```ignore
//! use r2e_oidc_client::prelude::*;
//!
//! let config = ClientConfiguration::new(
//!     "https://idp.example.com/realms/demo",
//!     "my-app",
//!     "${env:OIDC_CLIENT_SECRET}",
//!     "${baseURL}/callback",
//! )
//! .with_token_auto_refresh(true);
//!
//! let client = OidcClient::new(config)?;
//!
//! // Unauthenticated request:
//! let redirect = client
//!     .begin_authentication(AuthStorage::single(&session), "/reports", "https://app.example.com")
//!     .await?;
//!
//! // Callback request:
//! let outcome = client
//!     .handle_callback(AuthStorage::single(&session), &session_id, &CallbackParams::from_query(query))
//!     .await?;
//!
//! // Later requests:
//! let tokens = client.ensure_valid(&session_id).await?;
//! ```

pub mod claims;
pub mod client;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod http;
pub mod jwks;
pub mod random;
pub mod refresh;
pub mod secret;
pub mod session;
pub mod state;
pub mod store;
pub mod validator;

mod flight;
mod token;

// Re-export primary public types for convenience.
pub use claims::{ClaimsMapper, Identity};
pub use client::{AuthRedirect, CallbackOutcome, CallbackParams, OidcClient, OidcClientBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ClaimsDefinition, ClientAuthMethod, ClientConfiguration, ConfigError, DisplayType,
    LogoutDefinition, PromptType, ProviderMetadataOverrides,
};
pub use discovery::ProviderMetadata;
pub use error::{ErrorKind, OidcError};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestHttpClient, Timeouts, TransportError};
pub use jwks::JwksCache;
pub use random::{OsRandom, SecureRandom};
pub use refresh::{should_refresh, TokenRefresher};
pub use secret::{ClientSecret, DefaultSecretResolver, SecretResolver};
pub use session::{AuthStorage, InMemorySessionStore, SessionStore};
pub use state::{AuthPhase, AuthenticationState};
pub use store::{AccessToken, AuthenticatedSession, IdToken, TokenSet, TokenStore};
pub use validator::{validate_scope, IdTokenClaims, TokenValidator};

pub mod prelude {
    //! Re-exports of the most commonly used relying party types.
    pub use crate::{
        AuthStorage, CallbackParams, ClientConfiguration, Identity, OidcClient, OidcError,
        SessionStore, TokenSet,
    };
}
