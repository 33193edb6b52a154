use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ClientConfiguration, ProviderMetadataOverrides};
use crate::error::{ErrorKind, OidcError};
use crate::flight::SingleFlight;
use crate::http::{HttpRequest, SharedHttpClient, Timeouts};

/// Path of the discovery document below the provider URI.
pub const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

/// Provider metadata from the discovery document, after configured overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
}

impl ProviderMetadata {
    /// Build metadata purely from overrides, when they are complete.
    pub fn from_overrides(overrides: &ProviderMetadataOverrides) -> Option<Self> {
        Some(Self {
            issuer: overrides.issuer.clone()?,
            authorization_endpoint: overrides.authorization_endpoint.clone()?,
            token_endpoint: overrides.token_endpoint.clone()?,
            userinfo_endpoint: overrides.userinfo_endpoint.clone(),
            jwks_uri: overrides.jwks_uri.clone()?,
            end_session_endpoint: overrides.end_session_endpoint.clone(),
            id_token_signing_alg_values_supported: overrides
                .id_token_signing_alg_values_supported
                .clone()
                .unwrap_or_default(),
            scopes_supported: Vec::new(),
            response_types_supported: Vec::new(),
        })
    }

    /// Replace every field the overrides set.
    pub fn with_overrides(mut self, overrides: &ProviderMetadataOverrides) -> Self {
        if let Some(v) = &overrides.issuer {
            self.issuer = v.clone();
        }
        if let Some(v) = &overrides.authorization_endpoint {
            self.authorization_endpoint = v.clone();
        }
        if let Some(v) = &overrides.token_endpoint {
            self.token_endpoint = v.clone();
        }
        if let Some(v) = &overrides.userinfo_endpoint {
            self.userinfo_endpoint = Some(v.clone());
        }
        if let Some(v) = &overrides.jwks_uri {
            self.jwks_uri = v.clone();
        }
        if let Some(v) = &overrides.end_session_endpoint {
            self.end_session_endpoint = Some(v.clone());
        }
        if let Some(v) = &overrides.id_token_signing_alg_values_supported {
            self.id_token_signing_alg_values_supported = v.clone();
        }
        self
    }

    /// Asymmetric algorithms the provider advertises for ID tokens.
    ///
    /// `none` and HMAC algorithms are never accepted. Providers that advertise
    /// nothing usable fall back to RS256, which every provider must support.
    pub fn allowed_algorithms(&self) -> Vec<Algorithm> {
        let allowed: Vec<Algorithm> = self
            .id_token_signing_alg_values_supported
            .iter()
            .filter_map(|name| Algorithm::from_str(name).ok())
            .filter(|alg| !matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512))
            .collect();
        if allowed.is_empty() {
            vec![Algorithm::RS256]
        } else {
            allowed
        }
    }
}

/// Discovery document URL for a provider URI.
pub fn discovery_url(provider_uri: &str) -> String {
    if provider_uri.ends_with(DISCOVERY_PATH) {
        provider_uri.to_string()
    } else {
        format!("{}{DISCOVERY_PATH}", provider_uri.trim_end_matches('/'))
    }
}

/// Fetch-once cache of provider metadata, keyed by provider URI.
///
/// Entries are reused until [`ProviderMetadataCache::invalidate`] is called.
pub struct ProviderMetadataCache {
    entries: Arc<DashMap<String, Arc<ProviderMetadata>>>,
    flight: SingleFlight<String, Arc<ProviderMetadata>>,
    http: SharedHttpClient,
}

impl ProviderMetadataCache {
    pub(crate) fn new(http: SharedHttpClient) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            flight: SingleFlight::new(),
            http,
        }
    }

    pub fn cached(&self, provider_uri: &str) -> Option<Arc<ProviderMetadata>> {
        self.entries.get(provider_uri).map(|e| Arc::clone(e.value()))
    }

    pub fn invalidate(&self, provider_uri: &str) {
        self.entries.remove(provider_uri);
    }

    /// Metadata for the configured provider, fetching it on first use.
    pub async fn get(&self, config: &ClientConfiguration) -> Result<Arc<ProviderMetadata>, OidcError> {
        let key = config.provider_uri.clone();
        if let Some(metadata) = self.cached(&key) {
            return Ok(metadata);
        }

        if config.provider_metadata.is_complete() {
            if let Some(metadata) = ProviderMetadata::from_overrides(&config.provider_metadata) {
                let metadata = Arc::new(metadata);
                self.entries.insert(key, Arc::clone(&metadata));
                return Ok(metadata);
            }
        }

        let entries = Arc::clone(&self.entries);
        let http = Arc::clone(&self.http);
        let overrides = config.provider_metadata.clone();
        let timeouts = config.http_timeouts();
        let provider_uri = key.clone();

        self.flight
            .run(key, async move {
                if let Some(current) = entries.get(&provider_uri).map(|e| Arc::clone(e.value())) {
                    return Ok(current);
                }
                let metadata = fetch_metadata(http, &provider_uri, timeouts).await?;
                let metadata = Arc::new(metadata.with_overrides(&overrides));
                entries.insert(provider_uri, Arc::clone(&metadata));
                Ok(metadata)
            })
            .await
    }
}

async fn fetch_metadata(
    http: SharedHttpClient,
    provider_uri: &str,
    timeouts: Timeouts,
) -> Result<ProviderMetadata, OidcError> {
    let url = discovery_url(provider_uri);
    let response = http
        .execute(HttpRequest::get(&url).timeouts(timeouts))
        .await
        .map_err(|e| {
            warn!(%url, error = %e, "Provider discovery failed");
            OidcError::transport(ErrorKind::DiscoveryError, e, OidcError::DiscoveryError)
        })?;

    if !response.is_success() {
        return Err(OidcError::DiscoveryError(format!(
            "discovery endpoint returned HTTP {}",
            response.status
        )));
    }

    let metadata: ProviderMetadata = response
        .json()
        .map_err(|e| OidcError::DiscoveryError(format!("invalid discovery document: {e}")))?;

    info!(issuer = %metadata.issuer, "Provider metadata discovered");
    Ok(metadata)
}
