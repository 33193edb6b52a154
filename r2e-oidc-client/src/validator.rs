use std::collections::HashSet;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{ClientConfiguration, OPENID_SCOPE};
use crate::discovery::ProviderMetadata;
use crate::error::OidcError;
use crate::jwks::JwksCache;

/// Claims of a validated ID token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdTokenClaims(serde_json::Value);

impl IdTokenClaims {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_value(self) -> serde_json::Value {
        self.0
    }

    pub fn get(&self, claim: &str) -> Option<&serde_json::Value> {
        self.0.get(claim)
    }

    fn str_claim(&self, claim: &str) -> Option<&str> {
        self.0.get(claim).and_then(|v| v.as_str())
    }

    pub fn subject(&self) -> Option<&str> {
        self.str_claim("sub")
    }

    pub fn issuer(&self) -> Option<&str> {
        self.str_claim("iss")
    }

    pub fn nonce(&self) -> Option<&str> {
        self.str_claim("nonce")
    }

    pub fn authorized_party(&self) -> Option<&str> {
        self.str_claim("azp")
    }

    /// `aud` as a list, whether it was sent as a string or an array.
    pub fn audiences(&self) -> Vec<&str> {
        match self.0.get("aud") {
            Some(serde_json::Value::String(aud)) => vec![aud.as_str()],
            Some(serde_json::Value::Array(list)) => list.iter().filter_map(|v| v.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// `exp` in seconds since the Unix epoch.
    pub fn expires_at(&self) -> Option<i64> {
        numeric_claim(&self.0, "exp")
    }

    pub fn not_before(&self) -> Option<i64> {
        numeric_claim(&self.0, "nbf")
    }
}

/// Integer claim, accepting float encodings.
pub(crate) fn numeric_claim(claims: &serde_json::Value, name: &str) -> Option<i64> {
    let value = claims.get(name)?;
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

/// Read the payload of a JWT without verifying it.
///
/// Only for metadata such as an access token's `exp`; never for trust decisions.
pub fn peek_claims(token: &str) -> Option<serde_json::Value> {
    let mut parts = token.split('.');
    let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Source of decoding keys: the JWKS cache, or a static key for testing.
enum KeySource {
    Jwks(Arc<JwksCache>),
    Static(DecodingKey),
}

/// ID token validator.
///
/// Checks run in a fixed order and the first failure wins: signature,
/// issuer, audience, expiry/not-before, nonce.
pub struct TokenValidator {
    key_source: KeySource,
    clock: Arc<dyn Clock>,
}

impl TokenValidator {
    pub fn new(jwks: Arc<JwksCache>, clock: Arc<dyn Clock>) -> Self {
        Self {
            key_source: KeySource::Jwks(jwks),
            clock,
        }
    }

    /// Validator with a fixed decoding key (useful for testing).
    pub fn new_with_static_key(key: DecodingKey, clock: Arc<dyn Clock>) -> Self {
        Self {
            key_source: KeySource::Static(key),
            clock,
        }
    }

    pub async fn validate(
        &self,
        id_token: &str,
        metadata: &ProviderMetadata,
        config: &ClientConfiguration,
        expected_nonce: Option<&str>,
    ) -> Result<IdTokenClaims, OidcError> {
        let result = self.run_checks(id_token, metadata, config, expected_nonce).await;
        if let Err(err) = &result {
            warn!(kind = %err.kind(), error = %err, "ID token rejected");
        }
        result
    }

    async fn run_checks(
        &self,
        id_token: &str,
        metadata: &ProviderMetadata,
        config: &ClientConfiguration,
        expected_nonce: Option<&str>,
    ) -> Result<IdTokenClaims, OidcError> {
        // 1. Signature
        let header = decode_header(id_token)
            .map_err(|e| OidcError::MalformedToken(format!("failed to decode header: {e}")))?;
        let algorithm = header.alg;
        debug!(?algorithm, kid = ?header.kid, "Decoded ID token header");

        if !metadata.allowed_algorithms().contains(&algorithm) {
            return Err(OidcError::SignatureInvalid(format!(
                "algorithm {algorithm:?} is not accepted for ID tokens"
            )));
        }

        let key = match &self.key_source {
            KeySource::Static(key) => key.clone(),
            KeySource::Jwks(jwks) => {
                jwks.get_key(&metadata.jwks_uri, header.kid.as_deref(), algorithm)
                    .await?
            }
        };

        // Claims are checked below so each failure keeps its own kind.
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        let token_data = decode::<serde_json::Value>(id_token, &key, &validation).map_err(|e| {
            match e.kind() {
                JwtErrorKind::InvalidToken
                | JwtErrorKind::Base64(_)
                | JwtErrorKind::Json(_)
                | JwtErrorKind::Utf8(_) => OidcError::MalformedToken(e.to_string()),
                _ => OidcError::SignatureInvalid(e.to_string()),
            }
        })?;
        let claims = IdTokenClaims::new(token_data.claims);

        // 2. Issuer
        let issuer = claims.issuer().unwrap_or_default();
        if issuer != metadata.issuer {
            return Err(OidcError::IssuerMismatch {
                expected: metadata.issuer.clone(),
                actual: issuer.to_string(),
            });
        }

        // 3. Audience
        let audiences = claims.audiences();
        if !audiences.contains(&config.client_id.as_str()) {
            return Err(OidcError::AudienceMismatch(format!(
                "'{}' is not among {audiences:?}",
                config.client_id
            )));
        }
        if audiences.len() > 1 {
            if let Some(azp) = claims.authorized_party() {
                if azp != config.client_id {
                    return Err(OidcError::AudienceMismatch(format!(
                        "authorized party '{azp}' is not the client"
                    )));
                }
            }
        }

        // 4. Validity window
        let now = self.clock.now_millis();
        let skew = config.clock_skew.as_millis() as i64;
        let exp = claims
            .expires_at()
            .ok_or_else(|| OidcError::MalformedToken("missing 'exp' claim".into()))?;
        if now >= exp.saturating_mul(1000).saturating_add(skew) {
            return Err(OidcError::Expired);
        }
        if let Some(nbf) = claims.not_before() {
            if now < nbf.saturating_mul(1000).saturating_sub(skew) {
                return Err(OidcError::NotYetValid);
            }
        }

        // 5. Nonce
        if let Some(expected) = expected_nonce {
            if claims.nonce() != Some(expected) {
                return Err(OidcError::NonceMismatch);
            }
        }

        debug!(sub = claims.subject().unwrap_or("unknown"), "ID token validated");
        Ok(claims)
    }
}

/// Check the scope granted by the token endpoint.
///
/// Skipped entirely when `disable_scope_validation` is set. An absent scope
/// means the requested scope was granted unchanged.
pub fn validate_scope(granted: Option<&str>, config: &ClientConfiguration) -> Result<(), OidcError> {
    if config.disable_scope_validation {
        return Ok(());
    }
    match granted {
        Some(scope) if !scope.split_whitespace().any(|s| s == OPENID_SCOPE) => {
            Err(OidcError::ScopeMismatch(format!(
                "granted scope '{scope}' does not include '{OPENID_SCOPE}'"
            )))
        }
        _ => Ok(()),
    }
}
