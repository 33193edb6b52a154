use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, OidcError};
use crate::flight::SingleFlight;
use crate::http::{HttpClient, HttpRequest, SharedHttpClient, Timeouts};

/// JWKS response envelope. Keys are parsed one by one so a single
/// unsupported key does not poison the whole set.
#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFamily {
    Rsa,
    Ec,
    Okp,
}

impl KeyFamily {
    fn of(params: &AlgorithmParameters) -> Option<Self> {
        match params {
            AlgorithmParameters::RSA(_) => Some(KeyFamily::Rsa),
            AlgorithmParameters::EllipticCurve(_) => Some(KeyFamily::Ec),
            AlgorithmParameters::OctetKeyPair(_) => Some(KeyFamily::Okp),
            // Symmetric keys are never published for ID token verification.
            _ => None,
        }
    }

    fn supports(self, alg: Algorithm) -> bool {
        use Algorithm::*;
        match self {
            KeyFamily::Rsa => matches!(alg, RS256 | RS384 | RS512 | PS256 | PS384 | PS512),
            KeyFamily::Ec => matches!(alg, ES256 | ES384),
            KeyFamily::Okp => matches!(alg, EdDSA),
        }
    }
}

#[derive(Clone)]
struct CachedKey {
    kid: Option<String>,
    /// `alg` advertised by the JWK, in JOSE spelling.
    alg: Option<String>,
    family: KeyFamily,
    key: DecodingKey,
}

impl CachedKey {
    fn from_jwk(jwk: &Jwk) -> Option<Self> {
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return None;
        }
        let family = KeyFamily::of(&jwk.algorithm)?;
        let key = match DecodingKey::from_jwk(jwk) {
            Ok(key) => key,
            Err(e) => {
                debug!(kid = ?jwk.common.key_id, error = %e, "Skipping unusable JWK");
                return None;
            }
        };
        Some(Self {
            kid: jwk.common.key_id.clone(),
            alg: jwk.common.key_algorithm.as_ref().map(|a| format!("{a:?}")),
            family,
            key,
        })
    }

    fn accepts(&self, alg: Algorithm) -> bool {
        self.family.supports(alg)
            && self
                .alg
                .as_deref()
                .map_or(true, |advertised| advertised == format!("{alg:?}"))
    }
}

/// One provider's key set, replaced wholesale on every successful fetch.
pub struct JwksCacheEntry {
    keys: Vec<CachedKey>,
    fetched_at: Instant,
    source_uri: String,
}

impl JwksCacheEntry {
    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn key_ids(&self) -> Vec<&str> {
        self.keys.iter().filter_map(|k| k.kid.as_deref()).collect()
    }

    /// Select the key for a token header.
    ///
    /// With a `kid` the key must carry that id. Without one, the key is used
    /// only if it is the single key compatible with the algorithm.
    fn select(&self, kid: Option<&str>, alg: Algorithm) -> Option<DecodingKey> {
        match kid {
            Some(kid) => self
                .keys
                .iter()
                .find(|k| k.kid.as_deref() == Some(kid) && k.accepts(alg))
                .map(|k| k.key.clone()),
            None => {
                let mut candidates = self.keys.iter().filter(|k| k.accepts(alg));
                match (candidates.next(), candidates.next()) {
                    (Some(only), None) => Some(only.key.clone()),
                    _ => None,
                }
            }
        }
    }
}

/// Cache of provider signing keys, one entry per JWKS URI.
///
/// Shared by every session of every provider. A miss fetches the key set; a
/// token signed with an unknown `kid` forces one refetch before the key is
/// declared unknown. Concurrent fetches for the same URI are collapsed into
/// one network call. There is no background refresh.
pub struct JwksCache {
    entries: Arc<DashMap<String, Arc<JwksCacheEntry>>>,
    flight: SingleFlight<String, Arc<JwksCacheEntry>>,
    http: SharedHttpClient,
    timeouts: Timeouts,
    min_refresh_interval: Duration,
}

impl JwksCache {
    /// Create an empty cache. Nothing is fetched until the first lookup.
    pub fn new(http: impl HttpClient, timeouts: Timeouts) -> Self {
        Self::with_shared_client(Arc::new(http), timeouts)
    }

    pub(crate) fn with_shared_client(http: SharedHttpClient, timeouts: Timeouts) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            flight: SingleFlight::new(),
            http,
            timeouts,
            min_refresh_interval: Duration::ZERO,
        }
    }

    /// Minimum age of an entry before an unknown `kid` may force a refetch.
    ///
    /// Zero (the default) allows one refetch per unknown-key lookup.
    pub fn with_min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// The cached entry for `jwks_uri`, if any.
    pub fn entry(&self, jwks_uri: &str) -> Option<Arc<JwksCacheEntry>> {
        self.entries.get(jwks_uri).map(|e| Arc::clone(e.value()))
    }

    /// Drop the cached entry; the next lookup fetches again.
    pub fn invalidate(&self, jwks_uri: &str) {
        if self.entries.remove(jwks_uri).is_some() {
            debug!(jwks_uri, "JWKS cache entry invalidated");
        }
    }

    /// Retrieve the decoding key for a token signed with `alg` and `kid`.
    pub async fn get_key(
        &self,
        jwks_uri: &str,
        kid: Option<&str>,
        alg: Algorithm,
    ) -> Result<DecodingKey, OidcError> {
        let unknown = || match kid {
            Some(kid) => OidcError::SignatureInvalid(format!("unknown signing key '{kid}'")),
            None => OidcError::SignatureInvalid(format!("no unambiguous {alg:?} key without 'kid'")),
        };

        let entry = match self.entry(jwks_uri) {
            Some(entry) => {
                if let Some(key) = entry.select(kid, alg) {
                    return Ok(key);
                }
                if kid.is_none() {
                    debug!(jwks_uri, ?alg, "No unambiguous key for token without 'kid'");
                    return Err(unknown());
                }
                if !can_attempt(Some(entry.fetched_at), self.min_refresh_interval) {
                    debug!(jwks_uri, ?kid, "Unknown key, refetch suppressed");
                    return Err(unknown());
                }
                debug!(jwks_uri, ?kid, "Unknown key, refetching JWKS");
                self.fetch(jwks_uri, Some(entry.fetched_at)).await?
            }
            None => self.fetch(jwks_uri, None).await?,
        };

        entry.select(kid, alg).ok_or_else(unknown)
    }

    /// Fetch the key set now, replacing the cached entry on success.
    pub async fn refresh(&self, jwks_uri: &str) -> Result<Arc<JwksCacheEntry>, OidcError> {
        let seen = self.entry(jwks_uri).map(|e| e.fetched_at);
        self.fetch(jwks_uri, seen).await
    }

    /// Fetch unless an entry newer than `seen` has landed meanwhile.
    async fn fetch(
        &self,
        jwks_uri: &str,
        seen: Option<Instant>,
    ) -> Result<Arc<JwksCacheEntry>, OidcError> {
        let entries = Arc::clone(&self.entries);
        let http = Arc::clone(&self.http);
        let timeouts = self.timeouts;
        let uri = jwks_uri.to_string();

        self.flight
            .run(jwks_uri.to_string(), async move {
                if let Some(current) = entries.get(&uri).map(|e| Arc::clone(e.value())) {
                    if seen.map_or(true, |seen| current.fetched_at > seen) {
                        return Ok(current);
                    }
                }
                let entry = Arc::new(fetch_jwks(http, &uri, timeouts).await?);
                entries.insert(uri, Arc::clone(&entry));
                Ok(entry)
            })
            .await
    }
}

async fn fetch_jwks(
    http: SharedHttpClient,
    uri: &str,
    timeouts: Timeouts,
) -> Result<JwksCacheEntry, OidcError> {
    let started = Instant::now();
    let response = http
        .execute(HttpRequest::get(uri).timeouts(timeouts))
        .await
        .map_err(|e| {
            warn!(jwks_uri = uri, error = %e, "JWKS fetch failed");
            OidcError::transport(ErrorKind::JwksUnavailable, e, OidcError::JwksUnavailable)
        })?;

    if !response.is_success() {
        warn!(jwks_uri = uri, status = response.status, "JWKS endpoint returned an error");
        return Err(OidcError::JwksUnavailable(format!(
            "JWKS endpoint returned HTTP {}",
            response.status
        )));
    }

    let document: JwksDocument = response
        .json()
        .map_err(|e| OidcError::JwksUnavailable(format!("failed to parse JWKS: {e}")))?;

    let total = document.keys.len();
    let keys: Vec<CachedKey> = document
        .keys
        .into_iter()
        .filter_map(|value| serde_json::from_value::<Jwk>(value).ok())
        .filter_map(|jwk| CachedKey::from_jwk(&jwk))
        .collect();

    info!(
        jwks_uri = uri,
        keys = keys.len(),
        skipped = total - keys.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "JWKS fetched"
    );

    Ok(JwksCacheEntry {
        keys,
        fetched_at: Instant::now(),
        source_uri: uri.to_string(),
    })
}

fn can_attempt(last_attempt: Option<Instant>, min_interval: Duration) -> bool {
    match last_attempt {
        None => true,
        Some(ts) => ts.elapsed() >= min_interval,
    }
}
