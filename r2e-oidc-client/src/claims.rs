use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ClaimsDefinition, ClientConfiguration};
use crate::discovery::ProviderMetadata;
use crate::error::{ErrorKind, OidcError};
use crate::http::{HttpRequest, SharedHttpClient, Timeouts};
use crate::validator::IdTokenClaims;

/// The authenticated caller, as seen by the application.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Subject claim ("sub") - unique user identifier at the provider.
    pub subject: String,

    /// Value of the configured caller-name claim.
    pub caller_name: String,

    /// Values of the configured groups claim.
    pub groups: Vec<String>,

    /// Merged ID token and userinfo claims.
    pub claims: serde_json::Value,
}

impl Identity {
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Look up a claim by name, falling back to a dotted path into nested objects.
///
/// A literal key wins, so names such as `https://example.com/groups` work.
///
/// ```
/// use r2e_oidc_client::claims::claim_at;
///
/// let claims = serde_json::json!({ "realm_access": { "roles": ["admin"] } });
/// assert_eq!(claim_at(&claims, "realm_access.roles"), Some(&serde_json::json!(["admin"])));
/// ```
pub fn claim_at<'a>(claims: &'a serde_json::Value, name: &str) -> Option<&'a serde_json::Value> {
    if let Some(value) = claims.get(name) {
        return Some(value);
    }
    if !name.contains('.') {
        return None;
    }
    let mut current = claims;
    for key in name.split('.') {
        current = current.get(key)?;
    }
    Some(current)
}

/// Read a group list that may be an array of strings or a single string.
pub fn extract_groups(claims: &serde_json::Value, name: &str) -> Vec<String> {
    match claim_at(claims, name) {
        Some(serde_json::Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(serde_json::Value::String(group)) => vec![group.clone()],
        _ => Vec::new(),
    }
}

/// Userinfo claims override ID token claims with the same name.
fn merge_claims(id_claims: &serde_json::Value, userinfo: serde_json::Value) -> serde_json::Value {
    let mut merged = id_claims.clone();
    if let (Some(target), serde_json::Value::Object(source)) = (merged.as_object_mut(), userinfo) {
        for (name, value) in source {
            target.insert(name, value);
        }
    }
    merged
}

/// Derives the caller [`Identity`] from ID token claims, optionally enriched
/// with the provider's userinfo response.
pub struct ClaimsMapper {
    http: SharedHttpClient,
    definition: ClaimsDefinition,
    from_id_token: bool,
    timeouts: Timeouts,
}

impl ClaimsMapper {
    pub(crate) fn new(http: SharedHttpClient, config: &ClientConfiguration) -> Self {
        Self {
            http,
            definition: config.claims.clone(),
            from_id_token: config.user_claims_from_id_token,
            timeouts: config.http_timeouts(),
        }
    }

    pub async fn map_identity(
        &self,
        id_claims: &IdTokenClaims,
        access_token: &str,
        metadata: &ProviderMetadata,
    ) -> Result<Identity, OidcError> {
        let subject = id_claims
            .subject()
            .ok_or_else(|| OidcError::MissingCallerClaim("sub".into()))?
            .to_string();

        let claims = match (&metadata.userinfo_endpoint, self.from_id_token) {
            (_, true) => id_claims.as_value().clone(),
            (None, false) => {
                warn!("Provider has no userinfo endpoint, using ID token claims");
                id_claims.as_value().clone()
            }
            (Some(endpoint), false) => {
                let userinfo = self.fetch_userinfo(endpoint, access_token).await?;
                match userinfo.get("sub").and_then(|v| v.as_str()) {
                    Some(sub) if sub == subject => {}
                    Some(_) => {
                        return Err(OidcError::UserinfoError(
                            "userinfo subject does not match ID token".into(),
                        ))
                    }
                    None => {
                        return Err(OidcError::UserinfoError(
                            "userinfo response has no 'sub' claim".into(),
                        ))
                    }
                }
                merge_claims(id_claims.as_value(), userinfo)
            }
        };

        self.build(subject, claims)
    }

    /// Build the identity from already merged claims.
    pub fn build(&self, subject: String, claims: serde_json::Value) -> Result<Identity, OidcError> {
        let name_claim = &self.definition.caller_name_claim;
        let caller_name = match claim_at(&claims, name_claim) {
            Some(serde_json::Value::String(name)) if !name.is_empty() => name.clone(),
            _ => return Err(OidcError::MissingCallerClaim(name_claim.clone())),
        };
        let groups = extract_groups(&claims, &self.definition.caller_groups_claim);

        debug!(%caller_name, groups = groups.len(), "Caller identity mapped");
        Ok(Identity {
            subject,
            caller_name,
            groups,
            claims,
        })
    }

    async fn fetch_userinfo(
        &self,
        endpoint: &str,
        access_token: &str,
    ) -> Result<serde_json::Value, OidcError> {
        let request = HttpRequest::get(endpoint)
            .header("Authorization", format!("Bearer {access_token}"))
            .header("Accept", "application/json")
            .timeouts(self.timeouts);

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| OidcError::transport(ErrorKind::UserinfoError, e, OidcError::UserinfoError))?;

        if !response.is_success() {
            return Err(OidcError::UserinfoError(format!(
                "userinfo endpoint returned HTTP {}",
                response.status
            )));
        }

        let claims: serde_json::Value = response
            .json()
            .map_err(|e| OidcError::UserinfoError(format!("invalid userinfo response: {e}")))?;
        if !claims.is_object() {
            return Err(OidcError::UserinfoError("userinfo response is not an object".into()));
        }
        Ok(claims)
    }
}
