use crate::config::ConfigError;

/// Backend used to turn a secret reference into its value.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<String, ConfigError>;
}

/// Default resolver: env vars and file references.
///
/// - `${VAR_NAME}` reads an environment variable
/// - `${env:VAR_NAME}` same, explicitly
/// - `${file:/path/to/secret}` reads a file (trimmed)
pub struct DefaultSecretResolver;

impl SecretResolver for DefaultSecretResolver {
    fn resolve(&self, reference: &str) -> Result<String, ConfigError> {
        let reference = reference.trim();
        if let Some(path) = reference.strip_prefix("file:") {
            std::fs::read_to_string(path.trim())
                .map(|s| s.trim().to_string())
                .map_err(|e| ConfigError::Secret(format!("secret file '{}': {e}", path.trim())))
        } else {
            let var = reference.strip_prefix("env:").unwrap_or(reference).trim();
            std::env::var(var).map_err(|_| ConfigError::Secret(format!("env var '{var}' not set")))
        }
    }
}

/// The client secret as configured: either the literal value or a value
/// containing `${...}` references that must be resolved before use.
#[derive(Clone, Default)]
pub struct ClientSecret(String);

impl ClientSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Whether the configured value references an external secret.
    pub fn is_reference(&self) -> bool {
        self.0.contains("${")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolve every `${...}` reference, returning the usable secret.
    pub fn resolve(&self, resolver: &dyn SecretResolver) -> Result<String, ConfigError> {
        let mut result = self.0.clone();
        while let Some(start) = result.find("${") {
            let end = result[start..]
                .find('}')
                .ok_or_else(|| ConfigError::Secret("unclosed secret reference".into()))?;
            let resolved = resolver.resolve(&result[start + 2..start + end])?;
            result = format!("{}{}{}", &result[..start], resolved, &result[start + end + 1..]);
        }
        Ok(result)
    }
}

impl From<&str> for ClientSecret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ClientSecret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// Never print the secret itself.
impl std::fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_reference() {
            write!(f, "ClientSecret({})", self.0)
        } else {
            f.write_str("ClientSecret(***)")
        }
    }
}
