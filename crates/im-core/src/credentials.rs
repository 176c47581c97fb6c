//! Resolution of tracker credentials from the secret store.
//!
//! The store is either a pair of mounted secret files or a pair of env vars;
//! config only carries their names ([`SourceConfig`]).

use std::fmt;

use zeroize::Zeroizing;

use crate::config::SourceConfig;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential `{0}` is missing or empty")]
    Missing(String),
    #[error("failed to read secret file {path}: {message}")]
    Io { path: String, message: String },
}

/// Username/token pair held in memory for the lifetime of a client.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    token: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            token: Zeroizing::new(token.into()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Reads credentials from the configured secret files or env vars.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Resolve the username/token pair. Files take precedence over env vars.
    pub fn resolve(config: &SourceConfig) -> Result<Credentials, CredentialError> {
        let username = Self::read(config.username_file.as_deref(), &config.username_env)?;
        let token = Self::read(config.token_file.as_deref(), &config.token_env)?;
        tracing::debug!(username = %username, "resolved tracker credentials");
        Ok(Credentials::new(username, token))
    }

    fn read(file: Option<&str>, env_var: &str) -> Result<String, CredentialError> {
        let value = match file {
            Some(path) => std::fs::read_to_string(path)
                .map_err(|e| CredentialError::Io {
                    path: path.to_string(),
                    message: e.to_string(),
                })?
                .trim()
                .to_string(),
            None => std::env::var(env_var).unwrap_or_default().trim().to_string(),
        };
        if value.is_empty() {
            return Err(CredentialError::Missing(file.unwrap_or(env_var).to_string()));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_files(user: &std::path::Path, token: &std::path::Path) -> SourceConfig {
        SourceConfig {
            username_file: Some(user.display().to_string()),
            token_file: Some(token.display().to_string()),
            ..SourceConfig::default()
        }
    }

    #[test]
    fn resolves_from_secret_files() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("username");
        let token = dir.path().join("token");
        std::fs::write(&user, "mirror-bot\n").unwrap();
        std::fs::write(&token, "s3cret\n").unwrap();

        let creds = CredentialProvider::resolve(&config_with_files(&user, &token)).unwrap();
        assert_eq!(creds.username(), "mirror-bot");
        assert_eq!(creds.token(), "s3cret");
    }

    #[test]
    fn empty_secret_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let user = dir.path().join("username");
        let token = dir.path().join("token");
        std::fs::write(&user, "mirror-bot").unwrap();
        std::fs::write(&token, "   \n").unwrap();

        let err = CredentialProvider::resolve(&config_with_files(&user, &token)).unwrap_err();
        assert!(matches!(err, CredentialError::Missing(_)));
    }

    #[test]
    fn unreadable_secret_file_is_io_error() {
        let cfg = SourceConfig {
            username_file: Some("/no/such/secret".into()),
            ..SourceConfig::default()
        };
        let err = CredentialProvider::resolve(&cfg).unwrap_err();
        assert!(matches!(err, CredentialError::Io { .. }));
    }

    #[test]
    fn unset_env_var_is_missing() {
        let cfg = SourceConfig {
            username_env: "IM_TEST_DEFINITELY_UNSET_USER".into(),
            token_env: "IM_TEST_DEFINITELY_UNSET_TOKEN".into(),
            ..SourceConfig::default()
        };
        let err = CredentialProvider::resolve(&cfg).unwrap_err();
        assert!(err.to_string().contains("IM_TEST_DEFINITELY_UNSET_USER"));
    }

    #[test]
    fn debug_redacts_token() {
        let creds = Credentials::new("bot", "hunter2");
        let shown = format!("{creds:?}");
        assert!(shown.contains("bot"));
        assert!(!shown.contains("hunter2"));
    }
}
