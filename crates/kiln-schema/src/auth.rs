use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Credentials presented to a registry when pulling an image.
///
/// Either point at an engine client configuration directory that already
/// holds credentials, or give a username and password to log in with for
/// the duration of the pull. Explicit credentials take precedence.
#[derive(Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryAuth {
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Registry to log in to; the engine's default registry when empty.
    #[serde(default)]
    pub server: String,
}

impl RegistryAuth {
    pub fn with_config_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    #[inline]
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.config_dir.is_none() && !self.has_credentials()
    }
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("config_dir", &self.config_dir)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("server", &self.server)
            .finish()
    }
}
