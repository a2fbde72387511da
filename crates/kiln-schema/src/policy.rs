use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// When to pull an image from its registry before using it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PullPolicy {
    Always,
    Never,
    #[default]
    IfNotPresent,
}

impl PullPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Never => "never",
            Self::IfNotPresent => "if-not-present",
        }
    }
}

impl FromStr for PullPolicy {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            "if-not-present" => Ok(Self::IfNotPresent),
            other => Err(SchemaError::InvalidPullPolicy(other.to_owned())),
        }
    }
}

impl TryFrom<String> for PullPolicy {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PullPolicy> for String {
    fn from(value: PullPolicy) -> Self {
        value.as_str().to_owned()
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network the build container joins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NetworkMode {
    /// Whatever the engine picks when no network is requested.
    #[default]
    Default,
    Host,
    Bridge,
    /// Share the network namespace of an existing container.
    Container(String),
    /// A user-defined network, by name.
    Named(String),
}

const CONTAINER_PREFIX: &str = "container:";

impl NetworkMode {
    /// The value for the engine's `--network` option, if any.
    pub fn engine_arg(&self) -> Option<String> {
        match self {
            Self::Default => None,
            other => Some(other.to_string()),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "default" => Ok(Self::Default),
            "host" => Ok(Self::Host),
            "bridge" => Ok(Self::Bridge),
            other => {
                if let Some(id) = other.strip_prefix(CONTAINER_PREFIX) {
                    if id.is_empty() {
                        return Err(SchemaError::InvalidNetworkMode(other.to_owned()));
                    }
                    return Ok(Self::Container(id.to_owned()));
                }
                let valid = other
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
                if valid {
                    Ok(Self::Named(other.to_owned()))
                } else {
                    Err(SchemaError::InvalidNetworkMode(other.to_owned()))
                }
            }
        }
    }
}

impl TryFrom<String> for NetworkMode {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetworkMode> for String {
    fn from(value: NetworkMode) -> Self {
        value.to_string()
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::Host => f.write_str("host"),
            Self::Bridge => f.write_str("bridge"),
            Self::Container(id) => write!(f, "{CONTAINER_PREFIX}{id}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_policy_accepts_exact_vocabulary() {
        assert_eq!("always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert_eq!(
            "if-not-present".parse::<PullPolicy>().unwrap(),
            PullPolicy::IfNotPresent
        );
    }

    #[test]
    fn pull_policy_rejects_anything_else() {
        for bad in ["Always", "ifnotpresent", "", "sometimes"] {
            assert!(bad.parse::<PullPolicy>().is_err(), "{bad} must be rejected");
        }
    }

    #[test]
    fn pull_policy_default_is_if_not_present() {
        assert_eq!(PullPolicy::default(), PullPolicy::IfNotPresent);
    }

    #[test]
    fn network_mode_parses_container_form() {
        let mode: NetworkMode = "container:abc123".parse().unwrap();
        assert_eq!(mode, NetworkMode::Container("abc123".to_owned()));
        assert_eq!(mode.to_string(), "container:abc123");
    }

    #[test]
    fn network_mode_rejects_empty_container() {
        assert!("container:".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn network_mode_rejects_garbage() {
        assert!("bad network!".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn default_network_has_no_engine_arg() {
        assert_eq!(NetworkMode::Default.engine_arg(), None);
        assert_eq!(NetworkMode::Host.engine_arg().as_deref(), Some("host"));
        assert_eq!(
            NetworkMode::Named("ci-net".to_owned()).engine_arg().as_deref(),
            Some("ci-net")
        );
    }
}
