use crate::auth::RegistryAuth;
use crate::policy::{NetworkMode, PullPolicy};
use crate::uid::RangeList;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_DESTINATION: &str = "/tmp";
pub const DEFAULT_LABEL_NAMESPACE: &str = "io.kiln.build.";

/// Everything needed to perform one build. Immutable once the build starts.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BuildRequest {
    /// Repository URL or local directory holding the application source.
    pub source: String,
    /// Branch, tag or commit to check out after cloning.
    #[serde(default, rename = "ref")]
    pub git_ref: String,
    /// Subdirectory of the source to use as the application root.
    #[serde(default)]
    pub context_dir: String,
    /// Clone without `--recursive`.
    #[serde(default)]
    pub no_recursive: bool,

    pub builder_image: String,
    #[serde(default)]
    pub builder_image_version: Option<String>,
    #[serde(default)]
    pub builder_base_image_version: Option<String>,
    #[serde(default)]
    pub builder_pull_policy: PullPolicy,
    /// Deprecated spelling of `builder_pull_policy = "always"`.
    #[serde(default)]
    pub force_pull: bool,
    /// Credentials for pulling the builder image.
    #[serde(default)]
    pub builder_pull_auth: Option<RegistryAuth>,

    /// Tag applied to the committed output image.
    pub tag: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default = "default_label_namespace")]
    pub label_namespace: String,

    #[serde(default)]
    pub incremental: bool,
    #[serde(default = "default_previous_image_pull_policy")]
    pub previous_image_pull_policy: PullPolicy,
    /// Credentials for pulling the previous output image.
    #[serde(default)]
    pub previous_image_pull_auth: Option<RegistryAuth>,
    /// Remove the previous output image after a successful incremental build.
    #[serde(default)]
    pub remove_previous_image: bool,
    /// Force the layered strategy regardless of the builder image tag.
    #[serde(default)]
    pub layered: bool,

    #[serde(default)]
    pub allowed_uids: RangeList,
    #[serde(default)]
    pub assemble_user: Option<String>,
    #[serde(default)]
    pub network_mode: NetworkMode,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Location of externally supplied lifecycle scripts.
    #[serde(default)]
    pub scripts_url: Option<String>,
    /// Directory inside the container that receives scripts and sources.
    #[serde(default = "default_destination")]
    pub destination: String,

    /// Explicit working directory; a unique temporary one is used when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub preserve_working_dir: bool,

    /// Receives a JSON summary once the build has finished.
    #[serde(default)]
    pub callback_url: Option<String>,
    /// Demote script output from info to debug.
    #[serde(default)]
    pub quiet: bool,
}

fn default_label_namespace() -> String {
    DEFAULT_LABEL_NAMESPACE.to_owned()
}

fn default_previous_image_pull_policy() -> PullPolicy {
    PullPolicy::Always
}

fn default_destination() -> String {
    DEFAULT_DESTINATION.to_owned()
}

impl BuildRequest {
    pub fn new(
        source: impl Into<String>,
        builder_image: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            git_ref: String::new(),
            context_dir: String::new(),
            no_recursive: false,
            builder_image: builder_image.into(),
            builder_image_version: None,
            builder_base_image_version: None,
            builder_pull_policy: PullPolicy::default(),
            force_pull: false,
            builder_pull_auth: None,
            tag: tag.into(),
            display_name: None,
            description: None,
            labels: BTreeMap::new(),
            label_namespace: default_label_namespace(),
            incremental: false,
            previous_image_pull_policy: default_previous_image_pull_policy(),
            previous_image_pull_auth: None,
            remove_previous_image: false,
            layered: false,
            allowed_uids: RangeList::default(),
            assemble_user: None,
            network_mode: NetworkMode::default(),
            environment: BTreeMap::new(),
            scripts_url: None,
            destination: default_destination(),
            working_dir: None,
            preserve_working_dir: false,
            callback_url: None,
            quiet: false,
        }
    }

    /// The pull policy actually applied to the builder image.
    pub fn effective_builder_pull_policy(&self) -> PullPolicy {
        if self.force_pull {
            PullPolicy::Always
        } else {
            self.builder_pull_policy
        }
    }

    /// Check the fields every build needs.
    pub fn check_required(&self) -> Result<(), SchemaError> {
        if self.source.trim().is_empty() {
            return Err(SchemaError::MissingField("source"));
        }
        if self.builder_image.trim().is_empty() {
            return Err(SchemaError::MissingField("builder_image"));
        }
        if self.tag.trim().is_empty() {
            return Err(SchemaError::MissingField("tag"));
        }
        if self.destination.trim().is_empty() {
            return Err(SchemaError::MissingField("destination"));
        }
        Ok(())
    }
}

pub fn parse_request_str(input: &str) -> Result<BuildRequest, SchemaError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_request_file(path: impl AsRef<Path>) -> Result<BuildRequest, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_request_str(&content)
}
