//! Build request model, policies, and provenance types for Kiln.
//!
//! This crate defines the configuration layer: the immutable `BuildRequest`
//! describing one build (parsed from TOML or assembled by the CLI), the pull
//! policy and network mode vocabularies, registry credentials, allowed-UID
//! range lists, the `SourceInfo` provenance record used for image labels,
//! image reference helpers, and the `BuildResult` surface returned to callers.

pub mod auth;
pub mod image_ref;
pub mod policy;
pub mod request;
pub mod result;
pub mod source;
pub mod types;
pub mod uid;

pub use auth::RegistryAuth;
pub use image_ref::{
    has_layered_marker, image_tag, DEFAULT_SCRIPTS_URL, LAYERED_MARKER, SCRIPTS_URL_LABEL,
};
pub use policy::{NetworkMode, PullPolicy};
pub use request::{parse_request_file, parse_request_str, BuildRequest};
pub use result::BuildResult;
pub use source::SourceInfo;
pub use types::{ContainerId, ImageId};
pub use uid::{RangeList, UidRange};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read request file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse request: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid pull policy {0:?}, valid values are: always, never or if-not-present")]
    InvalidPullPolicy(String),
    #[error("invalid network mode {0:?}")]
    InvalidNetworkMode(String),
    #[error("invalid UID range {0:?}")]
    InvalidUidRange(String),
    #[error("{0} must not be empty")]
    MissingField(&'static str),
}
