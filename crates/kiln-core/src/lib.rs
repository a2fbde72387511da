//! Build-strategy engine for Kiln.
//!
//! This crate ties together the request model, the filesystem layer and the
//! engine/VCS backends into the `Builder`, the central API for turning
//! application source plus a builder image into a committed output image. It
//! owns strategy selection, source acquisition, script resolution, user
//! validation, the standard and layered executors, label computation,
//! cancellation and scoped cleanup.

pub mod cleanup;
pub mod concurrency;
pub mod engine;
pub mod environment;
pub mod executor;
pub mod labels;
pub mod layered;
pub mod scripts;
pub mod source;
pub mod strategy;
pub mod validate;

pub use cleanup::Cleanup;
pub use concurrency::{install_signal_handler, CancelToken};
pub use engine::{BuildFailure, Builder};
pub use scripts::{ResolvedScript, ScriptName, ScriptOrigin, ScriptSet};
pub use strategy::{select_strategy, Strategy};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid request: {0}")]
    Schema(#[from] kiln_schema::SchemaError),
    #[error("user {user:?} is not allowed to run the build (allowed UIDs: {allowed})")]
    UserNotAllowed { user: String, allowed: String },
    #[error("failed to fetch source {location}: {source}")]
    SourceFetch {
        location: String,
        source: kiln_runtime::RuntimeError,
    },
    #[error("failed to check out {git_ref:?}: {source}")]
    Checkout {
        git_ref: String,
        source: kiln_runtime::RuntimeError,
    },
    #[error("failed to copy source: {0}")]
    SourceCopy(#[source] kiln_fs::FsError),
    #[error("context directory {0:?} does not exist in the source")]
    ContextDirMissing(String),
    #[error("required scripts could not be found: {}", .missing.join(", "))]
    ScriptResolution { missing: Vec<String> },
    #[error("engine error: {0}")]
    Engine(#[from] kiln_runtime::RuntimeError),
    #[error("{script} exited with code {code}")]
    AssembleFailed {
        script: String,
        code: i64,
        output: String,
    },
    #[error("build cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("filesystem error: {0}")]
    Fs(#[from] kiln_fs::FsError),
}

impl CoreError {
    /// Stable category of the error, matching the failure taxonomy exposed
    /// to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::Schema(_) | Self::UserNotAllowed { .. } => {
                "configuration"
            }
            Self::SourceFetch { .. }
            | Self::Checkout { .. }
            | Self::SourceCopy(_)
            | Self::ContextDirMissing(_) => "source",
            Self::ScriptResolution { .. } => "scripts",
            Self::Engine(_) => "engine",
            Self::AssembleFailed { .. } => "assemble",
            Self::Cancelled => "cancelled",
            Self::Io(_) | Self::Fs(_) => "io",
        }
    }
}
