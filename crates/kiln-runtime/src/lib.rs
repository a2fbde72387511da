//! Container engine and version-control backends for Kiln builds.
//!
//! This crate implements the execution layer a build talks to: the pluggable
//! `ContainerEngine` trait with a docker-CLI backend and an in-memory mock,
//! the `SourceControl` trait with a git-CLI backend and mock, a bounded
//! error-carrying pipe joining archive producers to engine consumers, HTTP
//! script downloads and completion callbacks, and prerequisite checking.

pub mod docker;
pub mod engine;
pub mod git;
pub mod http;
pub mod mock;
pub mod pipe;
pub mod prereq;

pub use engine::{select_engine, CommitSpec, ContainerEngine, ContainerSpec, ImageInfo};
pub use git::{is_remote_source, GitCli, SourceControl};
pub use mock::{MockEngine, MockImage, MockSourceControl};
pub use pipe::{pipe, PipeReader, PipeWriter};
pub use prereq::{check_engine_prereqs, format_missing, MissingPrereq};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine '{0}' is not available on this system")]
    EngineUnavailable(String),
    #[error("{op} failed: {message}")]
    Engine { op: &'static str, message: String },
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("container not found: {0}")]
    ContainerNotFound(String),
    #[error("git {op} failed: {message}")]
    Vcs { op: &'static str, message: String },
    #[error("download of {url} failed: {message}")]
    Download { url: String, message: String },
    #[error("unsupported URL scheme: {0}")]
    UnsupportedUrl(String),
    #[error("malformed engine response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Fs(#[from] kiln_fs::FsError),
}

impl RuntimeError {
    pub(crate) fn engine(op: &'static str, message: impl Into<String>) -> Self {
        Self::Engine {
            op,
            message: message.into(),
        }
    }
}
