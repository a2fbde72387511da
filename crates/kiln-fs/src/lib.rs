//! Filesystem utilities for Kiln builds.
//!
//! This crate provides the host-side file handling a build needs: the
//! `WorkingTree` layout (`upload/src`, `upload/scripts`, `upload/artifacts`),
//! contents-of directory copies, idempotent removal, and deterministic tar
//! packing that streams into any writer so archives never need to be held in
//! memory, plus the matching unpacker.

pub mod archive;
pub mod copy;
pub mod layout;

pub use archive::{pack_build_context, pack_dir, pack_dir_under, unpack, RECIPE_FILE};
pub use copy::{copy_contents, install_file, remove_dir};
pub use layout::WorkingTree;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("filesystem I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("copy failed from {from} to {to}: {source}")]
    Copy {
        from: String,
        to: String,
        source: std::io::Error,
    },
    #[error("source path does not exist: {0}")]
    NotFound(String),
    #[error("working directory already exists: {0}")]
    AlreadyExists(String),
    #[error("archive entry {0} would be written outside the target directory")]
    UnsafeEntry(String),
}
