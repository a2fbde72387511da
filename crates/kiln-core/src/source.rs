//! Source acquisition: clone or copy the application source into
//! `upload/src` and record its provenance.

use crate::CoreError;
use kiln_fs::{copy_contents, remove_dir, FsError, WorkingTree};
use kiln_runtime::SourceControl;
use kiln_schema::{BuildRequest, SourceInfo};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Populate `tree.source_dir()` with exactly the tree to build and return
/// its provenance.
///
/// Remote sources are cloned (into the scratch path first when a context
/// directory is set, so unrelated top-level files never reach the final
/// tree). Local sources are copied with contents-of semantics from
/// `source/context_dir`. On failure the partial source tree is removed.
pub fn acquire(
    request: &BuildRequest,
    tree: &WorkingTree,
    vcs: &dyn SourceControl,
) -> Result<SourceInfo, CoreError> {
    let result = if vcs.is_remote(&request.source) {
        acquire_remote(request, tree, vcs)
    } else {
        acquire_local(request, tree, vcs)
    };
    if result.is_err() {
        let _ = remove_dir(&tree.source_dir());
        let _ = remove_dir(&tree.scratch_dir());
    }
    let mut info = result?;
    info.context_dir.clone_from(&request.context_dir);
    if info.location.is_empty() {
        info.location.clone_from(&request.source);
    }
    Ok(info)
}

fn acquire_remote(
    request: &BuildRequest,
    tree: &WorkingTree,
    vcs: &dyn SourceControl,
) -> Result<SourceInfo, CoreError> {
    let has_context = !request.context_dir.is_empty();
    let target = if has_context {
        tree.scratch_dir()
    } else {
        tree.source_dir()
    };

    info!("cloning {}", request.source);
    vcs.clone_repo(&request.source, &target, !request.no_recursive)
        .map_err(|source| CoreError::SourceFetch {
            location: request.source.clone(),
            source,
        })?;

    if !request.git_ref.is_empty() {
        debug!("checking out {}", request.git_ref);
        vcs.checkout(&target, &request.git_ref)
            .map_err(|source| CoreError::Checkout {
                git_ref: request.git_ref.clone(),
                source,
            })?;
    }

    let info = describe(vcs, &target, request);

    if has_context {
        copy_context(&target.join(&request.context_dir), &tree.source_dir(), request)?;
        remove_dir(&target)?;
    }
    Ok(info)
}

fn acquire_local(
    request: &BuildRequest,
    tree: &WorkingTree,
    vcs: &dyn SourceControl,
) -> Result<SourceInfo, CoreError> {
    let root = PathBuf::from(&request.source);
    if !root.is_dir() {
        return Err(CoreError::SourceCopy(FsError::NotFound(
            request.source.clone(),
        )));
    }
    if !request.git_ref.is_empty() {
        warn!(
            "ref {:?} ignored: local sources are copied as they are",
            request.git_ref
        );
    }

    info!("copying local source {}", root.display());
    copy_context(&root.join(&request.context_dir), &tree.source_dir(), request)?;

    if vcs.is_repository(&root) {
        Ok(describe(vcs, &root, request))
    } else {
        Ok(SourceInfo::local(&request.source, &request.context_dir))
    }
}

fn copy_context(from: &Path, to: &Path, request: &BuildRequest) -> Result<(), CoreError> {
    match copy_contents(from, to) {
        Ok(()) => Ok(()),
        Err(FsError::NotFound(_)) if !request.context_dir.is_empty() => {
            Err(CoreError::ContextDirMissing(request.context_dir.clone()))
        }
        Err(e) => Err(CoreError::SourceCopy(e)),
    }
}

/// Provenance is best-effort: a checkout that cannot be described still
/// builds, only without commit labels.
fn describe(vcs: &dyn SourceControl, repo: &Path, request: &BuildRequest) -> SourceInfo {
    match vcs.describe(repo) {
        Ok(info) => info,
        Err(e) => {
            warn!("could not read source metadata: {e}");
            SourceInfo::local(&request.source, &request.context_dir)
        }
    }
}
