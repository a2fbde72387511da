use crate::CoreError;
use kiln_runtime::ImageInfo;
use kiln_schema::{BuildRequest, RangeList};
use std::path::{Component, Path};

/// Reject requests that cannot be built before anything is touched.
pub fn validate_request(request: &BuildRequest) -> Result<(), CoreError> {
    request.check_required()?;
    if !request.destination.starts_with('/') {
        return Err(CoreError::Configuration(format!(
            "destination {:?} must be an absolute path",
            request.destination
        )));
    }
    let context = Path::new(&request.context_dir);
    if context
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
    {
        return Err(CoreError::Configuration(format!(
            "context directory {:?} must be relative to the source root",
            request.context_dir
        )));
    }
    Ok(())
}

/// The user the build container runs as: the requested assemble user, else
/// the builder image's configured user, else root.
pub fn resolve_user(request: &BuildRequest, image: &ImageInfo) -> String {
    let user = request
        .assemble_user
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or(image.user.as_str())
        .trim();
    if user.is_empty() {
        "0".to_owned()
    } else {
        user.to_owned()
    }
}

/// Check `user` against the allowed UID ranges. An empty list allows any
/// user; otherwise the user must be numeric and inside a range. Only the
/// part before `:` (the group) is considered.
pub fn check_user(allowed: &RangeList, user: &str) -> Result<(), CoreError> {
    if allowed.is_empty() {
        return Ok(());
    }
    let name = user.split(':').next().unwrap_or_default().trim();
    let name = if name.is_empty() { "0" } else { name };
    match name.parse::<u32>() {
        Ok(uid) if allowed.contains(uid) => Ok(()),
        _ => Err(CoreError::UserNotAllowed {
            user: user.to_owned(),
            allowed: allowed.to_string(),
        }),
    }
}
