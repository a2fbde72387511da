use crate::RuntimeError;
use kiln_schema::{ContainerId, ImageId, RegistryAuth};
use std::collections::BTreeMap;
use std::io::Read;

/// What the engine reports about a local image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: ImageId,
    /// Configured default user, possibly `name:group` or empty.
    pub user: String,
    pub labels: BTreeMap<String, String>,
}

impl ImageInfo {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Parameters of a container to create. The first element of `command`
/// replaces the image entrypoint; the rest are its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub command: Vec<String>,
    pub user: Option<String>,
    pub network: Option<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
}

/// How a stopped container becomes an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSpec {
    pub tag: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    /// Default command of the committed image.
    pub cmd: Vec<String>,
    pub user: Option<String>,
    /// Reset the entrypoint inherited from the container's image.
    pub clear_entrypoint: bool,
}

/// Operations a build needs from a container engine.
///
/// Implementations are synchronous; streaming operations take or return
/// plain readers so callers can wire them to pipes and threads.
pub trait ContainerEngine: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Inspect a local image; `Ok(None)` if it is not present.
    fn inspect_image(&self, image: &str) -> Result<Option<ImageInfo>, RuntimeError>;

    /// Pull `image` from its registry, presenting `auth` when given.
    fn pull(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<ImageInfo, RuntimeError>;

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError>;

    /// Upload a tar stream into the container, extracting it at `dest`.
    fn copy_in(
        &self,
        id: &ContainerId,
        archive: &mut dyn Read,
        dest: &str,
    ) -> Result<(), RuntimeError>;

    fn start(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Combined stdout/stderr of a started container, until it exits.
    fn attach_output(&self, id: &ContainerId) -> Result<Box<dyn Read + Send>, RuntimeError>;

    /// Block until the container exits and return its exit code.
    fn wait(&self, id: &ContainerId) -> Result<i64, RuntimeError>;

    fn stop(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    fn commit(&self, id: &ContainerId, spec: &CommitSpec) -> Result<ImageId, RuntimeError>;

    fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Build an image from a tar build context holding a recipe at its root.
    fn build_image(&self, tag: &str, context: &mut dyn Read) -> Result<ImageId, RuntimeError>;

    /// Tar stream of `path` inside the container, rooted at its last
    /// component.
    fn extract_path(
        &self,
        id: &ContainerId,
        path: &str,
    ) -> Result<Box<dyn Read + Send>, RuntimeError>;
}

pub fn select_engine(name: &str) -> Result<Box<dyn ContainerEngine>, RuntimeError> {
    match name {
        "docker" => Ok(Box::new(crate::docker::DockerCli::new())),
        "podman" => Ok(Box::new(crate::docker::DockerCli::with_binary("podman"))),
        "mock" => Ok(Box::new(crate::mock::MockEngine::permissive())),
        other => Err(RuntimeError::EngineUnavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_engines() {
        assert_eq!(select_engine("docker").unwrap().name(), "docker");
        assert_eq!(select_engine("podman").unwrap().name(), "podman");
        assert_eq!(select_engine("mock").unwrap().name(), "mock");
    }

    #[test]
    fn select_invalid_engine_fails() {
        assert!(matches!(
            select_engine("containerd"),
            Err(RuntimeError::EngineUnavailable(_))
        ));
    }

    #[test]
    fn empty_label_is_absent() {
        let mut info = ImageInfo::default();
        info.labels.insert("a".to_owned(), String::new());
        info.labels.insert("b".to_owned(), "x".to_owned());
        assert_eq!(info.label("a"), None);
        assert_eq!(info.label("b"), Some("x"));
    }
}
