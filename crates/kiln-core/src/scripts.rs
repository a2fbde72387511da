//! Lifecycle script resolution.
//!
//! Each script is looked up in strict precedence order: the request's
//! `scripts_url`, the source tree's `.kiln/bin`, then the builder image's
//! embedded scripts. The first location that yields the script wins and
//! the others are not consulted.

use crate::CoreError;
use kiln_fs::{install_file, WorkingTree};
use kiln_runtime::{http, ImageInfo};
use kiln_schema::{BuildRequest, DEFAULT_SCRIPTS_URL, SCRIPTS_URL_LABEL};
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Script directory inside the application source.
pub const SOURCE_SCRIPTS_DIR: &str = ".kiln/bin";

const IMAGE_SCHEME: &str = "image://";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScriptName {
    Assemble,
    Run,
    SaveArtifacts,
    Usage,
}

impl ScriptName {
    pub const ALL: [Self; 4] = [Self::Assemble, Self::Run, Self::SaveArtifacts, Self::Usage];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Assemble => "assemble",
            Self::Run => "run",
            Self::SaveArtifacts => "save-artifacts",
            Self::Usage => "usage",
        }
    }
}

impl fmt::Display for ScriptName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOrigin {
    /// Downloaded or copied from `scripts_url` (or a URL image label).
    ExternalUrl(String),
    /// Copied from the source tree's script directory.
    SourceRepo,
    /// Already present in the builder image, in this directory.
    Image(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedScript {
    pub name: ScriptName,
    pub origin: ScriptOrigin,
    /// Path in the working tree's script staging directory, when staged.
    pub staged: Option<PathBuf>,
    /// Whether resolving the script fetched it over the network.
    pub downloaded: bool,
}

impl ResolvedScript {
    /// Short word for where the script came from, as shown in the log.
    pub fn provenance(&self) -> &'static str {
        match self.origin {
            ScriptOrigin::ExternalUrl(_) if self.downloaded => "downloaded",
            ScriptOrigin::ExternalUrl(_) => "copied",
            ScriptOrigin::SourceRepo => "source",
            ScriptOrigin::Image(_) => "image",
        }
    }

    /// Absolute path of the script inside a build container.
    pub fn container_path(&self, destination: &str) -> String {
        match &self.origin {
            ScriptOrigin::Image(dir) => format!("{}/{}", dir.trim_end_matches('/'), self.name),
            _ => format!(
                "{}/scripts/{}",
                destination.trim_end_matches('/'),
                self.name
            ),
        }
    }
}

/// Resolved lifecycle scripts, read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptSet {
    scripts: BTreeMap<ScriptName, ResolvedScript>,
}

impl ScriptSet {
    pub fn get(&self, name: ScriptName) -> Option<&ResolvedScript> {
        self.scripts.get(&name)
    }

    pub fn is_resolved(&self, name: ScriptName) -> bool {
        self.scripts.contains_key(&name)
    }

    /// Fail with every missing name when any of `names` is unresolved.
    pub fn require(&self, names: &[ScriptName]) -> Result<(), CoreError> {
        let missing: Vec<String> = names
            .iter()
            .filter(|n| !self.is_resolved(**n))
            .map(|n| n.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ScriptResolution { missing })
        }
    }

    pub fn container_path(&self, name: ScriptName, destination: &str) -> Option<String> {
        self.get(name).map(|s| s.container_path(destination))
    }

    /// Whether any script has to be uploaded rather than found in the image.
    pub fn has_staged(&self) -> bool {
        self.scripts.values().any(|s| s.staged.is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedScript> {
        self.scripts.values()
    }
}

/// Scripts every build of `request` needs.
pub fn required_scripts(request: &BuildRequest) -> Vec<ScriptName> {
    let mut names = vec![ScriptName::Assemble, ScriptName::Run];
    if request.incremental {
        names.push(ScriptName::SaveArtifacts);
    }
    names
}

/// Resolve all four scripts for a build from `builder`.
pub fn resolve(
    request: &BuildRequest,
    tree: &WorkingTree,
    builder: &ImageInfo,
) -> Result<ScriptSet, CoreError> {
    let staging = tree.scripts_dir();
    std::fs::create_dir_all(&staging)?;
    let source_scripts = tree.source_dir().join(SOURCE_SCRIPTS_DIR);
    let image_url = embedded_scripts_url(request, builder);

    let mut set = ScriptSet::default();
    for name in ScriptName::ALL {
        let found = match request.scripts_url.as_deref() {
            Some(url) => from_url(name, url, &staging)?,
            None => None,
        };
        let found = match found {
            Some(s) => Some(s),
            None => from_source(name, &source_scripts, &staging)?,
        };
        let found = match (found, image_url.as_deref()) {
            (Some(s), _) => Some(s),
            (None, Some(url)) => from_url(name, url, &staging)?,
            (None, None) => None,
        };
        match found {
            Some(script) => {
                debug!("{name}: {:?}", script.origin);
                set.scripts.insert(name, script);
            }
            None => debug!("{name}: not found"),
        }
    }
    info!(
        "resolved scripts: {}",
        set.iter()
            .map(|s| format!("{} ({})", s.name, s.provenance()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(set)
}

/// Where the builder image keeps its own scripts. Images without the label
/// are assumed to use the conventional directory unless the request names
/// its own script location.
fn embedded_scripts_url(request: &BuildRequest, builder: &ImageInfo) -> Option<String> {
    match builder.label(SCRIPTS_URL_LABEL) {
        Some(url) => Some(url.to_owned()),
        None if request.scripts_url.is_none() => Some(DEFAULT_SCRIPTS_URL.to_owned()),
        None => None,
    }
}

fn from_url(
    name: ScriptName,
    url: &str,
    staging: &Path,
) -> Result<Option<ResolvedScript>, CoreError> {
    if let Some(dir) = url.strip_prefix(IMAGE_SCHEME) {
        // Embedded scripts cannot be checked without running the image.
        return Ok(Some(ResolvedScript {
            name,
            origin: ScriptOrigin::Image(dir.to_owned()),
            staged: None,
            downloaded: false,
        }));
    }

    let script_url = format!("{}/{}", url.trim_end_matches('/'), name);
    let dest = staging.join(name.as_str());
    match http::fetch_to(&script_url, &dest) {
        Ok(true) => {
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755))?;
            Ok(Some(ResolvedScript {
                name,
                origin: ScriptOrigin::ExternalUrl(script_url.clone()),
                staged: Some(dest),
                downloaded: !script_url.starts_with("file://"),
            }))
        }
        Ok(false) => Ok(None),
        Err(e) => {
            warn!("{name}: {e}");
            Ok(None)
        }
    }
}

fn from_source(
    name: ScriptName,
    source_scripts: &Path,
    staging: &Path,
) -> Result<Option<ResolvedScript>, CoreError> {
    let candidate = source_scripts.join(name.as_str());
    if !candidate.is_file() {
        return Ok(None);
    }
    let dest = staging.join(name.as_str());
    install_file(&candidate, &dest)?;
    Ok(Some(ResolvedScript {
        name,
        origin: ScriptOrigin::SourceRepo,
        staged: Some(dest),
        downloaded: false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup() -> (tempfile::TempDir, WorkingTree) {
        let dir = tempfile::tempdir().unwrap();
        let tree = WorkingTree::new(dir.path().join("work"));
        tree.initialize().unwrap();
        fs::create_dir_all(tree.source_dir()).unwrap();
        (dir, tree)
    }

    fn write_source_script(tree: &WorkingTree, name: &str) {
        let dir = tree.source_dir().join(SOURCE_SCRIPTS_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(name), "#!/bin/sh\necho source\n").unwrap();
    }

    fn external_dir(root: &Path, names: &[&str]) -> String {
        let dir = root.join("external");
        fs::create_dir_all(&dir).unwrap();
        for name in names {
            fs::write(dir.join(name), "#!/bin/sh\necho external\n").unwrap();
        }
        format!("file://{}", dir.display())
    }

    #[test]
    fn image_label_supplies_embedded_scripts() {
        let (_dir, tree) = setup();
        let builder = ImageInfo::default();
        let req = BuildRequest::new("/src", "b", "t");
        let set = resolve(&req, &tree, &builder).unwrap();
        for name in ScriptName::ALL {
            let s = set.get(name).unwrap();
            assert_eq!(s.origin, ScriptOrigin::Image("/usr/libexec/kiln".to_owned()));
        }
        assert_eq!(
            set.container_path(ScriptName::Assemble, "/tmp").unwrap(),
            "/usr/libexec/kiln/assemble"
        );
        assert!(!set.has_staged());
    }

    #[test]
    fn source_scripts_override_image() {
        let (_dir, tree) = setup();
        write_source_script(&tree, "assemble");
        let req = BuildRequest::new("/src", "b", "t");
        let set = resolve(&req, &tree, &ImageInfo::default()).unwrap();

        let assemble = set.get(ScriptName::Assemble).unwrap();
        assert_eq!(assemble.origin, ScriptOrigin::SourceRepo);
        assert!(assemble.staged.is_some());
        assert_eq!(assemble.provenance(), "source");
        let staged = tree.scripts_dir().join("assemble");
        let mode = fs::metadata(&staged).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(
            set.container_path(ScriptName::Assemble, "/tmp").unwrap(),
            "/tmp/scripts/assemble"
        );
        assert!(matches!(
            set.get(ScriptName::Run).unwrap().origin,
            ScriptOrigin::Image(_)
        ));
    }

    #[test]
    fn external_url_wins_over_source() {
        let (dir, tree) = setup();
        write_source_script(&tree, "assemble");
        let mut req = BuildRequest::new("/src", "b", "t");
        req.scripts_url = Some(external_dir(dir.path(), &["assemble"]));
        let set = resolve(&req, &tree, &ImageInfo::default()).unwrap();

        let assemble = set.get(ScriptName::Assemble).unwrap();
        assert!(matches!(assemble.origin, ScriptOrigin::ExternalUrl(_)));
        assert!(!assemble.downloaded);
        assert_eq!(assemble.provenance(), "copied");
        let staged = fs::read_to_string(tree.scripts_dir().join("assemble")).unwrap();
        assert!(staged.contains("external"));
    }

    #[test]
    fn explicit_url_disables_default_image_location() {
        let (dir, tree) = setup();
        let mut req = BuildRequest::new("/src", "b", "t");
        req.scripts_url = Some(external_dir(dir.path(), &["run"]));
        let set = resolve(&req, &tree, &ImageInfo::default()).unwrap();

        assert!(set.is_resolved(ScriptName::Run));
        assert!(!set.is_resolved(ScriptName::Assemble));
        let err = set.require(&required_scripts(&req)).unwrap_err();
        assert!(matches!(
            err,
            CoreError::ScriptResolution { ref missing } if missing == &vec!["assemble".to_owned()]
        ));
    }

    #[test]
    fn image_scheme_url_points_inside_image() {
        let (_dir, tree) = setup();
        let mut req = BuildRequest::new("/src", "b", "t");
        req.scripts_url = Some("image:///opt/scripts".to_owned());
        let set = resolve(&req, &tree, &ImageInfo::default()).unwrap();
        assert_eq!(
            set.container_path(ScriptName::Run, "/tmp").unwrap(),
            "/opt/scripts/run"
        );
    }

    #[test]
    fn incremental_requires_save_artifacts() {
        let mut req = BuildRequest::new("/src", "b", "t");
        assert_eq!(required_scripts(&req).len(), 2);
        req.incremental = true;
        assert!(required_scripts(&req).contains(&ScriptName::SaveArtifacts));
    }
}
