use crate::copy::remove_dir;
use crate::FsError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const UPLOAD_DIR: &str = "upload";

/// Directory layout of a single build's working tree.
///
/// Everything a build stages on the host lives under this root: the acquired
/// source, resolved scripts, and artifacts from a previous image. Nothing is
/// written outside it.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a fresh, uniquely named working tree under `base`.
    ///
    /// `seed` is mixed into the directory name so concurrent builds of
    /// different requests never collide.
    pub fn create_unique(base: &Path, seed: &str) -> Result<Self, FsError> {
        fs::create_dir_all(base)?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let digest = blake3::hash(format!("{seed}:{}:{nanos}", std::process::id()).as_bytes());
        let name = format!("kiln-{}", &digest.to_hex()[..16]);
        let root = base.join(name);
        match fs::create_dir(&root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(FsError::AlreadyExists(root.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        let tree = Self { root };
        tree.initialize()?;
        Ok(tree)
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Short identifier derived from the directory name.
    pub fn id(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().trim_start_matches("kiln-").to_owned())
            .unwrap_or_default()
    }

    #[inline]
    pub fn upload_dir(&self) -> PathBuf {
        self.root.join(UPLOAD_DIR)
    }

    /// Final location of the application source.
    #[inline]
    pub fn source_dir(&self) -> PathBuf {
        self.upload_dir().join("src")
    }

    /// Scratch checkout used while extracting a context directory.
    #[inline]
    pub fn scratch_dir(&self) -> PathBuf {
        self.upload_dir().join("tmp")
    }

    #[inline]
    pub fn scripts_dir(&self) -> PathBuf {
        self.upload_dir().join("scripts")
    }

    /// Artifacts extracted from the previous output image.
    #[inline]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.upload_dir().join("artifacts")
    }

    pub fn initialize(&self) -> Result<(), FsError> {
        fs::create_dir_all(self.upload_dir())?;
        fs::create_dir_all(self.scripts_dir())?;
        Ok(())
    }

    /// Empty `upload/` and lay it out again. Used when an existing directory
    /// is reused, so nothing staged by an earlier build gets uploaded.
    pub fn reset(&self) -> Result<(), FsError> {
        remove_dir(&self.upload_dir())?;
        self.initialize()
    }
}
