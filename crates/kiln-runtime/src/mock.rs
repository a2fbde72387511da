//! In-memory engine and version control for tests and dry runs.
//!
//! The mock keeps a flat file map per image and container, so data copied
//! into a container, committed, and extracted again round-trips the way it
//! would with a real engine. Scripts are never executed; exit codes are
//! configured per script name.

use crate::engine::{CommitSpec, ContainerEngine, ContainerSpec, ImageInfo};
use crate::git::SourceControl;
use crate::RuntimeError;
use kiln_schema::{
    ContainerId, ImageId, RegistryAuth, SourceInfo, DEFAULT_SCRIPTS_URL, SCRIPTS_URL_LABEL,
};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockImage {
    pub id: ImageId,
    pub user: String,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub cmd: Vec<String>,
    /// Absolute path to content.
    pub files: BTreeMap<String, Vec<u8>>,
}

impl MockImage {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_user(mut self, user: &str) -> Self {
        self.user = user.to_owned();
        self
    }

    #[must_use]
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_owned(), value.to_owned());
        self
    }

    #[must_use]
    pub fn with_file(mut self, path: &str, content: &[u8]) -> Self {
        self.files.insert(path.to_owned(), content.to_vec());
        self
    }

    /// A builder image carrying its scripts at the conventional location.
    pub fn builder() -> Self {
        let dir = DEFAULT_SCRIPTS_URL.trim_start_matches("image://");
        Self::new()
            .with_user("1001")
            .with_label(SCRIPTS_URL_LABEL, DEFAULT_SCRIPTS_URL)
            .with_file(&format!("{dir}/assemble"), b"#!/bin/sh\n")
            .with_file(&format!("{dir}/run"), b"#!/bin/sh\n")
    }
}

#[derive(Debug)]
struct MockContainer {
    spec: ContainerSpec,
    base: MockImage,
    files: BTreeMap<String, Vec<u8>>,
    started: bool,
}

#[derive(Debug, Default)]
struct EngineState {
    local: BTreeMap<String, MockImage>,
    remote: BTreeMap<String, MockImage>,
    containers: BTreeMap<String, MockContainer>,
    calls: Vec<String>,
    recipes: Vec<String>,
    failing: BTreeSet<String>,
    exit_codes: BTreeMap<String, i64>,
    output: Option<Vec<u8>>,
    counter: u64,
    pull_anything: bool,
    pull_auths: Vec<(String, Option<RegistryAuth>)>,
    blocking: BTreeSet<String>,
    extract_archive: Option<Vec<u8>>,
}

impl EngineState {
    fn next_id(&mut self, kind: &str) -> String {
        self.counter += 1;
        blake3::hash(format!("mock-{kind}:{}", self.counter).as_bytes())
            .to_hex()
            .to_string()
    }

    fn check(&mut self, op: &'static str, call: String) -> Result<(), RuntimeError> {
        self.calls.push(call);
        if self.failing.contains(op) {
            return Err(RuntimeError::engine(op, "injected failure"));
        }
        Ok(())
    }

    fn container(&mut self, id: &ContainerId) -> Result<&mut MockContainer, RuntimeError> {
        self.containers
            .get_mut(id.as_str())
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
    }

    fn insert_image(&mut self, reference: &str, image: MockImage) {
        self.local.insert(image.id.to_string(), image.clone());
        if !reference.is_empty() {
            self.local.insert(reference.to_owned(), image);
        }
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// In-memory [`ContainerEngine`].
pub struct MockEngine {
    state: Mutex<EngineState>,
    copy_in_hook: Option<Hook>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            copy_in_hook: None,
        }
    }
}

fn lock(state: &Mutex<EngineState>) -> Result<MutexGuard<'_, EngineState>, RuntimeError> {
    state
        .lock()
        .map_err(|e| RuntimeError::engine("lock", format!("mutex poisoned: {e}")))
}

impl MockEngine {
    /// An engine whose registry holds only images registered with
    /// [`MockEngine::with_remote_image`].
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine that can pull any reference, yielding a builder image
    /// with scripts at the conventional location.
    pub fn permissive() -> Self {
        let engine = Self::new();
        if let Ok(mut s) = engine.state.lock() {
            s.pull_anything = true;
        }
        engine
    }

    fn mutate(self, f: impl FnOnce(&mut EngineState)) -> Self {
        if let Ok(mut s) = self.state.lock() {
            f(&mut s);
        }
        self
    }

    #[must_use]
    pub fn with_local_image(self, reference: &str, mut image: MockImage) -> Self {
        self.mutate(|s| {
            if image.id.is_empty() {
                image.id = ImageId::new(format!("sha256:{}", s.next_id("image")));
            }
            s.insert_image(reference, image);
        })
    }

    #[must_use]
    pub fn with_remote_image(self, reference: &str, mut image: MockImage) -> Self {
        self.mutate(|s| {
            if image.id.is_empty() {
                image.id = ImageId::new(format!("sha256:{}", s.next_id("image")));
            }
            s.remote.insert(reference.to_owned(), image);
        })
    }

    /// Make every call of `op` fail.
    #[must_use]
    pub fn fail_on(self, op: &str) -> Self {
        self.mutate(|s| {
            s.failing.insert(op.to_owned());
        })
    }

    /// Exit code of containers whose command is the script `name`.
    #[must_use]
    pub fn with_exit_code(self, name: &str, code: i64) -> Self {
        self.mutate(|s| {
            s.exit_codes.insert(name.to_owned(), code);
        })
    }

    /// Containers running the script `name` keep running until stopped.
    /// Waiting on a stopped one yields 137.
    #[must_use]
    pub fn with_blocking_script(self, name: &str) -> Self {
        self.mutate(|s| {
            s.blocking.insert(name.to_owned());
        })
    }

    /// Run `hook` during every `copy_in`, once the first archive entry has
    /// been received.
    #[must_use]
    pub fn with_copy_in_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.copy_in_hook = Some(Box::new(hook));
        self
    }

    /// Serve `archive` verbatim from every `extract_path`.
    #[must_use]
    pub fn with_extract_archive(self, archive: Vec<u8>) -> Self {
        self.mutate(|s| s.extract_archive = Some(archive))
    }

    #[must_use]
    pub fn with_output(self, output: &str) -> Self {
        self.mutate(|s| s.output = Some(output.as_bytes().to_vec()))
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(op))
            .count()
    }

    /// Every pull with the credentials it was given, in order.
    pub fn pull_auths(&self) -> Vec<(String, Option<RegistryAuth>)> {
        self.state
            .lock()
            .map(|s| s.pull_auths.clone())
            .unwrap_or_default()
    }

    /// Containers created and not yet removed.
    pub fn live_containers(&self) -> usize {
        self.state.lock().map(|s| s.containers.len()).unwrap_or(0)
    }

    pub fn image(&self, reference: &str) -> Option<MockImage> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.local.get(reference).cloned())
    }

    /// Recipes passed to [`ContainerEngine::build_image`], in order.
    pub fn recipes(&self) -> Vec<String> {
        self.state.lock().map(|s| s.recipes.clone()).unwrap_or_default()
    }
}

fn script_name(command: &[String]) -> String {
    command
        .first()
        .and_then(|c| c.rsplit('/').next())
        .unwrap_or_default()
        .to_owned()
}

fn join_path(dir: &str, rel: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let rel = rel.trim_start_matches("./").trim_start_matches('/');
    format!("{dir}/{rel}")
}

/// Regular files of a tar stream as (relative path, content).
fn read_tar_files(
    archive: &mut dyn Read,
    after_first: Option<&Hook>,
) -> Result<Vec<(String, Vec<u8>)>, RuntimeError> {
    let mut ar = tar::Archive::new(archive);
    let mut files = Vec::new();
    for (index, entry) in ar.entries()?.enumerate() {
        let mut entry = entry?;
        if index == 0 {
            if let Some(hook) = after_first {
                hook();
            }
        }
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        files.push((path, content));
    }
    // Drain trailing padding so a streaming producer is never left blocked.
    std::io::copy(&mut ar.into_inner(), &mut std::io::sink())?;
    Ok(files)
}

fn recipe_copy_dest(recipe: &str) -> Option<String> {
    recipe.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("COPY ")?;
        let mut words = rest.split_whitespace();
        (words.next()? == "upload/").then(|| words.next().map(str::to_owned))?
    })
}

fn recipe_base(recipe: &str) -> Option<String> {
    recipe.lines().find_map(|line| {
        line.trim()
            .strip_prefix("FROM ")
            .map(|base| base.trim().to_owned())
    })
}

fn image_info(image: &MockImage) -> ImageInfo {
    ImageInfo {
        id: image.id.clone(),
        user: image.user.clone(),
        labels: image.labels.clone(),
    }
}

impl ContainerEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn inspect_image(&self, image: &str) -> Result<Option<ImageInfo>, RuntimeError> {
        let mut s = lock(&self.state)?;
        s.check("inspect", format!("inspect {image}"))?;
        Ok(s.local.get(image).map(image_info))
    }

    fn pull(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<ImageInfo, RuntimeError> {
        let mut s = lock(&self.state)?;
        s.pull_auths.push((image.to_owned(), auth.cloned()));
        s.check("pull", format!("pull {image}"))?;
        let pulled = match s.remote.get(image).cloned() {
            Some(found) => found,
            None if s.pull_anything => {
                let mut built = MockImage::builder();
                built.id = ImageId::new(format!("sha256:{}", s.next_id("image")));
                s.remote.insert(image.to_owned(), built.clone());
                built
            }
            None => return Err(RuntimeError::ImageNotFound(image.to_owned())),
        };
        s.insert_image(image, pulled.clone());
        Ok(image_info(&pulled))
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        let mut s = lock(&self.state)?;
        s.check(
            "create",
            format!("create {} {}", spec.image, spec.command.join(" ")),
        )?;
        let base = s
            .local
            .get(&spec.image)
            .cloned()
            .ok_or_else(|| RuntimeError::ImageNotFound(spec.image.clone()))?;
        let id = s.next_id("container");
        s.containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                files: base.files.clone(),
                base,
                started: false,
            },
        );
        Ok(ContainerId::new(id))
    }

    fn copy_in(
        &self,
        id: &ContainerId,
        archive: &mut dyn Read,
        dest: &str,
    ) -> Result<(), RuntimeError> {
        {
            let mut s = lock(&self.state)?;
            s.check("copy_in", format!("copy_in {} {dest}", id.short()))?;
            s.container(id)?;
        }
        // Read without holding the lock; the producer may be slow.
        let files = read_tar_files(archive, self.copy_in_hook.as_ref())?;
        let mut s = lock(&self.state)?;
        let container = s.container(id)?;
        for (rel, content) in files {
            container.files.insert(join_path(dest, &rel), content);
        }
        Ok(())
    }

    fn start(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let mut s = lock(&self.state)?;
        s.check("start", format!("start {}", id.short()))?;
        s.container(id)?.started = true;
        Ok(())
    }

    fn attach_output(&self, id: &ContainerId) -> Result<Box<dyn Read + Send>, RuntimeError> {
        let mut s = lock(&self.state)?;
        s.check("attach", format!("attach {}", id.short()))?;
        let configured = s.output.clone();
        let container = s.container(id)?;
        let output = configured.unwrap_or_else(|| {
            format!("---> running {}\n", container.spec.command.join(" ")).into_bytes()
        });
        Ok(Box::new(Cursor::new(output)))
    }

    fn wait(&self, id: &ContainerId) -> Result<i64, RuntimeError> {
        {
            let mut s = lock(&self.state)?;
            s.check("wait", format!("wait {}", id.short()))?;
            let container = s.container(id)?;
            if !container.started {
                return Err(RuntimeError::engine("wait", "container was never started"));
            }
            let name = script_name(&container.spec.command);
            if !s.blocking.contains(&name) {
                return Ok(s.exit_codes.get(&name).copied().unwrap_or(0));
            }
        }
        // Poll without the lock so `stop` can get through.
        loop {
            std::thread::sleep(Duration::from_millis(20));
            let mut s = lock(&self.state)?;
            if !s.container(id)?.started {
                return Ok(137);
            }
        }
    }

    fn stop(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let mut s = lock(&self.state)?;
        s.check("stop", format!("stop {}", id.short()))?;
        s.container(id)?.started = false;
        Ok(())
    }

    fn commit(&self, id: &ContainerId, spec: &CommitSpec) -> Result<ImageId, RuntimeError> {
        let mut s = lock(&self.state)?;
        s.check("commit", format!("commit {} {}", id.short(), spec.tag))?;
        let container = s.container(id)?;
        let mut image = MockImage {
            files: container.files.clone(),
            ..container.base.clone()
        };
        image.labels.extend(spec.labels.clone());
        image.env.extend(spec.env.clone());
        if let Some(user) = &spec.user {
            image.user.clone_from(user);
        }
        if !spec.cmd.is_empty() {
            image.cmd.clone_from(&spec.cmd);
        }
        image.id = ImageId::new(format!("sha256:{}", s.next_id("image")));
        let image_id = image.id.clone();
        s.insert_image(&spec.tag, image);
        Ok(image_id)
    }

    fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let mut s = lock(&self.state)?;
        s.check("remove_container", format!("remove_container {}", id.short()))?;
        s.containers
            .remove(id.as_str())
            .map(|_| ())
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
    }

    fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut s = lock(&self.state)?;
        s.check("remove_image", format!("remove_image {image}"))?;
        let target = s
            .local
            .get(image)
            .map(|i| i.id.clone())
            .ok_or_else(|| RuntimeError::ImageNotFound(image.to_owned()))?;
        s.local.retain(|_, i| i.id != target);
        Ok(())
    }

    fn build_image(&self, tag: &str, context: &mut dyn Read) -> Result<ImageId, RuntimeError> {
        {
            let mut s = lock(&self.state)?;
            s.check("build", format!("build {tag}"))?;
        }
        let files = read_tar_files(context, None)?;
        let recipe = files
            .iter()
            .find(|(path, _)| path == kiln_fs::RECIPE_FILE)
            .map(|(_, content)| String::from_utf8_lossy(content).into_owned())
            .ok_or_else(|| RuntimeError::engine("build", "context has no recipe"))?;
        let base_ref =
            recipe_base(&recipe).ok_or_else(|| RuntimeError::engine("build", "recipe has no FROM"))?;
        let dest = recipe_copy_dest(&recipe).unwrap_or_else(|| "/".to_owned());

        let mut s = lock(&self.state)?;
        s.recipes.push(recipe);
        let mut image = s
            .local
            .get(&base_ref)
            .cloned()
            .ok_or_else(|| RuntimeError::ImageNotFound(base_ref.clone()))?;
        for (path, content) in files {
            if let Some(rel) = path.strip_prefix("upload/") {
                image.files.insert(join_path(&dest, rel), content);
            }
        }
        image.id = ImageId::new(format!("sha256:{}", s.next_id("image")));
        let image_id = image.id.clone();
        s.insert_image(tag, image);
        Ok(image_id)
    }

    fn extract_path(
        &self,
        id: &ContainerId,
        path: &str,
    ) -> Result<Box<dyn Read + Send>, RuntimeError> {
        let mut s = lock(&self.state)?;
        s.check("extract", format!("extract {} {path}", id.short()))?;
        if let Some(archive) = s.extract_archive.clone() {
            s.container(id)?;
            return Ok(Box::new(Cursor::new(archive)));
        }
        let container = s.container(id)?;
        let root = path.trim_end_matches('/');
        let prefix = format!("{root}/");
        let leaf = root.rsplit('/').next().unwrap_or_default();

        let matching: Vec<(&String, &Vec<u8>)> = container
            .files
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix))
            .collect();
        if matching.is_empty() {
            return Err(RuntimeError::engine(
                "extract",
                format!("could not find {path} in container"),
            ));
        }

        let mut ar = tar::Builder::new(Vec::new());
        for (p, content) in matching {
            let rel = &p[prefix.len()..];
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(content.len() as u64);
            header.set_cksum();
            ar.append_data(&mut header, format!("{leaf}/{rel}"), content.as_slice())?;
        }
        Ok(Box::new(Cursor::new(ar.into_inner()?)))
    }
}

#[derive(Debug, Clone)]
struct MockRepo {
    content: PathBuf,
    refs: BTreeSet<String>,
    info: SourceInfo,
}

#[derive(Debug, Default)]
struct VcsState {
    repos: BTreeMap<String, MockRepo>,
    clones: BTreeMap<PathBuf, String>,
    calls: Vec<String>,
}

/// In-memory [`SourceControl`]: "cloning" copies a registered directory.
#[derive(Debug, Default)]
pub struct MockSourceControl {
    state: Mutex<VcsState>,
}

impl MockSourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `url` as a repository whose tree is `content`. The
    /// repository knows the refs `HEAD`, `master`, `main`, and the commit id
    /// from `info`.
    #[must_use]
    pub fn with_repo(self, url: &str, content: impl Into<PathBuf>, info: SourceInfo) -> Self {
        let mut refs: BTreeSet<String> = ["HEAD", "master", "main"]
            .iter()
            .map(|r| (*r).to_owned())
            .collect();
        if !info.commit_id.is_empty() {
            refs.insert(info.commit_id.clone());
        }
        if let Ok(mut s) = self.state.lock() {
            s.repos.insert(
                url.to_owned(),
                MockRepo {
                    content: content.into(),
                    refs,
                    info,
                },
            );
        }
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, VcsState>, RuntimeError> {
        self.state.lock().map_err(|e| RuntimeError::Vcs {
            op: "lock",
            message: format!("mutex poisoned: {e}"),
        })
    }

    fn repo_for(state: &VcsState, dir: &Path) -> Option<MockRepo> {
        let url = state.clones.get(dir)?;
        state.repos.get(url).cloned()
    }
}

impl SourceControl for MockSourceControl {
    fn is_repository(&self, dir: &Path) -> bool {
        dir.join(".git").is_dir()
    }

    fn clone_repo(&self, source: &str, dest: &Path, recursive: bool) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        s.calls
            .push(format!("clone {source} recursive={recursive}"));
        let repo = s.repos.get(source).cloned().ok_or_else(|| RuntimeError::Vcs {
            op: "clone",
            message: format!("repository '{source}' not found"),
        })?;
        kiln_fs::copy_contents(&repo.content, dest)?;
        std::fs::create_dir_all(dest.join(".git"))?;
        s.clones.insert(dest.to_path_buf(), source.to_owned());
        Ok(())
    }

    fn checkout(&self, repo: &Path, git_ref: &str) -> Result<(), RuntimeError> {
        let mut s = self.lock()?;
        s.calls.push(format!("checkout {git_ref}"));
        let known = Self::repo_for(&s, repo).is_some_and(|r| r.refs.contains(git_ref));
        if !known {
            return Err(RuntimeError::Vcs {
                op: "checkout",
                message: format!("pathspec '{git_ref}' did not match any known ref"),
            });
        }
        let url = s.clones.get(repo).cloned().unwrap_or_default();
        if let Some(r) = s.repos.get_mut(&url) {
            r.info.git_ref = git_ref.to_owned();
        }
        Ok(())
    }

    fn describe(&self, repo: &Path) -> Result<SourceInfo, RuntimeError> {
        let mut s = self.lock()?;
        s.calls.push("describe".to_owned());
        Ok(Self::repo_for(&s, repo)
            .map(|r| {
                let mut info = r.info;
                if info.git_ref.is_empty() {
                    info.git_ref = "master".to_owned();
                }
                if let Some(url) = s.clones.get(repo) {
                    info.location.clone_from(url);
                }
                info
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tar_of(files: &[(&str, &str)]) -> Vec<u8> {
        let mut ar = tar::Builder::new(Vec::new());
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            ar.append_data(&mut header, path, content.as_bytes()).unwrap();
        }
        ar.into_inner().unwrap()
    }

    #[test]
    fn strict_pull_needs_registered_image() {
        let engine = MockEngine::new().with_remote_image("ruby:3", MockImage::builder());
        assert!(engine.pull("ruby:3", None).is_ok());
        assert!(engine.inspect_image("ruby:3").unwrap().is_some());
        assert!(matches!(
            engine.pull("python:3", None),
            Err(RuntimeError::ImageNotFound(_))
        ));
    }

    #[test]
    fn permissive_pull_yields_builder() {
        let engine = MockEngine::permissive();
        let info = engine.pull("anything:latest", None).unwrap();
        assert_eq!(info.label(SCRIPTS_URL_LABEL), Some(DEFAULT_SCRIPTS_URL));
        assert_eq!(info.user, "1001");
    }

    #[test]
    fn copy_commit_extract_roundtrip() {
        let engine = MockEngine::new().with_local_image("base", MockImage::new());
        let id = engine
            .create_container(&ContainerSpec {
                image: "base".to_owned(),
                command: vec!["/tmp/scripts/assemble".to_owned()],
                ..ContainerSpec::default()
            })
            .unwrap();
        let data = tar_of(&[("artifacts/cache/a.jar", "jar"), ("src/main", "code")]);
        engine.copy_in(&id, &mut data.as_slice(), "/tmp").unwrap();
        engine.start(&id).unwrap();
        assert_eq!(engine.wait(&id).unwrap(), 0);
        engine
            .commit(
                &id,
                &CommitSpec {
                    tag: "app:latest".to_owned(),
                    ..CommitSpec::default()
                },
            )
            .unwrap();
        engine.remove_container(&id).unwrap();

        let image = engine.image("app:latest").unwrap();
        assert_eq!(image.files["/tmp/src/main"], b"code");

        let id = engine
            .create_container(&ContainerSpec {
                image: "app:latest".to_owned(),
                ..ContainerSpec::default()
            })
            .unwrap();
        let mut reader = engine.extract_path(&id, "/tmp/artifacts").unwrap();
        let mut ar = tar::Archive::new(&mut reader);
        let names: Vec<String> = ar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["artifacts/cache/a.jar".to_owned()]);
    }

    #[test]
    fn exit_code_is_per_script() {
        let engine = MockEngine::new()
            .with_local_image("base", MockImage::new())
            .with_exit_code("assemble", 2);
        let id = engine
            .create_container(&ContainerSpec {
                image: "base".to_owned(),
                command: vec!["/tmp/scripts/assemble".to_owned()],
                ..ContainerSpec::default()
            })
            .unwrap();
        engine.start(&id).unwrap();
        assert_eq!(engine.wait(&id).unwrap(), 2);
    }

    #[test]
    fn injected_failure_is_reported() {
        let engine = MockEngine::permissive().fail_on("pull");
        assert!(engine.pull("ruby", None).is_err());
        assert_eq!(engine.count_calls("pull"), 1);
    }

    #[test]
    fn pulls_record_credentials() {
        let engine = MockEngine::permissive();
        let auth = RegistryAuth::with_credentials("ci", "secret");
        engine.pull("private/ruby", Some(&auth)).unwrap();
        engine.pull("public/ruby", None).unwrap();
        assert_eq!(
            engine.pull_auths(),
            vec![
                ("private/ruby".to_owned(), Some(auth)),
                ("public/ruby".to_owned(), None),
            ]
        );
    }

    fn started(engine: &MockEngine, script: &str) -> ContainerId {
        let id = engine
            .create_container(&ContainerSpec {
                image: "base".to_owned(),
                command: vec![format!("/tmp/scripts/{script}")],
                ..ContainerSpec::default()
            })
            .unwrap();
        engine.start(&id).unwrap();
        id
    }

    #[test]
    fn blocking_script_waits_until_stopped() {
        let engine = MockEngine::new()
            .with_local_image("base", MockImage::new())
            .with_blocking_script("assemble");
        let id = started(&engine, "assemble");
        let code = std::thread::scope(|scope| {
            let waiter = scope.spawn(|| engine.wait(&id));
            std::thread::sleep(Duration::from_millis(100));
            assert!(!waiter.is_finished());
            engine.stop(&id).unwrap();
            waiter.join().unwrap()
        });
        assert_eq!(code.unwrap(), 137);
    }

    #[test]
    fn copy_in_hook_runs_mid_stream() {
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = std::sync::Arc::clone(&seen);
        let engine = MockEngine::new()
            .with_local_image("base", MockImage::new())
            .with_copy_in_hook(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        let id = started(&engine, "assemble");
        let data = tar_of(&[("src/a", "a"), ("src/b", "b")]);
        engine.copy_in(&id, &mut data.as_slice(), "/tmp").unwrap();
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn extract_archive_override_is_served_verbatim() {
        let data = tar_of(&[("artifacts/cache.jar", "x")]);
        let engine = MockEngine::new()
            .with_local_image("base", MockImage::new())
            .with_extract_archive(data.clone());
        let id = started(&engine, "save-artifacts");
        let mut served = Vec::new();
        engine
            .extract_path(&id, "/tmp/artifacts")
            .unwrap()
            .read_to_end(&mut served)
            .unwrap();
        assert_eq!(served, data);
    }

    #[test]
    fn build_image_applies_recipe_copy() {
        let engine = MockEngine::new().with_local_image("ruby-onbuild", MockImage::builder());
        let mut ar = tar::Builder::new(Vec::new());
        let recipe = "FROM ruby-onbuild\nCOPY upload/ /opt/app/\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(recipe.len() as u64);
        header.set_cksum();
        ar.append_data(&mut header, "Dockerfile", recipe.as_bytes())
            .unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(1);
        header.set_cksum();
        ar.append_data(&mut header, "upload/src/x", &b"x"[..]).unwrap();
        let data = ar.into_inner().unwrap();

        engine.build_image("layered", &mut data.as_slice()).unwrap();
        let image = engine.image("layered").unwrap();
        assert!(image.files.contains_key("/opt/app/src/x"));
        assert_eq!(engine.recipes(), vec![recipe.to_owned()]);
    }

    #[test]
    fn mock_git_clones_registered_repo() {
        let content = tempfile::tempdir().unwrap();
        std::fs::write(content.path().join("Gemfile"), "gem").unwrap();
        let info = SourceInfo {
            commit_id: "abc123".to_owned(),
            ..SourceInfo::default()
        };
        let vcs = MockSourceControl::new().with_repo("https://example.com/app.git", content.path(), info);

        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("src");
        vcs.clone_repo("https://example.com/app.git", &target, true)
            .unwrap();
        assert!(target.join("Gemfile").exists());
        assert!(vcs.is_repository(&target));
        vcs.checkout(&target, "abc123").unwrap();
        assert!(vcs.checkout(&target, "nope").is_err());

        let described = vcs.describe(&target).unwrap();
        assert_eq!(described.commit_id, "abc123");
        assert_eq!(described.git_ref, "abc123");
        assert_eq!(described.location, "https://example.com/app.git");
    }

    #[test]
    fn mock_git_unknown_repo_fails() {
        let dest = tempfile::tempdir().unwrap();
        let err = MockSourceControl::new()
            .clone_repo("https://example.com/none.git", &dest.path().join("s"), false)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Vcs { op: "clone", .. }));
    }
}
