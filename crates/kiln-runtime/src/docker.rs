use crate::engine::{CommitSpec, ContainerEngine, ContainerSpec, ImageInfo};
use crate::RuntimeError;
use kiln_schema::{ContainerId, ImageId, RegistryAuth};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::debug;

/// Container engine driven through the `docker` command line.
///
/// Any CLI that is argument-compatible with docker (podman) works.
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_owned(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectOutput {
    id: String,
    #[serde(default)]
    config: Option<InspectConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    user: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Run to completion and return trimmed stdout.
    fn run(&self, op: &'static str, args: &[&str]) -> Result<String, RuntimeError> {
        debug!("{} {}", self.binary, args.join(" "));
        let output = self.command().args(args).stdin(Stdio::null()).output()?;
        if !output.status.success() {
            return Err(RuntimeError::engine(
                op,
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    /// Run with `input` streamed to stdin. Output goes to an unlinked
    /// temporary file so a chatty child can never block on a full pipe.
    fn run_with_input(
        &self,
        op: &'static str,
        args: &[&str],
        input: &mut dyn Read,
    ) -> Result<String, RuntimeError> {
        debug!("{} {} < stream", self.binary, args.join(" "));
        let mut log = tempfile::tempfile()?;
        let mut child = self
            .command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(log.try_clone()?)
            .stderr(log.try_clone()?)
            .spawn()?;

        let copied = match child.stdin.take() {
            Some(mut stdin) => io::copy(input, &mut stdin).map(|_| ()),
            None => Err(io::Error::other("child stdin unavailable")),
        };
        if let Err(e) = copied {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RuntimeError::engine(op, format!("streaming input: {e}")));
        }

        let status = child.wait()?;
        let mut text = String::new();
        log.seek(SeekFrom::Start(0))?;
        log.read_to_string(&mut text)?;
        if !status.success() {
            return Err(RuntimeError::engine(op, text.trim().to_owned()));
        }
        Ok(text)
    }

    fn spawn_reader(&self, args: &[&str]) -> Result<Box<dyn Read + Send>, RuntimeError> {
        debug!("{} {} | stream", self.binary, args.join(" "));
        let mut child = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout unavailable"))?;
        Ok(Box::new(ChildReader {
            child,
            stdout,
            checked: false,
        }))
    }
}

/// Client configuration a single pull runs with.
enum PullConfig<'a> {
    Default,
    Existing(&'a Path),
    /// Logged in for this pull only; deleted on drop.
    Session(tempfile::TempDir),
}

impl PullConfig<'_> {
    fn dir(&self) -> Option<&Path> {
        match self {
            Self::Default => None,
            Self::Existing(dir) => Some(dir),
            Self::Session(dir) => Some(dir.path()),
        }
    }
}

impl DockerCli {
    /// Podman keeps credentials in a per-command auth file rather than a
    /// client configuration directory.
    fn uses_authfile(&self) -> bool {
        Path::new(&self.binary)
            .file_name()
            .is_some_and(|name| name == "podman")
    }

    /// Arguments of `subcommand` run against the credentials in `dir`.
    fn with_config(&self, dir: Option<&Path>, subcommand: &str, rest: &[&str]) -> Vec<String> {
        let mut args = Vec::new();
        match dir {
            Some(dir) if self.uses_authfile() => {
                let authfile: PathBuf = dir.join("config.json");
                args.push(subcommand.to_owned());
                args.extend(["--authfile".to_owned(), authfile.to_string_lossy().into_owned()]);
            }
            Some(dir) => {
                args.extend(["--config".to_owned(), dir.to_string_lossy().into_owned()]);
                args.push(subcommand.to_owned());
            }
            None => args.push(subcommand.to_owned()),
        }
        args.extend(rest.iter().map(|a| (*a).to_owned()));
        args
    }

    fn pull_config<'a>(
        &self,
        auth: Option<&'a RegistryAuth>,
    ) -> Result<PullConfig<'a>, RuntimeError> {
        let Some(auth) = auth else {
            return Ok(PullConfig::Default);
        };
        if !auth.has_credentials() {
            return Ok(auth
                .config_dir
                .as_deref()
                .map_or(PullConfig::Default, PullConfig::Existing));
        }

        let session = tempfile::tempdir()?;
        let mut rest = vec!["--username", auth.username.as_str(), "--password-stdin"];
        if !auth.server.is_empty() {
            rest.push(auth.server.as_str());
        }
        let args = self.with_config(Some(session.path()), "login", &rest);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let mut password = auth.password.as_bytes();
        self.run_with_input("registry login", &refs, &mut password)?;
        Ok(PullConfig::Session(session))
    }
}

/// Stdout of a child process. EOF is only reported once the child has
/// exited successfully.
struct ChildReader {
    child: Child,
    stdout: ChildStdout,
    checked: bool,
}

impl Read for ChildReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.checked {
            self.checked = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::other(format!("stream process exited with {status}")));
            }
        }
        Ok(n)
    }
}

impl Drop for ChildReader {
    fn drop(&mut self) {
        if !self.checked {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn is_missing(err: &RuntimeError) -> bool {
    match err {
        RuntimeError::Engine { message, .. } => {
            let msg = message.to_lowercase();
            msg.contains("no such image") || msg.contains("no such object")
        }
        _ => false,
    }
}

fn instruction_json(words: &[String]) -> Result<String, RuntimeError> {
    Ok(serde_json::to_string(words)?)
}

impl ContainerEngine for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    fn available(&self) -> bool {
        self.command()
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn inspect_image(&self, image: &str) -> Result<Option<ImageInfo>, RuntimeError> {
        let raw = match self.run("inspect", &["image", "inspect", "--format", "{{json .}}", image])
        {
            Ok(raw) => raw,
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        let parsed: InspectOutput = serde_json::from_str(&raw)?;
        let (user, labels) = match parsed.config {
            Some(c) => (c.user, c.labels.unwrap_or_default()),
            None => (String::new(), BTreeMap::new()),
        };
        Ok(Some(ImageInfo {
            id: ImageId::new(parsed.id),
            user,
            labels,
        }))
    }

    fn pull(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<ImageInfo, RuntimeError> {
        let config = self.pull_config(auth)?;
        let args = self.with_config(config.dir(), "pull", &["--quiet", image]);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run("pull", &refs)?;
        self.inspect_image(image)?
            .ok_or_else(|| RuntimeError::ImageNotFound(image.to_owned()))
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        let mut args: Vec<String> = vec!["create".to_owned()];
        if let Some(user) = &spec.user {
            args.extend(["--user".to_owned(), user.clone()]);
        }
        if let Some(network) = &spec.network {
            args.extend(["--network".to_owned(), network.clone()]);
        }
        if let Some(dir) = &spec.working_dir {
            args.extend(["--workdir".to_owned(), dir.clone()]);
        }
        for (k, v) in &spec.env {
            args.extend(["--env".to_owned(), format!("{k}={v}")]);
        }
        let (entrypoint, rest) = match spec.command.split_first() {
            Some((first, rest)) => (Some(first), rest),
            None => (None, &[] as &[String]),
        };
        if let Some(ep) = entrypoint {
            args.extend(["--entrypoint".to_owned(), ep.clone()]);
        }
        args.push(spec.image.clone());
        args.extend(rest.iter().cloned());

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run("create container", &refs)?;
        Ok(ContainerId::new(id))
    }

    fn copy_in(
        &self,
        id: &ContainerId,
        archive: &mut dyn Read,
        dest: &str,
    ) -> Result<(), RuntimeError> {
        let target = format!("{}:{dest}", id.as_str());
        self.run_with_input("copy into container", &["cp", "-", &target], archive)?;
        Ok(())
    }

    fn start(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.run("start container", &["start", id.as_str()])?;
        Ok(())
    }

    fn attach_output(&self, id: &ContainerId) -> Result<Box<dyn Read + Send>, RuntimeError> {
        // `logs --follow` replays from the start, so nothing printed before
        // the attach is lost. stderr is folded into the same stream.
        let binary = self.binary.clone();
        debug!("{binary} logs --follow {}", id.as_str());
        let mut child = Command::new("sh")
            .args([
                "-c",
                "exec \"$0\" logs --follow \"$1\" 2>&1",
                &binary,
                id.as_str(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout unavailable"))?;
        Ok(Box::new(ChildReader {
            child,
            stdout,
            checked: false,
        }))
    }

    fn wait(&self, id: &ContainerId) -> Result<i64, RuntimeError> {
        let out = self.run("wait for container", &["wait", id.as_str()])?;
        out.lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| RuntimeError::engine("wait for container", format!("bad exit code {out:?}")))
    }

    fn stop(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.run("stop container", &["stop", "--time", "10", id.as_str()])?;
        Ok(())
    }

    fn commit(&self, id: &ContainerId, spec: &CommitSpec) -> Result<ImageId, RuntimeError> {
        let mut changes = Vec::new();
        for (k, v) in &spec.labels {
            changes.push(format!(
                "LABEL {}={}",
                serde_json::to_string(k)?,
                serde_json::to_string(v)?
            ));
        }
        for (k, v) in &spec.env {
            changes.push(format!("ENV {k}={}", serde_json::to_string(v)?));
        }
        if let Some(user) = &spec.user {
            changes.push(format!("USER {user}"));
        }
        if spec.clear_entrypoint {
            changes.push("ENTRYPOINT []".to_owned());
        }
        if !spec.cmd.is_empty() {
            changes.push(format!("CMD {}", instruction_json(&spec.cmd)?));
        }

        let mut args: Vec<String> = vec!["commit".to_owned()];
        for change in changes {
            args.extend(["--change".to_owned(), change]);
        }
        args.push(id.as_str().to_owned());
        if !spec.tag.is_empty() {
            args.push(spec.tag.clone());
        }
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let image = self.run("commit", &refs)?;
        Ok(ImageId::new(image))
    }

    fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.run("remove container", &["rm", "--force", "--volumes", id.as_str()])?;
        Ok(())
    }

    fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.run("remove image", &["image", "rm", image])?;
        Ok(())
    }

    fn build_image(&self, tag: &str, context: &mut dyn Read) -> Result<ImageId, RuntimeError> {
        let iid = tempfile::NamedTempFile::new()?;
        let iid_path = iid.path().to_string_lossy().into_owned();
        self.run_with_input(
            "build image",
            &["build", "--tag", tag, "--iidfile", &iid_path, "-"],
            context,
        )?;
        let id = std::fs::read_to_string(iid.path())?;
        Ok(ImageId::new(id.trim()))
    }

    fn extract_path(
        &self,
        id: &ContainerId,
        path: &str,
    ) -> Result<Box<dyn Read + Send>, RuntimeError> {
        let source = format!("{}:{path}", id.as_str());
        self.spawn_reader(&["cp", &source, "-"])
    }
}
