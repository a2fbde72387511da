use crate::RuntimeError;
use kiln_schema::SourceInfo;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

const URL_SCHEMES: &[&str] = &["http://", "https://", "git://", "ssh://", "file://"];

/// Whether `source` names a repository to clone rather than a local path.
///
/// URLs with a known scheme qualify, as do scp-like `user@host:path`
/// specifications.
pub fn is_remote_source(source: &str) -> bool {
    if URL_SCHEMES.iter().any(|s| source.starts_with(s)) {
        return true;
    }
    let Some((user_host, path)) = source.split_once(':') else {
        return false;
    };
    let Some((user, host)) = user_host.split_once('@') else {
        return false;
    };
    !user.is_empty()
        && !host.is_empty()
        && !path.is_empty()
        && !user_host.contains('/')
        && !path.starts_with("//")
}

/// Version-control operations a build needs to acquire source.
pub trait SourceControl: Send + Sync {
    fn is_remote(&self, source: &str) -> bool {
        is_remote_source(source)
    }

    /// Whether `dir` is the root of a working copy with history.
    fn is_repository(&self, dir: &Path) -> bool;

    fn clone_repo(&self, source: &str, dest: &Path, recursive: bool) -> Result<(), RuntimeError>;

    fn checkout(&self, repo: &Path, git_ref: &str) -> Result<(), RuntimeError>;

    /// Provenance of the checked-out revision.
    fn describe(&self, repo: &Path) -> Result<SourceInfo, RuntimeError>;
}

/// Version control through the `git` command line.
#[derive(Debug, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    fn run(
        &self,
        op: &'static str,
        dir: Option<&Path>,
        args: &[&str],
    ) -> Result<String, RuntimeError> {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        debug!("git {}", args.join(" "));
        let output = cmd
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(RuntimeError::Vcs {
                op,
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl SourceControl for GitCli {
    fn is_repository(&self, dir: &Path) -> bool {
        dir.join(".git").exists()
            && self
                .run("rev-parse", Some(dir), &["rev-parse", "--verify", "HEAD"])
                .is_ok()
    }

    fn clone_repo(&self, source: &str, dest: &Path, recursive: bool) -> Result<(), RuntimeError> {
        let dest_str = dest.to_string_lossy();
        let mut args = vec!["clone", "--quiet"];
        if recursive {
            args.push("--recurse-submodules");
        }
        args.push(source);
        args.push(&dest_str);
        self.run("clone", None, &args)?;
        Ok(())
    }

    fn checkout(&self, repo: &Path, git_ref: &str) -> Result<(), RuntimeError> {
        self.run("checkout", Some(repo), &["checkout", "--quiet", git_ref])?;
        if repo.join(".gitmodules").exists() {
            self.run(
                "submodule update",
                Some(repo),
                &["submodule", "update", "--init", "--recursive"],
            )?;
        }
        Ok(())
    }

    fn describe(&self, repo: &Path) -> Result<SourceInfo, RuntimeError> {
        let raw = self.run(
            "log",
            Some(repo),
            &["log", "-1", "--format=%H%x00%an%x00%ae%x00%cn%x00%ce%x00%cD%x00%B"],
        )?;
        let mut info = parse_log_record(&raw);
        info.git_ref = self
            .run("rev-parse", Some(repo), &["rev-parse", "--abbrev-ref", "HEAD"])
            .map(|s| s.trim().to_owned())
            .unwrap_or_default();
        info.location = self
            .run(
                "config",
                Some(repo),
                &["config", "--get", "remote.origin.url"],
            )
            .map(|s| s.trim().to_owned())
            .unwrap_or_default();
        Ok(info)
    }
}

/// Parse a NUL-separated `git log` record: id, author name and email,
/// committer name and email, date, message.
fn parse_log_record(raw: &str) -> SourceInfo {
    let mut fields = raw.splitn(7, '\0');
    let mut next = || fields.next().unwrap_or_default().trim().to_owned();
    let mut info = SourceInfo {
        commit_id: next(),
        author_name: next(),
        author_email: next(),
        committer_name: next(),
        committer_email: next(),
        date: next(),
        ..SourceInfo::default()
    };
    let message = next();
    info.set_message(&message);
    info
}
