use super::{
    check_prereqs, engine_name, make_builder, parse_pairs, report, spin_fail, spin_ok, spinner,
};
use clap::Args;
use kiln_core::CancelToken;
use kiln_runtime::is_remote_source;
use kiln_schema::{
    parse_request_file, BuildRequest, NetworkMode, PullPolicy, RangeList, RegistryAuth,
};
use std::path::PathBuf;

#[derive(Debug, Default, Args)]
pub struct BuildArgs {
    /// Source repository URL or local directory.
    pub source: Option<String>,
    /// Builder image.
    pub image: Option<String>,
    /// Tag for the output image.
    pub tag: Option<String>,

    /// Read the build request from a TOML file; flags override its values.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Branch, tag or commit to check out.
    #[arg(long = "ref")]
    pub git_ref: Option<String>,
    /// Subdirectory of the source to build.
    #[arg(long)]
    pub context_dir: Option<String>,
    /// Do not clone submodules.
    #[arg(long, default_value_t = false)]
    pub no_recursive: bool,

    /// When to pull the builder image: always, never or if-not-present.
    #[arg(long)]
    pub pull_policy: Option<String>,
    /// Always pull the builder image.
    #[arg(long, default_value_t = false)]
    pub force_pull: bool,
    /// Engine client configuration directory holding credentials for
    /// pulling the builder image.
    #[arg(long, value_name = "DIR")]
    pub pull_config: Option<PathBuf>,
    #[arg(long)]
    pub builder_image_version: Option<String>,
    #[arg(long)]
    pub builder_base_image_version: Option<String>,

    /// Reuse artifacts from the previous image with the same tag.
    #[arg(long, default_value_t = false)]
    pub incremental: bool,
    /// When to pull the previous image in incremental builds.
    #[arg(long)]
    pub incremental_pull_policy: Option<String>,
    /// Engine client configuration directory holding credentials for
    /// pulling the previous image.
    #[arg(long, value_name = "DIR")]
    pub incremental_pull_config: Option<PathBuf>,
    /// Remove the previous image after a successful incremental build.
    #[arg(long = "rm", default_value_t = false)]
    pub remove_previous_image: bool,
    /// Bake source and scripts into an intermediate image first.
    #[arg(long, default_value_t = false)]
    pub layered: bool,

    /// UID ranges the build may run as, e.g. "1-,0-0" or "100-200".
    #[arg(long)]
    pub allowed_uids: Option<String>,
    /// User the build container runs as.
    #[arg(long)]
    pub assemble_user: Option<String>,
    /// Network of the build container: host, bridge, container:<id> or a
    /// network name.
    #[arg(long)]
    pub network: Option<String>,
    /// Environment variable for the build, KEY=VALUE (repeatable).
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Label for the output image, KEY=VALUE (repeatable). An empty value
    /// removes a generated label.
    #[arg(short, long = "label")]
    pub labels: Vec<String>,
    #[arg(long)]
    pub label_namespace: Option<String>,
    #[arg(long)]
    pub display_name: Option<String>,
    #[arg(long)]
    pub description: Option<String>,

    /// Location of the lifecycle scripts (http(s)://, file:// or image://).
    #[arg(long)]
    pub scripts_url: Option<String>,
    /// Directory inside the container that receives source and scripts.
    #[arg(long)]
    pub destination: Option<String>,

    /// Working directory to use instead of a temporary one.
    #[arg(long)]
    pub working_dir: Option<PathBuf>,
    /// Keep the working directory after the build.
    #[arg(long, default_value_t = false)]
    pub keep_working_dir: bool,
    /// URL that receives a JSON summary when the build finishes.
    #[arg(long)]
    pub callback_url: Option<String>,
}

fn config_error(e: impl std::fmt::Display) -> String {
    format!("configuration error: {e}")
}

impl BuildArgs {
    /// Assemble the request: the config file if given, then every flag on
    /// top of it.
    pub fn to_request(&self, quiet: bool) -> Result<BuildRequest, String> {
        let mut req = match &self.config {
            Some(path) => parse_request_file(path).map_err(config_error)?,
            None => BuildRequest::new(String::new(), String::new(), String::new()),
        };

        if let Some(v) = &self.source {
            req.source.clone_from(v);
        }
        if let Some(v) = &self.image {
            req.builder_image.clone_from(v);
        }
        if let Some(v) = &self.tag {
            req.tag.clone_from(v);
        }
        if let Some(v) = &self.git_ref {
            req.git_ref.clone_from(v);
        }
        if let Some(v) = &self.context_dir {
            req.context_dir.clone_from(v);
        }
        req.no_recursive |= self.no_recursive;

        if let Some(v) = &self.pull_policy {
            req.builder_pull_policy = v.parse::<PullPolicy>().map_err(config_error)?;
        }
        req.force_pull |= self.force_pull;
        if let Some(dir) = &self.pull_config {
            req.builder_pull_auth = Some(RegistryAuth::with_config_dir(dir));
        }
        if self.builder_image_version.is_some() {
            req.builder_image_version.clone_from(&self.builder_image_version);
        }
        if self.builder_base_image_version.is_some() {
            req.builder_base_image_version
                .clone_from(&self.builder_base_image_version);
        }

        req.incremental |= self.incremental;
        if let Some(v) = &self.incremental_pull_policy {
            req.previous_image_pull_policy = v.parse::<PullPolicy>().map_err(config_error)?;
        }
        if let Some(dir) = &self.incremental_pull_config {
            req.previous_image_pull_auth = Some(RegistryAuth::with_config_dir(dir));
        }
        req.remove_previous_image |= self.remove_previous_image;
        req.layered |= self.layered;

        if let Some(v) = &self.allowed_uids {
            req.allowed_uids = v.parse::<RangeList>().map_err(config_error)?;
        }
        if self.assemble_user.is_some() {
            req.assemble_user.clone_from(&self.assemble_user);
        }
        if let Some(v) = &self.network {
            req.network_mode = v.parse::<NetworkMode>().map_err(config_error)?;
        }
        req.environment.extend(parse_pairs(&self.env, "--env")?);
        req.labels.extend(parse_pairs(&self.labels, "--label")?);
        if let Some(v) = &self.label_namespace {
            req.label_namespace.clone_from(v);
        }
        if self.display_name.is_some() {
            req.display_name.clone_from(&self.display_name);
        }
        if self.description.is_some() {
            req.description.clone_from(&self.description);
        }

        if self.scripts_url.is_some() {
            req.scripts_url.clone_from(&self.scripts_url);
        }
        if let Some(v) = &self.destination {
            req.destination.clone_from(v);
        }
        if self.working_dir.is_some() {
            req.working_dir.clone_from(&self.working_dir);
        }
        req.preserve_working_dir |= self.keep_working_dir;
        if self.callback_url.is_some() {
            req.callback_url.clone_from(&self.callback_url);
        }
        req.quiet |= quiet;

        req.check_required().map_err(config_error)?;
        Ok(req)
    }
}

pub fn run(args: &BuildArgs, cancel: CancelToken, quiet: bool, json: bool) -> Result<u8, String> {
    let request = args.to_request(quiet)?;
    let engine = engine_name();
    check_prereqs(&engine, is_remote_source(&request.source))?;
    let builder = make_builder(&engine, cancel)?;

    let pb = (quiet && !json).then(|| spinner(&format!("building {}...", request.tag)));
    let outcome = builder.run(&request);
    if let Some(pb) = &pb {
        match &outcome {
            Ok(_) => spin_ok(pb, &format!("built {}", request.tag)),
            Err(_) => spin_fail(pb, &format!("build of {} failed", request.tag)),
        }
    }
    report(&format!("build of {}", request.tag), outcome, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(source: &str, image: &str, tag: &str) -> BuildArgs {
        BuildArgs {
            source: Some(source.to_owned()),
            image: Some(image.to_owned()),
            tag: Some(tag.to_owned()),
            ..BuildArgs::default()
        }
    }

    #[test]
    fn positionals_fill_required_fields() {
        let req = args("./app", "ruby:3.1", "app:latest").to_request(false).unwrap();
        assert_eq!(req.source, "./app");
        assert_eq!(req.builder_image, "ruby:3.1");
        assert_eq!(req.tag, "app:latest");
        assert!(!req.quiet);
    }

    #[test]
    fn missing_tag_is_configuration_error() {
        let mut a = args("./app", "ruby:3.1", "");
        a.tag = None;
        let err = a.to_request(false).unwrap_err();
        assert!(err.starts_with("configuration error:"));
        assert!(err.contains("tag"));
    }

    #[test]
    fn flags_are_parsed_into_request() {
        let mut a = args("./app", "ruby:3.1", "app:latest");
        a.pull_policy = Some("never".to_owned());
        a.allowed_uids = Some("100-200".to_owned());
        a.network = Some("host".to_owned());
        a.env = vec!["RACK_ENV=production".to_owned()];
        a.labels = vec!["team=web".to_owned()];
        a.keep_working_dir = true;
        let req = a.to_request(true).unwrap();
        assert_eq!(req.builder_pull_policy, PullPolicy::Never);
        assert!(req.allowed_uids.contains(150));
        assert_eq!(req.network_mode, NetworkMode::Host);
        assert_eq!(req.environment["RACK_ENV"], "production");
        assert_eq!(req.labels["team"], "web");
        assert!(req.preserve_working_dir);
        assert!(req.quiet);
    }

    #[test]
    fn pull_config_flags_become_registry_auth() {
        let mut a = args("./app", "ruby:3.1", "app:latest");
        a.pull_config = Some(PathBuf::from("/home/ci/.docker"));
        a.incremental_pull_config = Some(PathBuf::from("/etc/kiln/registry"));
        let req = a.to_request(false).unwrap();
        assert_eq!(
            req.builder_pull_auth,
            Some(RegistryAuth::with_config_dir("/home/ci/.docker"))
        );
        assert_eq!(
            req.previous_image_pull_auth,
            Some(RegistryAuth::with_config_dir("/etc/kiln/registry"))
        );
    }

    #[test]
    fn invalid_pull_policy_is_configuration_error() {
        let mut a = args("./app", "ruby:3.1", "app:latest");
        a.pull_policy = Some("sometimes".to_owned());
        assert!(a
            .to_request(false)
            .unwrap_err()
            .starts_with("configuration error:"));
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(
            &path,
            "source = \"./app\"\nbuilder_image = \"ruby:3.1\"\ntag = \"app:v1\"\nincremental = true\n",
        )
        .unwrap();
        let a = BuildArgs {
            config: Some(path),
            tag: Some("app:v2".to_owned()),
            ..BuildArgs::default()
        };
        let req = a.to_request(false).unwrap();
        assert_eq!(req.tag, "app:v2");
        assert_eq!(req.builder_image, "ruby:3.1");
        assert!(req.incremental);
    }

    #[test]
    fn unreadable_config_is_configuration_error() {
        let a = BuildArgs {
            config: Some(PathBuf::from("/nonexistent/kiln.toml")),
            ..BuildArgs::default()
        };
        assert!(a
            .to_request(false)
            .unwrap_err()
            .starts_with("configuration error:"));
    }
}
