use super::{check_prereqs, engine_name, make_builder, parse_pairs, report};
use clap::Args;
use kiln_core::CancelToken;
use kiln_schema::{BuildRequest, PullPolicy, RegistryAuth};
use std::path::PathBuf;

#[derive(Debug, Default, Args)]
pub struct UsageArgs {
    /// Builder image whose usage script to run.
    pub image: String,
    /// Location of the lifecycle scripts (http(s)://, file:// or image://).
    #[arg(long)]
    pub scripts_url: Option<String>,
    /// When to pull the builder image: always, never or if-not-present.
    #[arg(long)]
    pub pull_policy: Option<String>,
    /// Engine client configuration directory holding pull credentials.
    #[arg(long, value_name = "DIR")]
    pub pull_config: Option<PathBuf>,
    /// User the container runs as.
    #[arg(long)]
    pub assemble_user: Option<String>,
    /// Environment variable, KEY=VALUE (repeatable).
    #[arg(short, long = "env")]
    pub env: Vec<String>,
}

impl UsageArgs {
    pub fn to_request(&self, quiet: bool) -> Result<BuildRequest, String> {
        let mut req = BuildRequest::new(String::new(), self.image.clone(), String::new());
        if let Some(v) = &self.pull_policy {
            req.builder_pull_policy = v
                .parse::<PullPolicy>()
                .map_err(|e| format!("configuration error: {e}"))?;
        }
        req.builder_pull_auth = self.pull_config.as_ref().map(RegistryAuth::with_config_dir);
        req.scripts_url.clone_from(&self.scripts_url);
        req.assemble_user.clone_from(&self.assemble_user);
        req.environment = parse_pairs(&self.env, "--env")?;
        req.quiet = quiet;
        Ok(req)
    }
}

pub fn run(args: &UsageArgs, cancel: CancelToken, quiet: bool, json: bool) -> Result<u8, String> {
    let request = args.to_request(quiet)?;
    let engine = engine_name();
    check_prereqs(&engine, false)?;
    let builder = make_builder(&engine, cancel)?;
    report(
        &format!("usage of {}", request.builder_image),
        builder.usage(&request),
        json,
    )
}
