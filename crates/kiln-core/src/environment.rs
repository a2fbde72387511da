use crate::CoreError;
use kiln_schema::BuildRequest;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Environment file inside the application source.
pub const ENVIRONMENT_FILE: &str = ".kiln/environment";

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped;
/// malformed lines are skipped with a warning.
pub fn parse_environment(text: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                vars.insert(key.trim().to_owned(), value.to_owned());
            }
            _ => warn!("{ENVIRONMENT_FILE}:{}: ignoring malformed line", n + 1),
        }
    }
    vars
}

/// Environment for build containers: the source tree's environment file
/// overlaid with the request's variables.
pub fn build_environment(
    request: &BuildRequest,
    source_dir: &Path,
) -> Result<BTreeMap<String, String>, CoreError> {
    let path = source_dir.join(ENVIRONMENT_FILE);
    let mut vars = match std::fs::read_to_string(&path) {
        Ok(text) => {
            debug!("loading environment from {}", path.display());
            parse_environment(&text)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => return Err(e.into()),
    };
    vars.extend(request.environment.clone());
    Ok(vars)
}
