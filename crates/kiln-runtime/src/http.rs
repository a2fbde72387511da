use crate::RuntimeError;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::debug;

/// Download `url` to `dest`.
///
/// Handles `http(s)://` and `file://` URLs. Returns `Ok(false)` when the
/// resource does not exist, so callers can fall through to another source.
pub fn fetch_to(url: &str, dest: &Path) -> Result<bool, RuntimeError> {
    if let Some(path) = url.strip_prefix("file://") {
        return fetch_file(Path::new(path), dest, url);
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(RuntimeError::UnsupportedUrl(url.to_owned()));
    }

    debug!("downloading {url}");
    let agent = ureq::Agent::new_with_defaults();
    let resp = match agent.get(url).call() {
        Ok(r) => r,
        Err(ureq::Error::StatusCode(404)) => return Ok(false),
        Err(e) => return Err(download_error(url, e)),
    };

    let mut reader = resp.into_body().into_reader();
    write_whole(dest, &mut reader, url)?;
    Ok(true)
}

fn fetch_file(path: &Path, dest: &Path, url: &str) -> Result<bool, RuntimeError> {
    if !path.is_file() {
        return Ok(false);
    }
    let mut source = File::open(path).map_err(|e| download_error(url, e))?;
    write_whole(dest, &mut source, url)?;
    Ok(true)
}

/// Stream `reader` into a temporary file next to `dest` and move it into
/// place only once complete. `dest` is untouched on failure.
fn write_whole(dest: &Path, reader: &mut dyn io::Read, url: &str) -> Result<(), RuntimeError> {
    let parent = dest.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut partial = tempfile::NamedTempFile::new_in(parent)?;
    io::copy(reader, &mut partial).map_err(|e| download_error(url, e))?;
    partial
        .persist(dest)
        .map_err(|e| download_error(url, e.error))?;
    Ok(())
}

/// POST a JSON document to `url`.
pub fn post_json(url: &str, body: &serde_json::Value) -> Result<(), RuntimeError> {
    let data = serde_json::to_vec(body)?;
    let agent = ureq::Agent::new_with_defaults();
    agent
        .post(url)
        .header("Content-Type", "application/json")
        .send(data.as_slice())
        .map_err(|e| download_error(url, e))?;
    Ok(())
}

fn download_error(url: &str, e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Download {
        url: url.to_owned(),
        message: e.to_string(),
    }
}
