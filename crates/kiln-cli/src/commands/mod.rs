pub mod build;
pub mod completions;
pub mod doctor;
pub mod man_pages;
pub mod usage;

use indicatif::{ProgressBar, ProgressStyle};
use kiln_core::{BuildFailure, Builder, CancelToken, CoreError};
use kiln_runtime::{check_engine_prereqs, format_missing, select_engine, ContainerEngine, GitCli};
use kiln_schema::BuildResult;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_ENGINE_ERROR: u8 = 3;

const DEFAULT_ENGINE: &str = "docker";

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish_spinner(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish_spinner(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish_spinner(pb, format!("✗ {msg}"));
}

pub fn colorize_status(success: bool) -> String {
    use console::Style;
    if success {
        Style::new().green().apply_to("succeeded").to_string()
    } else {
        Style::new().red().bold().apply_to("failed").to_string()
    }
}

/// Engine backend named by `KILN_ENGINE`.
pub fn engine_name() -> String {
    std::env::var("KILN_ENGINE")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENGINE.to_owned())
}

pub fn check_prereqs(engine: &str, needs_git: bool) -> Result<(), String> {
    if std::env::var("KILN_SKIP_PREREQS").as_deref() == Ok("1") {
        return Ok(());
    }
    let missing = check_engine_prereqs(engine, needs_git);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format_missing(&missing))
    }
}

pub fn make_builder(engine: &str, cancel: CancelToken) -> Result<Builder, String> {
    let engine: Arc<dyn ContainerEngine> =
        Arc::from(select_engine(engine).map_err(|e| format!("engine error: {e}"))?);
    Ok(Builder::new(engine, Arc::new(GitCli::new())).with_cancel_token(cancel))
}

/// Parse repeated `KEY=VALUE` arguments of `flag`.
pub fn parse_pairs(values: &[String], flag: &str) -> Result<BTreeMap<String, String>, String> {
    values
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_owned(), value.to_owned()))
            }
            _ => Err(format!(
                "configuration error: invalid {flag} value {pair:?}, expected KEY=VALUE"
            )),
        })
        .collect()
}

pub fn exit_code_for(error: &CoreError) -> u8 {
    match error.kind() {
        "configuration" => EXIT_CONFIG_ERROR,
        "engine" => EXIT_ENGINE_ERROR,
        _ => EXIT_FAILURE,
    }
}

/// Messages of a failed build other than the error itself.
fn warnings<'a>(messages: &'a [String], error: &CoreError) -> impl Iterator<Item = &'a String> {
    let error = error.to_string();
    messages.iter().filter(move |m| **m != error)
}

/// Print a build outcome and return the process exit code.
pub fn report(
    what: &str,
    outcome: Result<BuildResult, BuildFailure>,
    json: bool,
) -> Result<u8, String> {
    let (result, error) = match outcome {
        Ok(result) => (result, None),
        Err(BuildFailure { error, result }) => (result, Some(error)),
    };
    let code = error.as_ref().map_or(EXIT_SUCCESS, exit_code_for);

    if json {
        let payload = serde_json::json!({
            "success": result.success,
            "imageId": result.image_id,
            "workingDir": result.working_dir,
            "messages": result.messages,
            "error": error.as_ref().map(|e| serde_json::json!({
                "kind": e.kind(),
                "message": e.to_string(),
            })),
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(code);
    }

    match &error {
        None => {
            for message in &result.messages {
                eprintln!("warning: {message}");
            }
            println!("{what} {}", colorize_status(true));
            if let Some(id) = &result.image_id {
                println!("image: {id}");
            }
        }
        Some(e) => {
            for message in warnings(&result.messages, e) {
                eprintln!("warning: {message}");
            }
            println!("{what} {}", colorize_status(false));
            eprintln!("error: {e}");
            if let CoreError::AssembleFailed { output, .. } = e {
                if !output.is_empty() {
                    eprintln!("\nlast output:\n{output}");
                }
            }
        }
    }
    Ok(code)
}
