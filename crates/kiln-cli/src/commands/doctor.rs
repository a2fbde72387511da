use super::{engine_name, EXIT_FAILURE, EXIT_SUCCESS};
use std::path::Path;

pub fn run(work_dir: &Path, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let engine = engine_name();
    checks.push(Check::info("engine", &format!("Container engine: {engine}")));
    check_prereqs(&engine, &mut checks, &mut all_pass);

    if work_dir.is_dir() {
        checks.push(Check::pass(
            "work_dir",
            &format!("Working directory base {} exists", work_dir.display()),
        ));
        check_disk_space(work_dir, &mut checks, &mut all_pass);
    } else {
        checks.push(Check::info(
            "work_dir",
            &format!(
                "Working directory base {} does not exist (will be created on first build)",
                work_dir.display()
            ),
        ));
    }

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(engine: &str, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = kiln_runtime::check_engine_prereqs(engine, true);
    if missing.is_empty() {
        checks.push(Check::pass("prereqs", "Build prerequisites satisfied"));
    } else {
        *all_pass = false;
        for m in &missing {
            checks.push(Check::fail(
                "prereqs",
                &format!("Missing {}: {} (install: {})", m.name, m.purpose, m.install_hint),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Kiln Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

/// Free space under `path` in MiB.
fn available_mb(path: &Path) -> Option<u64> {
    let c_path = std::ffi::CString::new(path.to_string_lossy().as_bytes()).ok()?;

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: statvfs with a valid, NUL-terminated path and a zeroed output
    // struct is well-defined; the struct is only read when ret == 0.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    let avail_bytes = stat.f_bavail as u64 * stat.f_frsize as u64;
    Some(avail_bytes / (1024 * 1024))
}

fn check_disk_space(path: &Path, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let Some(avail_mb) = available_mb(path) else {
        checks.push(Check::warn(
            "disk_space",
            &format!("Cannot determine free space of {}", path.display()),
        ));
        return;
    };

    if avail_mb < 100 {
        *all_pass = false;
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space: {avail_mb} MB available"),
        ));
    } else if avail_mb < 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Disk space: {avail_mb} MB available (sources and artifacts are staged here)"),
        ));
    } else {
        let free_gb = avail_mb / 1024;
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {free_gb} GB available"),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_space_of_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(available_mb(dir.path()).is_some());
    }

    #[test]
    fn missing_dir_has_no_space_reading() {
        assert!(available_mb(Path::new("/nonexistent/kiln-doctor")).is_none());
    }
}
