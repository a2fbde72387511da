use std::fmt;
use std::process::{Command, Stdio};

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn daemon_reachable(binary: &str) -> bool {
    Command::new(binary)
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Check prerequisites for building with `engine`. `git` is only
/// required when the source has to be cloned.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_engine_prereqs(engine: &str, needs_git: bool) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    match engine {
        "docker" => {
            if !command_exists("docker") {
                missing.push(MissingPrereq {
                    name: "docker",
                    purpose: "running builder containers",
                    install_hint: "zypper install docker | apt install docker.io | dnf install moby-engine | pacman -S docker",
                });
            } else if !daemon_reachable("docker") {
                missing.push(MissingPrereq {
                    name: "docker daemon",
                    purpose: "running builder containers",
                    install_hint: "start the service (systemctl start docker) and check DOCKER_HOST",
                });
            }
        }
        "podman" => {
            if !command_exists("podman") {
                missing.push(MissingPrereq {
                    name: "podman",
                    purpose: "running builder containers",
                    install_hint: "zypper install podman | apt install podman | dnf install podman | pacman -S podman",
                });
            }
        }
        _ => {}
    }

    if needs_git && !command_exists("git") {
        missing.push(MissingPrereq {
            name: "git",
            purpose: "cloning application sources",
            install_hint: "zypper install git | apt install git | dnf install git | pacman -S git",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nKiln requires these tools to build images.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "git",
            purpose: "cloning sources",
            install_hint: "apt install git",
        };
        let s = format!("{m}");
        assert!(s.contains("git"));
        assert!(s.contains("cloning sources"));
        assert!(s.contains("apt install git"));
    }

    #[test]
    fn mock_engine_has_no_prereqs() {
        assert!(check_engine_prereqs("mock", false).is_empty());
    }

    #[test]
    fn format_missing_produces_readable_output() {
        let items = vec![
            MissingPrereq {
                name: "docker",
                purpose: "containers",
                install_hint: "apt install docker.io",
            },
            MissingPrereq {
                name: "git",
                purpose: "clones",
                install_hint: "apt install git",
            },
        ];
        let output = format_missing(&items);
        assert!(output.contains("missing prerequisites:"));
        assert!(output.contains("docker"));
        assert!(output.contains("git"));
    }
}
