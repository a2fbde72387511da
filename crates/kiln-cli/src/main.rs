mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::build::BuildArgs;
use commands::usage::UsageArgs;
use commands::{EXIT_CONFIG_ERROR, EXIT_ENGINE_ERROR, EXIT_FAILURE};
use kiln_core::{install_signal_handler, CancelToken};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Build runnable container images from application source and a builder image"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    /// Only log warnings and errors; script output is demoted to debug.
    #[arg(short, long, default_value_t = false, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build an image from application source.
    Build(BuildArgs),
    /// Show the usage script output of a builder image.
    Usage(UsageArgs),
    /// Run diagnostic checks on the host.
    Doctor {
        /// Directory where working directories are created.
        #[arg(long)]
        work_dir: Option<PathBuf>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let cancel = CancelToken::new();
    install_signal_handler(cancel.clone());

    let json_output = cli.json;
    let result = match cli.command {
        Commands::Build(args) => commands::build::run(&args, cancel, cli.quiet, json_output),
        Commands::Usage(args) => commands::usage::run(&args, cancel, cli.quiet, json_output),
        Commands::Doctor { work_dir } => {
            commands::doctor::run(&work_dir.unwrap_or_else(std::env::temp_dir), json_output)
        }
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("configuration error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("engine error:") || msg.starts_with("missing prerequisites")
            {
                EXIT_ENGINE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
