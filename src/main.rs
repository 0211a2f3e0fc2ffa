use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cosmos_apply::config::Settings;
use cosmos_apply::{apply_directives, check_problems_in_worker, parse_response};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "cosmos-apply",
    about = "Parse, type-check, and commit AI edit directives",
    version
)]
struct Args {
    /// Log level (off, error, warn, info, debug, trace). Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the directives found in a response
    Parse {
        /// File holding the response, or `-` for stdin
        response: String,
    },
    /// Type-check the project as it would look with the response applied
    Check {
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// File holding the response, or `-` for stdin
        #[arg(default_value = "-")]
        response: String,
        /// Print a fix-it prompt instead of JSON
        #[arg(long)]
        prompt: bool,
    },
    /// Apply the response to the project and commit it
    Apply {
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// File holding the response, or `-` for stdin
        response: String,
        /// Commit summary; defaults to the response's chat summary
        #[arg(long)]
        summary: Option<String>,
    },
    /// Show the effective settings for a project
    Config {
        #[arg(long, default_value = ".")]
        project: PathBuf,
    },
}

fn init_logging(log_level: Option<&str>, json_logs: bool) {
    let filter = match log_level {
        Some(level) => match level.to_lowercase().as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => EnvFilter::new(level),
            "warning" => EnvFilter::new("warn"),
            _ => {
                eprintln!("Warning: Invalid log level '{}', using 'warn'", level);
                EnvFilter::new("warn")
            }
        },
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json_logs {
        builder.json().with_current_span(false).init();
    } else {
        builder.with_target(false).compact().init();
    }
}

fn read_response(source: &str) -> Result<String> {
    if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read response from stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(source).with_context(|| format!("Failed to read response file {}", source))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn project_root(project: &Path) -> Result<PathBuf> {
    project
        .canonicalize()
        .with_context(|| format!("Project directory {} does not exist", project.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref(), args.json_logs);

    match args.command {
        Commands::Parse { response } => {
            let raw = read_response(&response)?;
            print_json(&parse_response(&raw))?;
        }
        Commands::Check {
            project,
            response,
            prompt,
        } => {
            let root = project_root(&project)?;
            let parsed = parse_response(&read_response(&response)?);
            let report = check_problems_in_worker(root, parsed.directives)
                .await
                .context("Type check failed")?;
            if prompt {
                if report.is_empty() {
                    println!("No TypeScript errors.");
                } else {
                    println!("{}", report.to_fix_prompt());
                }
            } else {
                print_json(&report)?;
            }
            if !report.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Apply {
            project,
            response,
            summary,
        } => {
            let root = project_root(&project)?;
            let raw = read_response(&response)?;
            // Git, subprocesses, and the blocking HTTP client all stay off
            // the async workers.
            let outcome = tokio::task::spawn_blocking(move || {
                apply_directives(&root, &raw, summary.as_deref())
            })
            .await
            .context("Apply worker failed")?
            .context("Apply failed")?;
            print_json(&outcome)?;
        }
        Commands::Config { project } => {
            let root = project_root(&project)?;
            let (settings, source) = Settings::load_with_source(&root);
            print_json(&serde_json::json!({ "source": source, "settings": settings }))?;
        }
    }

    Ok(())
}
