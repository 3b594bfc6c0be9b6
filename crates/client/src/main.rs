//! telbridge
//!
//! Runs commands on a remote shell and prints their output.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use client::config::{Config, ConfigError};
use client::events::TracingSink;
use client::session::{CommandResult, SessionError, SessionManager};
use client::SessionConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// telbridge - run commands on remote line-oriented shells.
///
/// Commands come from `--exec` or, without it, one per line on stdin.
#[derive(Parser, Debug)]
#[command(name = "telbridge")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Remote host
    #[arg(long)]
    pub host: Option<String>,

    /// Remote port [default: 23]
    #[arg(short, long, allow_negative_numbers = true)]
    pub port: Option<i64>,

    /// Connect timeout in milliseconds [default: 2500]
    #[arg(short, long, value_name = "MS", allow_negative_numbers = true)]
    pub timeout: Option<i64>,

    /// Command timeout in milliseconds [default: the connect timeout]
    #[arg(long, value_name = "MS", allow_negative_numbers = true)]
    pub command_timeout: Option<i64>,

    /// Literal shell prompt [default: "/ # "]
    #[arg(long, value_name = "TEXT", conflicts_with = "prompt_regex")]
    pub prompt: Option<String>,

    /// Shell prompt as a regular expression, matched at the end of output
    #[arg(long, value_name = "REGEX")]
    pub prompt_regex: Option<String>,

    /// Command to run; may be repeated. Without it, commands are read from stdin
    #[arg(short, long = "exec", value_name = "CMD")]
    pub exec: Vec<String>,

    /// Print each result as a JSON object
    #[arg(long)]
    pub json: bool,

    /// Open a new session for every command
    #[arg(long)]
    pub no_pool: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            report_error(&e);
            return ExitCode::FAILURE;
        }
    };

    let settings = match config.validate() {
        Ok(settings) => settings,
        Err(e) => {
            report_invalid_config(&e);
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match init_logging(cli.verbose, &config) {
        Ok(guard) => guard,
        Err(e) => {
            report_error(&e);
            return ExitCode::FAILURE;
        }
    };

    tracing::debug!(endpoint = %settings.endpoint(), "telbridge starting");

    let manager = SessionManager::new(TracingSink::shared(), config.pool.enabled && !cli.no_pool);
    let outcome = run(&cli, &manager, &settings).await;
    manager.close_all().await;

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

/// Build the effective configuration: file, then environment, then flags.
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    config.apply_env_overrides()?;
    apply_cli_overrides(cli, &mut config);
    Ok(config)
}

fn apply_cli_overrides(cli: &Cli, config: &mut Config) {
    if let Some(host) = &cli.host {
        config.connection.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if let Some(timeout) = cli.timeout {
        config.connection.timeout_ms = timeout;
    }
    if let Some(command_timeout) = cli.command_timeout {
        config.session.command_timeout_ms = Some(command_timeout);
    }
    if let Some(prompt) = &cli.prompt {
        config.session.prompt = prompt.clone();
        config.session.prompt_regex = None;
    }
    if let Some(pattern) = &cli.prompt_regex {
        config.session.prompt_regex = Some(pattern.clone());
    }
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
}

/// Install the tracing subscriber. Logs go to stderr, and also to
/// `logging.file` when set. `RUST_LOG` overrides the configured level.
fn init_logging(verbose: bool, config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()))
    };

    let (file_layer, guard) = match &config.logging.file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
            std::fs::create_dir_all(directory).with_context(|| {
                format!("Failed to create log directory: {}", directory.display())
            })?;

            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

/// Connect, then run every `--exec` command, or read commands from stdin
/// until EOF.
///
/// Ctrl-C ends the run gracefully. Connection errors end it with an error;
/// other per-command errors are reported and the run continues.
async fn run(cli: &Cli, manager: &SessionManager, settings: &SessionConfig) -> anyhow::Result<()> {
    tokio::select! {
        result = connect(manager, settings) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            return Ok(());
        }
    }

    if !cli.exec.is_empty() {
        for command in &cli.exec {
            tokio::select! {
                result = execute(manager, settings, command, cli.json) => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                    return Ok(());
                }
            }
        }
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read from stdin")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                return Ok(());
            }
        };
        let Some(line) = line else {
            tracing::debug!("End of input");
            return Ok(());
        };

        let command = line.trim_end_matches('\r');
        if command.trim().is_empty() {
            continue;
        }

        tokio::select! {
            result = execute(manager, settings, command, cli.json) => result?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                return Ok(());
            }
        }
    }
}

/// Open a session before any command is read, so an unreachable shell ends
/// the run up front. With pooling the session stays open for the commands.
async fn connect(manager: &SessionManager, settings: &SessionConfig) -> anyhow::Result<()> {
    manager
        .with_session(settings, |_| async { Ok::<_, SessionError>(()) })
        .await
        .with_context(|| format!("Failed to connect to {}", settings.endpoint()))
}

async fn execute(
    manager: &SessionManager,
    settings: &SessionConfig,
    command: &str,
    json: bool,
) -> anyhow::Result<()> {
    let owned = command.to_string();
    let result = manager
        .with_session(settings, |session| async move { session.execute(&owned).await })
        .await;

    match result {
        Ok(result) => {
            println!("{}", render(&result, json)?);
            if result.truncated && !json {
                eprintln!(
                    "warning: no prompt within {}ms, output may be incomplete",
                    settings.command_timeout().as_millis()
                );
            }
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            Err(e).with_context(|| format!("Failed to run command {:?}", command))
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            Ok(())
        }
    }
}

fn render(result: &CommandResult, json: bool) -> anyhow::Result<String> {
    if json {
        serde_json::to_string(result).context("Failed to serialize result")
    } else {
        Ok(result.output_text().into_owned())
    }
}

fn report_error(error: &anyhow::Error) {
    match error.downcast_ref::<ConfigError>() {
        Some(invalid) => report_invalid_config(invalid),
        None => eprintln!("Error: {:#}", error),
    }
}

fn report_invalid_config(error: &ConfigError) {
    eprintln!("Errors encountered whilst validating initialisation config:");
    for violation in error.violations() {
        eprintln!(" - {} @ {}", violation, violation.field());
    }
}
