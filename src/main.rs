//! jsbridge CLI entry point.
//!
//! Evaluates a script file or an expression in a fresh environment with the
//! configured host bindings and prints the completion value as JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jsbridge_common::ConfigFile;
use jsbridge_core::{Engine, Environment};
use jsbridge_host::{Capabilities, HostBindings, install_all, preload};

/// Interval between terminate requests once the timeout has elapsed.
const TERMINATE_RETRY: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(name = "jsbridge")]
#[command(about = "Evaluate JavaScript through the jsbridge embedding layer", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "JSBRIDGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Terminate execution after this many milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// Script to run
        file: PathBuf,
    },

    /// Evaluate an expression
    Eval {
        /// Source text to evaluate
        expression: String,
    },
}

/// An environment with its host bindings installed.
struct Session {
    env: Environment,
    bindings: HostBindings,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => ConfigFile::from_file(path)?,
        None => ConfigFile::default(),
    };
    if let Some(timeout_ms) = cli.timeout_ms {
        config.runtime.execution.timeout_ms = timeout_ms;
    }

    let (source, filename) = match cli.command {
        Commands::Run { file } => {
            let source = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read script '{}'", file.display()))?;
            (source, file.display().to_string())
        }
        Commands::Eval { expression } => (expression, String::new()),
    };

    let preloads = load_preloads(&config).await?;
    let timeout = config.runtime.execution.timeout();

    // Engine operations block, so they stay off the async workers.
    let session = tokio::task::spawn_blocking(move || start_session(&config, &preloads))
        .await
        .context("Session startup task failed")??;

    let outcome = evaluate_with_timeout(&session.env, source, filename, timeout).await;
    print_captured(&session.bindings);
    let value = outcome?;

    println!("{}", serde_json::to_string_pretty(&value)?);

    tokio::task::spawn_blocking(move || close_session(session)).await?;

    Ok(())
}

/// Initialize tracing. Logs go to stderr so that stdout carries only results.
fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info,jsbridge=debug".into()),
    );

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Read every preload script named in the configuration.
async fn load_preloads(config: &ConfigFile) -> anyhow::Result<Vec<(String, String)>> {
    let mut scripts = Vec::with_capacity(config.preload.len());
    for entry in &config.preload {
        let source = tokio::fs::read_to_string(&entry.path)
            .await
            .with_context(|| format!("Failed to read preload script '{}'", entry.path))?;
        scripts.push((entry.path.clone(), source));
    }
    Ok(scripts)
}

/// Create an engine and environment, install host bindings and preloads.
fn start_session(config: &ConfigFile, preloads: &[(String, String)]) -> anyhow::Result<Session> {
    let engine = Engine::new(&config.runtime.engine)?;
    let env = Environment::in_engine(&engine)?;
    let bindings = install_all(&env, &Capabilities::from_config(&config.host))?;
    let preloaded = preload(
        &env,
        preloads
            .iter()
            .map(|(name, source)| (name.as_str(), source.as_str())),
    )?;

    info!(
        engine_id = %engine.id(),
        env_id = %env.id(),
        preloaded,
        "Session ready"
    );
    Ok(Session { env, bindings })
}

/// Evaluate `source`, terminating it once `timeout` elapses.
async fn evaluate_with_timeout(
    env: &Environment,
    source: String,
    filename: String,
    timeout: Option<Duration>,
) -> anyhow::Result<serde_json::Value> {
    let runner = env.clone();
    let mut task = tokio::task::spawn_blocking(move || runner.evaluate(&source, &filename));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(timeout_ms = limit.as_millis(), "Execution timed out, terminating");
                // A script blocked in a host callback only observes the
                // request once the callback returns, so keep asking.
                loop {
                    env.terminate();
                    if let Ok(joined) = tokio::time::timeout(TERMINATE_RETRY, &mut task).await {
                        break joined;
                    }
                }
            }
        },
        None => task.await,
    };

    let value = joined.context("Evaluation task failed")??;
    Ok(value)
}

/// Destroy the session's environment, then its engine.
fn close_session(session: Session) {
    let engine = session.env.engine().clone();
    if let Err(e) = session.env.destroy() {
        warn!(error = %e, "Failed to destroy environment");
    }
    drop(session);
    engine.destroy();
}

/// Print console output captured during the run.
fn print_captured(bindings: &HostBindings) {
    let Some(console) = bindings.console.as_ref() else {
        return;
    };
    for entry in console.take_entries() {
        eprintln!("[{}] {}", entry.level.as_str(), entry.message);
    }
}
