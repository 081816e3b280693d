//! CLI front-end for `procpool-demo`: drives a pool of `/bin/sh` children
//! through [`ShellScript`] submissions. A convenience client of
//! `procpool-core`, not part of its contract.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use procpool_config::PoolConfig;
use procpool_core::{PoolSettings, ProcessPool};
use procpool_demo::{ShManagerFactory, ShellScript};

#[derive(Parser)]
#[command(name = "procpool-demo", version, about = "Drive a pool of /bin/sh children over a line-oriented protocol")]
struct Cli {
    /// Pool config TOML (see procpool-config); falls back to built-in defaults when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory to write procpool-demo.log into, in addition to stderr.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every line of a script file as one submission against a single shell.
    Run {
        /// Path to a file with one shell line per line.
        script: PathBuf,

        /// Terminate the shell once the script finishes.
        #[arg(long)]
        terminate: bool,
    },
    /// Submit `count` copies of a script concurrently, to exercise pool sizing under load.
    Burst {
        /// Path to a file with one shell line per line.
        script: PathBuf,

        /// Number of concurrent submissions.
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = match &cli.log_dir {
        Some(dir) => {
            let (writer, guard) = procpool_demo::logging::create_run_log_writer(dir)?;
            tracing_subscriber::fmt()
                .with_writer(writer)
                .with_ansi(false)
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
            None
        }
    };

    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { script, terminate } => run_once(settings, &script, terminate).await,
        Commands::Burst { script, count } => run_burst(settings, &script, count).await,
    }
}

fn load_settings(config_path: Option<&std::path::Path>) -> Result<PoolSettings> {
    let config = match config_path {
        Some(path) => PoolConfig::load(path)?.unwrap_or_default(),
        None => PoolConfig::default(),
    };
    Ok(config.to_settings())
}

fn read_lines(script: &std::path::Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(script)
        .with_context(|| format!("failed to read script {}", script.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

async fn run_once(settings: PoolSettings, script: &std::path::Path, terminate: bool) -> Result<()> {
    let lines = read_lines(script)?;
    let pool = ProcessPool::new(Arc::new(ShManagerFactory::default()), settings).await?;

    let mut shell_script = ShellScript::new(lines);
    if terminate {
        shell_script = shell_script.terminating();
    }
    let shell_script = Arc::new(shell_script);

    let handle = pool.submit(shell_script.clone())?;
    let elapsed = handle.wait().await?;

    for line in shell_script.commands_captured_output() {
        println!("{line}");
    }
    eprintln!("completed in {elapsed:?}");

    pool.shutdown().await;
    Ok(())
}

async fn run_burst(settings: PoolSettings, script: &std::path::Path, count: usize) -> Result<()> {
    let lines = read_lines(script)?;
    let pool = Arc::new(ProcessPool::new(Arc::new(ShManagerFactory::default()), settings).await?);

    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        let submission = Arc::new(ShellScript::new(lines.clone()));
        handles.push(pool.submit(submission)?);
    }

    let mut total = Duration::ZERO;
    let mut failures = 0usize;
    for handle in &handles {
        match handle.wait().await {
            Ok(elapsed) => total += elapsed,
            Err(error) => {
                failures += 1;
                tracing::warn!(%error, "burst submission failed");
            }
        }
    }

    eprintln!(
        "{count} submissions, {failures} failed, shells at peak <= {}, mean latency {:?}",
        pool.shell_count(),
        total.checked_div(count as u32).unwrap_or_default()
    );

    pool.shutdown().await;
    Ok(())
}
