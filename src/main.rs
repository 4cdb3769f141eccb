//! resque-pool — entry point.
//!
//! Pool log lines go to stdout; tracing diagnostics go to stderr.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use resque_pool::config::{Config, ConfigSource};
use resque_pool::logger::Logger;
use resque_pool::platform::Posix;
use resque_pool::pool::{Pool, PoolOptions, TermBehavior};
use resque_pool::worker::ExecWorkerFactory;

#[derive(Debug, Parser)]
#[command(name = "resque-pool")]
#[command(about = "Resque worker pool manager", long_about = None)]
struct Cli {
    /// Pool configuration file (default: resque-pool.yml, then
    /// config/resque-pool.yml; RESQUE_POOL_CONFIG also applies).
    #[arg(short, long)]
    config: Option<String>,

    /// Environment section to overlay (default: RESQUE_ENV).
    #[arg(short = 'E', long)]
    environment: Option<String>,

    /// Application tag used in log lines and process titles
    /// (default: the working directory's name).
    #[arg(short, long)]
    app_name: Option<String>,

    /// Seconds each worker sleeps between queue polls
    /// (default: INTERVAL or 5).
    #[arg(short, long)]
    interval: Option<f64>,

    /// On TERM, shut workers down gracefully without waiting for them.
    #[arg(long, conflicts_with = "term_graceful_wait")]
    term_graceful: bool,

    /// On TERM, shut workers down gracefully and wait for every one.
    #[arg(long)]
    term_graceful_wait: bool,

    /// Drain all workers on WINCH instead of ignoring it.
    #[arg(long)]
    handle_winch: bool,

    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Worker command run in every forked worker; QUEUES and INTERVAL are
    /// exported in its environment.
    #[arg(required = true, trailing_var_arg = true)]
    worker_command: Vec<String>,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout stays pool-log-lines-only.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("resque-pool: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let source = match cli.config {
        Some(path) => ConfigSource::Path(path.into()),
        None => ConfigSource::Auto,
    };
    let mut config = Config::from_env(source)?;
    if let Some(environment) = cli.environment {
        config.set_environment(environment);
    }
    if let Some(interval) = cli.interval {
        if interval.is_nan() || interval < 0.0 {
            bail!("--interval must be non-negative");
        }
        config.interval = Duration::from_secs_f64(interval);
    }

    let app_name = cli.app_name.unwrap_or_else(default_app_name);
    let logger = Logger::new(config.level, app_name.clone());
    let term_behavior = if cli.term_graceful_wait {
        TermBehavior::GracefulAndWait
    } else if cli.term_graceful {
        TermBehavior::Graceful
    } else {
        TermBehavior::Immediate
    };

    let mut pool = Pool::new(
        Posix::new()?,
        config,
        ExecWorkerFactory::new(cli.worker_command),
        logger,
        PoolOptions {
            app_name,
            term_behavior,
            handle_winch: cli.handle_winch,
            after_prefork: None,
        },
    );
    pool.start()?;
    pool.join()?;
    Ok(pool.exit_status())
}

/// Default application tag: the working directory's file name.
fn default_app_name() -> String {
    std::env::current_dir()
        .ok()
        .and_then(|dir| {
            dir.file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_default()
}
