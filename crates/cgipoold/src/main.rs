//! cgipoold — the cgipool daemon.
//!
//! One binary, three modes:
//! - `pool`: run the worker pool registry and publish upstreams
//! - `supervise`: start, monitor and stop the long-lived processes
//! - `discover`: print the pool configuration resolved from the manifest
//!
//! # Usage
//!
//! ```text
//! cgipoold pool --manifest discovery/manifest.json --upstream-file /tmp/cgi_upstreams.conf
//! cgipoold supervise start --config process_config.json
//! cgipoold discover --format json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod discover;
mod pool_mode;
mod shutdown;
mod supervise_mode;

#[derive(Parser)]
#[command(name = "cgipoold", about = "CGI worker pools and process supervisor")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker pool registry.
    Pool {
        /// Service manifest to derive pools from.
        #[arg(long, default_value = "discovery/manifest.json", conflicts_with = "config")]
        manifest: PathBuf,

        /// Static TOML pool file, instead of the manifest.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Directory holding built C executables.
        #[arg(long, default_value = "build")]
        build_dir: PathBuf,

        /// Where to publish the upstream configuration.
        #[arg(long, default_value = cgipool_pool::DEFAULT_UPSTREAM_PATH)]
        upstream_file: PathBuf,

        /// Seconds between registry cycles.
        #[arg(long, default_value = "5")]
        interval: f64,

        /// Append worker output to `<dir>/<service>-<port>.log`.
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Manage the supervised processes.
    Supervise {
        #[arg(value_enum)]
        action: supervise_mode::Action,

        /// Restrict the action to one configured process.
        #[arg(long)]
        process: Option<String>,

        /// Supervisor configuration (JSON or TOML).
        #[arg(long, default_value = "process_config.json")]
        config: PathBuf,

        /// Seconds between monitoring passes; overrides the config.
        #[arg(long)]
        monitor_interval: Option<f64>,
    },

    /// Print the pool configuration resolved from the manifest.
    Discover {
        #[arg(long, default_value = "discovery/manifest.json")]
        manifest: PathBuf,

        #[arg(long, default_value = "build")]
        build_dir: PathBuf,

        #[arg(long, value_enum, default_value = "text")]
        format: discover::Format,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Command::Pool {
            manifest,
            config,
            build_dir,
            upstream_file,
            interval,
            log_dir,
        } => {
            let source = match config {
                Some(path) => pool_mode::PoolSource::Config(path),
                None => pool_mode::PoolSource::Manifest {
                    path: manifest,
                    build_dir,
                },
            };
            pool_mode::run(pool_mode::PoolOptions {
                source,
                upstream_file,
                interval: seconds(interval)?,
                log_dir,
            })
            .await
        }
        Command::Supervise {
            action,
            process,
            config,
            monitor_interval,
        } => {
            let monitor_interval = monitor_interval.map(seconds).transpose()?;
            supervise_mode::run(action, process, config, monitor_interval).await
        }
        Command::Discover {
            manifest,
            build_dir,
            format,
        } => discover::run(&manifest, &build_dir, format),
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => "info,cgipoold=debug,cgipool=debug".parse()?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    Ok(())
}

fn seconds(secs: f64) -> anyhow::Result<std::time::Duration> {
    let duration = cgipool_core::duration::from_secs(secs).map_err(anyhow::Error::msg)?;
    anyhow::ensure!(!duration.is_zero(), "interval must be positive");
    Ok(duration)
}
