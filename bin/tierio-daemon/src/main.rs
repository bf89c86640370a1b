//! tierio - tiered block storage daemon
//!
//! `serve` runs the engine and the listener plugins register with;
//! `plugin` serves a file to a running engine as a remote backend.

mod service;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tierio_common::{BackendConfig, Config, LoggingConfig};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tierio")]
#[command(about = "Tiered block storage over local and remote backends")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "TIERIO_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Log JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine
    Serve {
        /// Address plugins connect to
        #[arg(short, long)]
        listen: Option<String>,

        /// Local backend, added after the configured ones (repeatable)
        #[arg(long = "backend")]
        backends: Vec<PathBuf>,

        /// Remote backend served by the named plugin (repeatable)
        #[arg(long = "plugin")]
        plugins: Vec<String>,

        /// Sector size in bytes
        #[arg(long)]
        blocksize: Option<u32>,

        /// Never run the tiering optimizer
        #[arg(long)]
        no_tiering: bool,

        /// Seconds between status reports (0 disables them)
        #[arg(long, default_value_t = 60)]
        stats_interval: u64,
    },
    /// Serve a file to an engine as a remote backend
    Plugin {
        /// Name the engine addresses this store by
        #[arg(long)]
        name: String,

        /// Backing file
        #[arg(long)]
        path: PathBuf,

        /// Create the file with this many bytes if it is missing
        #[arg(long)]
        create_size: Option<u64>,

        /// Engine plugin listener address
        #[arg(long)]
        engine: Option<String>,
    },
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.logging.json |= args.log_json;
    init_logging(&config.logging);

    match args.command {
        Command::Serve {
            listen,
            backends,
            plugins,
            blocksize,
            no_tiering,
            stats_interval,
        } => {
            if let Some(listen) = listen {
                config.rpc.listen = listen;
            }
            if let Some(blocksize) = blocksize {
                config.engine.blocksize = blocksize;
            }
            config.tiering.enabled &= !no_tiering;
            config.backends.extend(backends.into_iter().map(|path| BackendConfig {
                path: Some(path),
                ..BackendConfig::default()
            }));
            config.backends.extend(plugins.into_iter().map(|name| BackendConfig {
                plugin: Some(name),
                ..BackendConfig::default()
            }));
            config.validate()?;

            info!("starting tierio {}", env!("CARGO_PKG_VERSION"));
            service::serve(config, Duration::from_secs(stats_interval)).await
        }
        Command::Plugin {
            name,
            path,
            create_size,
            engine,
        } => {
            let engine = engine.unwrap_or_else(|| config.rpc.listen.clone());
            service::run_plugin(&name, &path, create_size, &engine, config.rpc.max_frame_bytes)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_serve_arguments() {
        let args = Args::try_parse_from([
            "tierio",
            "serve",
            "--backend",
            "/tmp/a.img",
            "--backend",
            "/tmp/b.img",
            "--plugin",
            "cold",
            "--no-tiering",
        ])
        .unwrap();
        let Command::Serve {
            backends,
            plugins,
            no_tiering,
            stats_interval,
            ..
        } = args.command
        else {
            panic!("expected serve");
        };
        assert_eq!(backends.len(), 2);
        assert_eq!(plugins, ["cold"]);
        assert!(no_tiering);
        assert_eq!(stats_interval, 60);
    }
}
