//! mpathd - MPTCP path management daemon.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use mpathd::{Config, Daemon, LogTarget};
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "mpathd", version, about = "MPTCP path management daemon")]
struct Cli {
    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Log destination: stderr, syslog, journal, or null.
    #[arg(short, long)]
    log: Option<String>,

    /// Directory to scan for policy plugins.
    #[arg(long, value_name = "DIR")]
    plugin_dir: Option<PathBuf>,

    /// Default path management strategy.
    #[arg(long, value_name = "PLUGIN")]
    path_manager: Option<String>,

    /// Comma-separated endpoint flags (signal, subflow, backup, fullmesh).
    #[arg(long, value_name = "FLAGS")]
    addr_flags: Option<String>,

    /// Comma-separated monitor flags (existing, skip_link_local,
    /// skip_loopback, check_route).
    #[arg(long, value_name = "FLAGS")]
    notify_flags: Option<String>,

    /// Load only these plugins.
    #[arg(long, value_name = "PLUGINS", value_delimiter = ',')]
    load_plugins: Vec<String>,
}

/// Merge CLI > file > defaults into the daemon configuration.
fn build_config(cli: Cli) -> mpathd::Result<Config> {
    let mut config = Config::default();

    let path = std::path::Path::new(mpathd::config::DEFAULT_CONFIG_PATH);
    if path.exists() {
        let raw = std::fs::read_to_string(path)?;
        let file = serde_yaml::from_str(&raw)
            .map_err(|e| mpathd::Error::Config(format!("{}: {e}", path.display())))?;
        config.apply_file(file)?;
    }

    config.debug |= cli.debug;
    if let Some(log) = cli.log {
        config.log = log.parse()?;
    }
    if let Some(dir) = cli.plugin_dir {
        config.plugin_dir = Some(dir);
    }
    if let Some(name) = cli.path_manager {
        config.default_plugin = Some(name);
    }
    if let Some(flags) = cli.addr_flags {
        config.addr_flags = flags.parse()?;
    }
    if let Some(flags) = cli.notify_flags {
        config.notify_flags = flags.parse()?;
    }
    if !cli.load_plugins.is_empty() {
        config.load_plugins = cli.load_plugins;
    }

    Ok(config)
}

fn init_logging(config: &Config) {
    if config.log == LogTarget::Null {
        return;
    }

    let level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("mpathd={level}"))),
        )
        .with_writer(std::io::stderr)
        .init();

    // No syslog or journald writer in this stack; keep the records
    // rather than lose them.
    if matches!(config.log, LogTarget::Syslog | LogTarget::Journal) {
        warn!("requested log backend unavailable; logging to stderr");
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match build_config(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mpathd: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);

    let mut daemon = match Daemon::new(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("startup failed: {e}");
            eprintln!("mpathd: {e}");
            return ExitCode::FAILURE;
        }
    };

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("daemon terminated: {e}");
            ExitCode::FAILURE
        }
    }
}
