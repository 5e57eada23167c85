//! The gateway node daemon.
//!
//! - `fnsd serve` - run a gateway node until Ctrl-C
//! - `fnsd check-config <file>` - load and validate a config file
//!
//! Flags given to `serve` override the config file.

mod logging;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use fns_gate::{ConfigError, EchoService, Gateway, GatewayConfig, GatewayError, LogFormat};
use tracing::info;

use crate::logging::LoggingError;

#[derive(Parser)]
#[command(name = "fnsd", version, about = "Distributed WebSocket gateway node")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a gateway node
    Serve(ServeArgs),
    /// Load a config file, validate it and print the effective settings
    CheckConfig {
        /// Path to the TOML config file
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Json,
    Plain,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Plain => LogFormat::Plain,
        }
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Path to the TOML config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket listen address, e.g. 0.0.0.0:8080
    #[arg(long)]
    listen: Option<String>,

    /// Node name of the RPC listener, e.g. gw1@10.0.0.1:9100
    #[arg(long)]
    node: Option<String>,

    /// Shared secret for node RPC
    #[arg(long)]
    cookie: Option<String>,

    #[arg(long = "log-format", value_enum)]
    log_format: Option<LogFormatArg>,

    /// Default log level when FNS_LOG and RUST_LOG are unset
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// How long shutdown waits for connections to close, in milliseconds
    #[arg(long = "grace-ms", default_value = "5000")]
    grace_ms: u64,

    /// Do not register the `echos` service
    #[arg(long = "no-echo")]
    no_echo: bool,
}

impl ServeArgs {
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(node) = &self.node {
            config.cluster.node = node.clone();
        }
        if let Some(cookie) = &self.cookie {
            config.cluster.cookie = cookie.clone();
        }
        if let Some(format) = self.log_format {
            config.log.format = format.into();
        }
        if let Some(level) = &self.log_level {
            config.log.level = level.clone();
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Serve(args) => serve(args),
        Commands::CheckConfig { config } => check_config(&config),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn load_config(args: &ServeArgs) -> Result<GatewayConfig, CliError> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn serve(args: ServeArgs) -> Result<(), CliError> {
    let config = load_config(&args)?;
    logging::init_logging(&config.log)?;

    let mut builder = Gateway::builder(config);
    if !args.no_echo {
        builder = builder.register(Arc::new(EchoService));
    }
    let gateway = builder.start()?;
    info!(target: "gateway", node = %gateway.node(), addr = %gateway.local_addr(), "fnsd ready");

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(tokio::signal::ctrl_c())?;
    info!(target: "gateway", "interrupt received");

    gateway.shutdown(Duration::from_millis(args.grace_ms));
    Ok(())
}

fn check_config(path: &Path) -> Result<(), CliError> {
    let config = GatewayConfig::load(path)?;
    println!("listen   {}", config.listen);
    println!("node     {}", config.node_id()?);
    println!("registry {:?} prefix={} ttl={}s", config.registry.backend, config.registry.prefix, config.registry.ttl_secs);
    println!("log      {:?} {}", config.log.format, config.log.level);
    Ok(())
}
