#![forbid(unsafe_code)]

//! `actr-remote`: command-line client for the ACT-R remote interface.
//!
//! Connects to a running peer, then either evaluates one command and prints
//! its result values as JSON, or echoes the peer's trace output until
//! interrupted.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use actr_remote::{AppError, Client, ClientConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "actr-remote", about = "ACT-R remote interface client", version, long_about = None)]
struct Cli {
    /// Path to an optional TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Peer host; overrides the config file and advertised address.
    #[arg(long)]
    host: Option<String>,

    /// Peer port; overrides the config file and advertised port.
    #[arg(long)]
    port: Option<u16>,

    /// Client name announced to the peer.
    #[arg(long)]
    name: Option<String>,

    /// Model to scope evaluated commands to.
    #[arg(long)]
    model: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate one peer command and print its result values.
    Call {
        /// Command name.
        command: String,
        /// Arguments, parsed as JSON where possible and as strings otherwise.
        args: Vec<String>,
    },
    /// Print the peer's trace output until interrupted.
    Watch,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = load_config(&args)?;

    match args.command {
        Command::Call { command, args: raw } => {
            let config = ClientConfig {
                echo_output: false,
                ..config
            };
            let client = Client::connect(&config).await?;
            let client = match args.model {
                Some(model) => client.set_current_model(&model).await?,
                None => client,
            };

            let params: Vec<Value> = raw.iter().map(|arg| parse_arg(arg)).collect();
            let result = client.evaluate(&command, &params).await;
            client.close().await;

            let values = result?;
            println!("{}", Value::Array(values));
        }
        Command::Watch => {
            let config = ClientConfig {
                echo_output: true,
                ..config
            };
            let client = Client::connect(&config).await?;
            let mut lines = client.trace_output();
            let shutdown = shutdown_signal();
            tokio::pin!(shutdown);
            info!("watching trace output; press ctrl-c to stop");

            loop {
                tokio::select! {
                    () = &mut shutdown => {
                        info!("shutdown signal received");
                        break;
                    }
                    () = client.connection().closed() => {
                        warn!("peer closed the connection");
                        break;
                    }
                    line = lines.recv() => match line {
                        Ok(line) => println!("{line}"),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "trace output lagged, lines dropped");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            if client.connection().is_alive() {
                if let Err(err) = client.no_output().await {
                    warn!(%err, "failed to remove trace monitor");
                }
            }
            client.close().await;
        }
    }

    Ok(())
}

/// Build the effective configuration: file, then advertised address, then
/// command-line overrides.
fn load_config(args: &Cli) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load_from_path(path)?,
        None => ClientConfig::default(),
    };

    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        config.apply_address_files(PathBuf::from(home));
    }

    if let Some(host) = &args.host {
        config.host.clone_from(host);
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(name) = &args.name {
        config.client_name.clone_from(name);
    }

    config.validate()?;
    Ok(config)
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
