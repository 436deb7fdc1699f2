//! EdgeMQ - embeddable MQTT v3.1.1/v5.0 broker
//!
//! Usage:
//!   edgemq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address (default: 0.0.0.0:1883)
//!   --max-connections <N>  Maximum connections (default: 10000)
//!   --threshold <VALUE>    Pipeline threshold (default: 30.5)
//!   --no-pipeline          Do not start the threshold pipeline
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use edgemq::acl::AclProvider;
use edgemq::auth::AuthProvider;
use edgemq::broker::{Broker, BrokerConfig, ShutdownHandle};
use edgemq::config::{Config, ConfigError};
use edgemq::hooks::CompositeHooks;
use edgemq::pipeline::ThresholdPipeline;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// EdgeMQ - embeddable MQTT broker with a threshold pipeline
#[derive(Parser, Debug)]
#[command(name = "edgemq")]
#[command(version)]
#[command(about = "Embeddable MQTT v3.1.1/v5.0 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum connections (0 = unbounded)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Readings above this value are labelled "high"
    #[arg(long)]
    threshold: Option<f64>,

    /// Do not start the threshold pipeline
    #[arg(long)]
    no_pipeline: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut file_config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides the default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    if let Err(e) = apply_overrides(&mut file_config, &args) {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let broker_config = BrokerConfig::from(&file_config);

    info!("Starting EdgeMQ MQTT Broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!("  Max QoS: {:?}", broker_config.max_qos);

    if file_config.auth.enabled {
        info!(
            "  Authentication: enabled ({} users configured)",
            file_config.auth.users.len()
        );
    } else {
        info!("  Authentication: disabled");
    }
    if file_config.acl.enabled {
        info!(
            "  ACL: enabled ({} roles configured)",
            file_config.acl.roles.len()
        );
    } else {
        info!("  ACL: disabled");
    }

    // Auth first, then ACL
    let auth_provider = Arc::new(AuthProvider::new(&file_config.auth));
    let acl_provider = Arc::new(AclProvider::new(&file_config.acl, auth_provider.clone()));
    let hooks = Arc::new(CompositeHooks::new().with(auth_provider).with(acl_provider));

    let broker = Broker::with_hooks(broker_config, hooks);

    let pipeline = &file_config.pipeline;
    if pipeline.enabled {
        match broker.inline_client() {
            Some(client) => {
                if let Err(e) = ThresholdPipeline::start(pipeline, client).await {
                    error!("Failed to start threshold pipeline: {}", e);
                    std::process::exit(1);
                }
                info!(
                    "  Pipeline: {} -> {} (threshold {})",
                    pipeline.input_topic, pipeline.output_topic, pipeline.threshold
                );
            }
            None => warn!("  Pipeline: disabled (inline client is turned off)"),
        }
    } else {
        info!("  Pipeline: disabled");
    }

    tokio::spawn(wait_for_signal(broker.shutdown_handle()));

    if let Err(e) = broker.run().await {
        error!("Broker error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Apply CLI flags on top of the loaded configuration and check the result
fn apply_overrides(config: &mut Config, args: &Args) -> Result<(), ConfigError> {
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(max_connections) = args.max_connections {
        config.limits.max_connections = max_connections;
    }
    if let Some(threshold) = args.threshold {
        config.pipeline.threshold = threshold;
    }
    if args.no_pipeline {
        config.pipeline.enabled = false;
    }
    config.validate()
}

async fn wait_for_signal(handle: ShutdownHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }

    handle.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overridden(argv: &[&str]) -> Result<Config, ConfigError> {
        let args = Args::try_parse_from(argv).unwrap();
        let mut config = Config::default();
        apply_overrides(&mut config, &args).map(|()| config)
    }

    #[test]
    fn test_cli_overrides() {
        let argv = ["edgemq", "--threshold", "25", "--bind", "127.0.0.1:1999"];
        let config = overridden(&argv).unwrap();
        assert_eq!(config.pipeline.threshold, 25.0);
        assert_eq!(config.server.bind.port(), 1999);

        let config = overridden(&["edgemq", "--no-pipeline"]).unwrap();
        assert!(!config.pipeline.enabled);
    }

    #[test]
    fn test_cli_threshold_is_validated() {
        assert!(overridden(&["edgemq", "--threshold", "NaN"]).is_err());
        assert!(overridden(&["edgemq", "--threshold", "inf"]).is_err());
        // Not checked when the pipeline is off
        assert!(overridden(&["edgemq", "--threshold", "inf", "--no-pipeline"]).is_ok());
    }
}
