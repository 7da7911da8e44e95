//! mqttbridge - gowon MQTT bridge
//!
//! Usage:
//!   mqttbridge [OPTIONS] --gowon-host <URL>
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -H, --http-port <PORT>     HTTP listen port [env: GOWON_HTTP_PORT] (default: 8080)
//!   -b, --broker <ADDR>        MQTT broker address [env: GOWON_BROKER] (default: localhost:1883)
//!   -g, --gowon-host <URL>     Command service base URL [env: GOWON_HOST]
//!   -l, --log-level <LEVEL>    Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mqttbridge::bridge::{HttpDownstream, InboundBridge, InboundServer, OutboundBridge};
use mqttbridge::client::{BrokerClient, ConnectionHooks, PubSub};
use mqttbridge::config::{Config, ConfigOverrides};
use mqttbridge::router::CommandRouter;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn parse(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// gowon MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "mqttbridge")]
#[command(author = "Gowon Contributors")]
#[command(version)]
#[command(about = "Bridges an MQTT broker and the gowon command service")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP port for the inbound /message endpoint
    #[arg(short = 'H', long, env = "GOWON_HTTP_PORT")]
    http_port: Option<u16>,

    /// MQTT broker address (host:port)
    #[arg(short, long, env = "GOWON_BROKER")]
    broker: Option<String>,

    /// Base URL of the gowon command service
    #[arg(short, long, env = "GOWON_HOST")]
    gowon_host: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let overrides = ConfigOverrides {
        http_port: args.http_port,
        broker: args.broker.clone(),
        downstream_host: args.gowon_host.clone(),
        log_level: args.log_level.map(|l| l.as_str().to_string()),
    };

    let config = match Config::load(args.config.as_deref(), &overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_level = LogLevel::parse(&config.log.level);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error installing log subscriber: {}", e);
        return ExitCode::FAILURE;
    }

    if let Some(ref path) = args.config {
        info!("Loaded configuration from {:?}", path);
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting gowon MQTT bridge");
    info!("  Module: {}", config.bridge.module);
    info!("  Broker: {}", config.broker.address);
    info!("  Client ID: {}", config.broker.client_id);
    info!(
        "  Topics: in={} out={}",
        config.broker.input_topic, config.broker.output_topic
    );
    info!("  Downstream: {}", config.downstream.host);
    info!("  HTTP: {}", config.server.bind_addr());

    let client = Arc::new(BrokerClient::new(
        config.broker.clone(),
        ConnectionHooks::default(),
    ));
    let pubsub: Arc<dyn PubSub> = client.clone();

    // Local command handlers
    let router = CommandRouter::with_builtins(config.bridge.module.as_str());
    {
        let pubsub = pubsub.clone();
        let input = config.broker.input_topic.clone();
        let output = config.broker.output_topic.clone();
        tokio::spawn(async move { router.serve(pubsub, &input, &output).await });
    }

    // Broker -> downstream
    let downstream = HttpDownstream::new(&config.downstream.host, config.downstream.timeout)?;
    let outbound = OutboundBridge::new(Arc::new(downstream));
    {
        let pubsub = pubsub.clone();
        let output = config.broker.output_topic.clone();
        tokio::spawn(async move { outbound.serve(pubsub, &output).await });
    }

    // HTTP -> broker
    let (shutdown_tx, _) = broadcast::channel(1);
    let inbound = InboundBridge::new(
        pubsub.clone(),
        config.bridge.module.as_str(),
        config.broker.input_topic.as_str(),
    );
    let server = InboundServer::bind(
        config.server.bind_addr(),
        inbound,
        config.server.shutdown_grace,
    )
    .await?;
    let server = tokio::spawn(server.run(shutdown_tx.subscribe()));

    client.connect().await?;

    wait_for_signal().await;
    info!("Shutting down");

    // Requests still in flight publish through the live connection
    let _ = shutdown_tx.send(());
    let _ = server.await;
    client.disconnect(config.broker.disconnect_timeout).await;

    info!("Bye");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!("Unable to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
