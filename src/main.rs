use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixelstream::config::{overrides, AppConfig, SettingsStore};
use pixelstream::controller::SessionController;
use pixelstream::events::SessionEvent;
use pixelstream::signalling::WebSocketConnector;
use pixelstream::webrtc::{RtcPeerFactory, RuntimeProfile};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// pixelstream command line arguments
#[derive(Parser, Debug)]
#[command(name = "pixelstream")]
#[command(version, about = "Pixel streaming session client", long_about = None)]
struct CliArgs {
    /// Signalling server URL (overrides config file)
    #[arg(short = 'u', long, value_name = "URL")]
    url: Option<String>,

    /// Streamer to subscribe to
    #[arg(short = 's', long, value_name = "ID")]
    streamer: Option<String>,

    /// JSON configuration file; created with defaults if missing
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Only use relay candidates
    #[arg(long)]
    force_turn: bool,

    /// Player setting by name, e.g. `--set MaxReconnectAttempts=5` (repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    settings: Vec<String>,

    /// Negotiate as the runtime identified by this user agent
    #[arg(long, value_name = "UA")]
    user_agent: Option<String>,

    /// Keepalive ping interval in milliseconds (0 disables)
    #[arg(long, value_name = "MS")]
    keepalive: Option<u64>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose, args.log_json);

    tracing::info!("Starting pixelstream v{}", env!("CARGO_PKG_VERSION"));

    let settings = match args.config {
        Some(ref path) => {
            tracing::info!("Configuration file: {}", path.display());
            SettingsStore::open(path).await?
        }
        None => SettingsStore::new(AppConfig::default()),
    };

    let initial: Vec<(String, serde_json::Value)> = args
        .settings
        .iter()
        .map(|entry| {
            let (name, value) = entry.split_once('=').unwrap_or((entry.as_str(), "true"));
            (name.to_string(), serde_json::Value::String(value.to_string()))
        })
        .collect();

    // CLI arguments take precedence over the file
    settings
        .update("cli", |config| {
            let applied = overrides::apply_initial_settings(
                config,
                initial.iter().map(|(name, value)| (name.as_str(), value)),
            );
            if applied < initial.len() {
                tracing::warn!(
                    "{} of {} --set values were not applied",
                    initial.len() - applied,
                    initial.len()
                );
            }
            if let Some(url) = args.url {
                config.signalling.url = url;
            }
            if let Some(id) = args.streamer {
                config.streamer.streamer_id = Some(id);
            }
            if args.force_turn {
                config.webrtc.force_turn = true;
            }
            if let Some(keepalive) = args.keepalive {
                config.signalling.keepalive_delay_ms = keepalive;
            }
            config.streamer.auto_connect = true;
        })
        .await?;

    let runtime = match args.user_agent {
        Some(ref ua) => RuntimeProfile::from_user_agent(ua),
        None => RuntimeProfile::native(),
    };
    tracing::info!("Runtime profile: {}", runtime.name);

    let controller = SessionController::new(
        settings,
        Arc::new(WebSocketConnector),
        Arc::new(RtcPeerFactory::new()),
    )
    .with_runtime(runtime);
    let handle = controller.handle();
    let events = handle.subscribe();

    let controller_task = tokio::spawn(controller.run());
    let log_task = tokio::spawn(log_events(events));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    handle.shutdown();
    if let Err(e) = controller_task.await {
        tracing::error!("Session controller task failed: {}", e);
    }
    log_task.abort();

    tracing::info!("pixelstream stopped");
    Ok(())
}

/// Write session events to the log until the channel closes
async fn log_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::StatsTick { stats }) => {
                tracing::debug!(
                    "stats: video {:?} kbps, codec {:?}, loss {:?}%",
                    stats.video_bitrate,
                    stats.video_codec,
                    stats.video_packet_loss
                );
            }
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!("{}", json),
                Err(_) => tracing::info!("{}", event.event_name()),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Event log lagged, {} events dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8, json: bool) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "pixelstream=error,webrtc=error",
        LogLevel::Warn => "pixelstream=warn,webrtc=warn",
        LogLevel::Info => "pixelstream=info,webrtc=warn",
        LogLevel::Verbose => "pixelstream=debug,webrtc=warn",
        LogLevel::Debug => "pixelstream=debug,webrtc=info",
        LogLevel::Trace => "pixelstream=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let result = if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
