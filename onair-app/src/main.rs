use onair_backend::{HttpStreamTransport, PhoenixChannel, StatusClient};
use onair_core::{
    AudioTransport, CoreError, FileSessionStore, NowPlayingBoard, NowPlayingView, OnAirConfig,
    PlayerEvent, PushChannel, Resolver, ResolverSettings, ResolverState, SessionStore,
    StatusSource, StreamController,
};
use std::fs::File;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const HELP: &str = "Commands: play, stop, mute, unmute, vol <0-1>, status, quit";

fn main() {
    // Initialize logging with optional file output
    // Check config for logging.enabled before full config load
    let file_logging_enabled = check_file_logging_enabled();
    init_tracing(file_logging_enabled);

    let config = match OnAirConfig::load_or_create() {
        Ok(config) => config,
        Err(e @ CoreError::ConfigNotFound { .. }) => {
            info!("{e}");
            std::process::exit(0);
        }
        Err(CoreError::ConfigParseError(parse_error)) => {
            error!(
                "Config at {} has a syntax error: {parse_error}",
                OnAirConfig::config_path().display()
            );
            std::process::exit(1);
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let missing = config.missing_fields();
    if !missing.is_empty() {
        error!(
            "The following required configuration fields are missing or empty in {}:\n{}",
            OnAirConfig::config_path().display(),
            missing
                .iter()
                .map(|f| format!("  \u{2022} {f}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        std::process::exit(1);
    }
    if let Err(e) = config.validate() {
        error!("{e}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    // Create shared cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();

    // Set up Ctrl+C handler to trigger graceful shutdown
    let ctrlc_token = cancel_token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down gracefully...");
        ctrlc_token.cancel();
    }) {
        error!("Failed to set Ctrl+C handler: {}", e);
    }

    if let Err(e) = runtime.block_on(run(config, cancel_token)) {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: OnAirConfig, cancel_token: CancellationToken) -> Result<(), CoreError> {
    let status: Arc<dyn StatusSource> = Arc::new(StatusClient::new(&config.backend)?);
    let transport: Arc<dyn AudioTransport> = Arc::new(HttpStreamTransport::new(&config.player)?);
    let session_store = FileSessionStore::new();
    debug!("Session flags stored at {}", session_store.path().display());
    let sessions: Arc<dyn SessionStore> = Arc::new(session_store);

    let controller = StreamController::new(&config.player, transport, status.clone(), sessions)?;
    let board = NowPlayingBoard::new(status);

    let channel: Option<Arc<dyn PushChannel>> = if config.realtime.is_enabled() {
        Some(Arc::new(PhoenixChannel::new(
            &config.realtime,
            &config.backend.api_key,
        )?))
    } else {
        info!("Realtime channel not configured, metadata will be polled");
        None
    };
    let settings = ResolverSettings::from(&config.realtime);

    // Each view gets its own subscription and timers
    let mut player_resolver = Resolver::new("player", channel.clone(), settings.clone())
        .start(controller.clone(), |state| info!("Player metadata source: {}", state));
    let mut board_resolver = Resolver::new("board", channel, settings)
        .start(board.clone(), |state| info!("Now-playing board source: {}", state));

    let freshness = player_resolver.subscribe();
    tokio::spawn(log_player_events(controller.subscribe()));
    tokio::spawn(log_board(board.watch()));

    if config.player.autoplay {
        controller.set_playing(true).await;
    }

    info!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_command(&controller, &freshness, line.trim()).await {
                        break;
                    }
                }
                // Stdin closed; keep running until Ctrl+C
                Ok(None) => cancel_token.cancelled().await,
                Err(e) => {
                    warn!("Failed to read command: {}", e);
                    cancel_token.cancelled().await;
                }
            },
        }
    }

    info!("Shutting down...");
    player_resolver.closed().await;
    board_resolver.closed().await;
    controller.shutdown().await;
    Ok(())
}

/// Apply one console command. Returns `false` to quit.
async fn handle_command(
    controller: &Arc<StreamController>,
    freshness: &watch::Receiver<ResolverState>,
    command: &str,
) -> bool {
    let mut parts = command.split_whitespace();
    match parts.next() {
        Some("play") => controller.set_playing(true).await,
        Some("stop") => controller.set_playing(false).await,
        Some("mute") => controller.set_muted(true),
        Some("unmute") => controller.set_muted(false),
        Some("vol" | "volume") => match parts.next().map(str::parse::<f32>) {
            Some(Ok(level)) => controller.set_volume(level),
            _ => warn!("Usage: vol <0-1>"),
        },
        Some("status") => {
            let snapshot = controller.snapshot();
            let progress = snapshot.progress();
            let track = snapshot
                .current_track
                .as_ref()
                .map_or_else(|| "nothing".to_string(), ToString::to_string);
            info!(
                "[{}] {} {}/{}s ({:.0}%), {} listening, volume {:.2}{}, metadata {}",
                snapshot.connection_phase,
                track,
                progress.elapsed,
                progress.duration,
                progress.percent,
                snapshot.listener_count,
                snapshot.volume,
                if snapshot.muted { " (muted)" } else { "" },
                *freshness.borrow()
            );
        }
        Some("quit" | "exit") => return false,
        Some(_) => info!("{HELP}"),
        None => {}
    }
    true
}

/// Log all player events to the console
async fn log_player_events(mut rx: broadcast::Receiver<PlayerEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match &event {
                PlayerEvent::IntentChanged { playing } => {
                    info!("Listener {} playback", if *playing { "requested" } else { "stopped" });
                }
                PlayerEvent::PhaseChanged { phase } => {
                    info!("Connection: {}", phase);
                }
                PlayerEvent::MetadataRefreshed {
                    track,
                    listeners,
                    position,
                } => {
                    if let Some(track) = track {
                        info!("On air: {} (at {}s, {} listening)", track, position, listeners);
                    } else {
                        info!("Nothing on air ({} listening)", listeners);
                    }
                }
                PlayerEvent::MetadataRefreshFailed { message } => {
                    warn!("Metadata refresh failed: {}", message);
                }
                PlayerEvent::VolumeChanged { volume, muted } => {
                    info!("Volume {:.2}{}", volume, if *muted { " (muted)" } else { "" });
                }
                PlayerEvent::PlaybackFailed { message } => {
                    error!("Playback failed: {}", message);
                }
            },
            Err(broadcast::error::RecvError::Closed) => {
                info!("Player event channel closed");
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                info!("Missed {} player events", n);
            }
        }
    }
}

/// Log now-playing board changes
async fn log_board(mut rx: watch::Receiver<NowPlayingView>) {
    while rx.changed().await.is_ok() {
        let view = rx.borrow_and_update().clone();
        match view.now_playing {
            Some(track) => info!("Board: {} [{}]", track, view.stream_status),
            None => info!("Board: stream {}", view.stream_status),
        }
    }
}

/// Check if file logging is enabled by reading the config file.
/// This is done before full config loading to set up tracing first.
/// Returns `false` if config doesn't exist or can't be parsed.
fn check_file_logging_enabled() -> bool {
    // Minimal structs to parse just the logging.enabled field
    #[derive(serde::Deserialize)]
    struct PartialConfig {
        #[serde(default)]
        logging: PartialLoggingConfig,
    }

    #[derive(serde::Deserialize, Default)]
    struct PartialLoggingConfig {
        #[serde(default)]
        enabled: bool,
    }

    let Ok(content) = std::fs::read_to_string(OnAirConfig::config_path()) else {
        return false;
    };
    toml::from_str::<PartialConfig>(&content)
        .map(|c| c.logging.enabled)
        .unwrap_or(false)
}

/// Initialize tracing with console output and optional file logging
fn init_tracing(file_logging_enabled: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest_retry=warn,tungstenite=warn"));

    let fmt_layer = tracing_subscriber::fmt::layer();

    if file_logging_enabled {
        let log_path = onair_core::paths::log_file_path();
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match File::create(&log_path) {
            Ok(file) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(file_layer)
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("Failed to create log file at {}: {e}", log_path.display());
            }
        }
    }

    // Fallback: console only
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
