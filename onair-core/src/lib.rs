pub mod backend;
pub mod board;
pub mod config;
pub mod error;
pub mod paths;
pub mod player;
pub mod resolver;
pub mod session;
pub mod state;
pub mod time;
pub mod track;
pub mod transport;

pub use backend::{ChannelSignal, PushChannel, PushSubscription, StatusSource, SubscriptionStatus};
pub use board::{NowPlayingBoard, NowPlayingView};
pub use config::{
    BackendConfig, CONFIG_TEMPLATE, LoggingConfig, OnAirConfig, PlayerConfig, RealtimeConfig,
};

pub use error::{CoreError, Result};
pub use paths::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, LOG_FILE_NAME, SESSION_FILE_NAME, config_dir, config_path,
    log_file_path, session_path,
};
pub use player::{PlayerEvent, StreamController};
pub use resolver::{
    RefreshReason, RefreshTarget, Resolver, ResolverHandle, ResolverSettings, ResolverState,
};
pub use session::{FileSessionStore, MemorySessionStore, SessionFlags, SessionStore};
pub use state::{ConnectionPhase, PlaybackSnapshot, Progress};
pub use track::{NowPlaying, StreamState, StreamStatus, TrackMetadata};
pub use transport::{
    AnalysisGraph, AudioTransport, FrequencyAnalyser, TransportError, TransportEvent,
};
