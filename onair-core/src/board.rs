//! Now-playing board kept fresh by a resolver.

use crate::backend::StatusSource;
use crate::resolver::{RefreshReason, RefreshTarget};
use crate::track::{NowPlaying, StreamStatus, TrackMetadata};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

const LOG_TARGET: &str = "onair::board";

/// What the board displays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NowPlayingView {
    pub now_playing: Option<TrackMetadata>,
    pub stream_status: StreamStatus,
    /// When the view was last fetched successfully
    pub updated_at: Option<DateTime<Utc>>,
}

/// Passive "now playing" display fed by `GET now-playing`.
pub struct NowPlayingBoard {
    status: Arc<dyn StatusSource>,
    view_tx: watch::Sender<NowPlayingView>,
}

impl NowPlayingBoard {
    #[must_use]
    pub fn new(status: Arc<dyn StatusSource>) -> Arc<Self> {
        let (view_tx, _) = watch::channel(NowPlayingView::default());
        Arc::new(Self { status, view_tx })
    }

    #[must_use]
    pub fn view(&self) -> NowPlayingView {
        self.view_tx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<NowPlayingView> {
        self.view_tx.subscribe()
    }

    fn apply(&self, now_playing: NowPlaying) {
        let view = NowPlayingView {
            now_playing: now_playing.now_playing,
            stream_status: now_playing.stream_status,
            updated_at: Some(Utc::now()),
        };
        self.view_tx.send_replace(view);
    }
}

#[async_trait]
impl RefreshTarget for NowPlayingBoard {
    async fn refresh(&self, reason: RefreshReason) {
        match self.status.now_playing().await {
            Ok(now_playing) => {
                debug!(
                    target: LOG_TARGET,
                    "Board refreshed ({:?}): stream {}", reason, now_playing.stream_status
                );
                self.apply(now_playing);
            }
            Err(e) => {
                warn!(target: LOG_TARGET, "Failed to refresh now playing: {}", e);
            }
        }
    }
}
