//! Contracts for the remote station backend.
//!
//! The backend is an external collaborator offering a request/response
//! status API ([`StatusSource`]) and a publish/subscribe channel
//! ([`PushChannel`]). Concrete implementations live in `onair-backend`.

use crate::error::Result;
use crate::track::{NowPlaying, StreamState};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// Capacity of the signal buffer between a channel connection and its subscriber.
pub const SIGNAL_BUFFER: usize = 32;

/// Request/response API for current playback state.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Fetch `GET current-stream-state`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the payload cannot be decoded.
    async fn current_stream_state(&self) -> Result<StreamState>;

    /// Fetch `GET now-playing`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the payload cannot be decoded.
    async fn now_playing(&self) -> Result<NowPlaying>;
}

/// Lifecycle status reported by a push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionStatus {
    /// The server confirmed the subscription and is delivering
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl SubscriptionStatus {
    /// Get the wire identifier
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribed => "subscribed",
            Self::ChannelError => "channel-error",
            Self::TimedOut => "timed-out",
            Self::Closed => "closed",
        }
    }

    /// Whether this status means the channel stopped delivering
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::Subscribed)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signal delivered by a push subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    /// Subscription lifecycle change
    Status(SubscriptionStatus),
    /// Something changed on the server. The payload is opaque.
    Notification { event: String, payload: Value },
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// Handle to an open push subscription.
///
/// Owned exclusively by whoever called [`PushChannel::subscribe`]. The
/// underlying server subscription is released by [`unsubscribe`](Self::unsubscribe)
/// or on drop, whichever comes first, and never twice.
pub struct PushSubscription {
    signals: mpsc::Receiver<ChannelSignal>,
    release: Option<Release>,
}

impl PushSubscription {
    /// Wrap a signal receiver and the action that releases the server subscription
    pub fn new(
        signals: mpsc::Receiver<ChannelSignal>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            signals,
            release: Some(Box::new(release)),
        }
    }

    /// Wait for the next signal. `None` means the connection is gone.
    pub async fn next_signal(&mut self) -> Option<ChannelSignal> {
        self.signals.recv().await
    }

    /// Release the server subscription. Later calls do nothing.
    pub fn unsubscribe(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.signals.close();
    }

    /// Whether the subscription has been released
    #[must_use]
    pub const fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

impl Drop for PushSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for PushSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSubscription")
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

/// A named publish/subscribe channel.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Human-readable channel name for logs
    fn name(&self) -> &str;

    /// Open a new, independent subscription.
    ///
    /// Returning `Ok` does not mean the subscription is confirmed; a
    /// [`SubscriptionStatus::Subscribed`] signal does.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be opened at all.
    async fn subscribe(&self) -> Result<PushSubscription>;
}
