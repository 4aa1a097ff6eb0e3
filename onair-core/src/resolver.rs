//! Realtime-with-polling-fallback freshness resolver.
//!
//! A [`Resolver`] keeps one dependent view fresh. It prefers a push channel
//! and falls back to fixed-interval polling when the channel does not
//! confirm in time or later fails. At most one mechanism is active at a
//! time, so the view never sees duplicate refreshes from both.
//!
//! ```text
//! Idle ──start──▶ AwaitingConfirmation ──subscribed──▶ Confirmed
//!                        │                                │  ▲
//!              timeout / failure signal          failure  │  │ subscribed
//!                        ▼                                ▼  │
//!                     Polling ◀───────────────────────────┘──┘
//! ```

use crate::backend::{ChannelSignal, PushChannel, PushSubscription, SubscriptionStatus};
use crate::config::{DEFAULT_CONFIRMATION_TIMEOUT_MS, DEFAULT_EVENT, DEFAULT_POLL_INTERVAL_MS, RealtimeConfig};
use async_trait::async_trait;
use std::fmt;
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "onair::resolver";

/// Resolver lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolverState {
    /// Not started, or still performing the initial fetch
    Idle,
    /// Subscription opened, waiting for the server to confirm it
    AwaitingConfirmation,
    /// Push channel is delivering; no polling
    Confirmed,
    /// Push channel unavailable; fetching on a fixed interval
    Polling,
    /// Torn down; every resource has been released
    Disposed,
}

impl ResolverState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingConfirmation => "awaiting-confirmation",
            Self::Confirmed => "confirmed",
            Self::Polling => "polling",
            Self::Disposed => "disposed",
        }
    }
}

impl fmt::Display for ResolverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshReason {
    /// The unconditional fetch on start
    Initial,
    /// A change notification arrived on a confirmed channel
    Notification,
    /// The fallback poll interval elapsed
    Poll,
}

/// The view a resolver keeps fresh.
#[async_trait]
pub trait RefreshTarget: Send + Sync {
    /// Fetch and apply fresh data. Failures are the target's business.
    async fn refresh(&self, reason: RefreshReason);
}

/// Resolver timing and filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverSettings {
    /// How long a new subscription may stay unconfirmed
    pub confirmation_timeout: Duration,
    /// Fallback polling period
    pub poll_interval: Duration,
    /// Notification event that triggers a refresh
    pub event: String,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_millis(DEFAULT_CONFIRMATION_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            event: DEFAULT_EVENT.to_string(),
        }
    }
}

impl From<&RealtimeConfig> for ResolverSettings {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            confirmation_timeout: config.confirmation_timeout(),
            poll_interval: config.poll_interval(),
            event: config.event.clone(),
        }
    }
}

/// Factory for freshness loops sharing one channel definition.
///
/// Every [`start`](Self::start) opens its own subscription; instances never
/// share channel handles or timers.
pub struct Resolver {
    name: String,
    channel: Option<Arc<dyn PushChannel>>,
    settings: ResolverSettings,
}

impl Resolver {
    /// Create a resolver. Without a channel it polls from the start.
    pub fn new(
        name: impl Into<String>,
        channel: Option<Arc<dyn PushChannel>>,
        mut settings: ResolverSettings,
    ) -> Self {
        // tokio intervals reject a zero period
        settings.poll_interval = settings.poll_interval.max(Duration::from_millis(1));
        Self {
            name: name.into(),
            channel,
            settings,
        }
    }

    /// Start keeping `target` fresh.
    ///
    /// Issues one immediate fetch, then opens a push subscription without
    /// waiting for that fetch to finish. `on_status` observes every state change. Must be called from within a
    /// tokio runtime.
    pub fn start<F>(&self, target: Arc<dyn RefreshTarget>, on_status: F) -> ResolverHandle
    where
        F: Fn(ResolverState) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ResolverState::Idle);

        let fallback = FallbackLoop {
            name: self.name.clone(),
            settings: self.settings.clone(),
            target,
            cancel: cancel.clone(),
            status: StatusReporter {
                name: self.name.clone(),
                state_tx,
                on_status: Box::new(on_status),
            },
            subscription: None,
            confirmation_deadline: None,
            poll: None,
        };

        let channel = self.channel.clone();
        let task = tokio::spawn(fallback.run(channel));

        ResolverHandle {
            cancel,
            state: state_rx,
            task: Some(task),
        }
    }
}

/// Owner of a running resolver.
///
/// Disposing (or dropping) the handle releases the push subscription and
/// clears the confirmation timeout and the polling interval.
pub struct ResolverHandle {
    cancel: CancellationToken,
    state: watch::Receiver<ResolverState>,
    task: Option<JoinHandle<()>>,
}

impl ResolverHandle {
    /// Current state
    #[must_use]
    pub fn state(&self) -> ResolverState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ResolverState> {
        self.state.clone()
    }

    /// Request teardown. Idempotent and safe at any point of the lifecycle.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Whether teardown has been requested
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Dispose and wait until every resource has been released
    pub async fn closed(&mut self) {
        self.dispose();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(target: LOG_TARGET, "Resolver task ended abnormally: {}", e);
        }
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct StatusReporter {
    name: String,
    state_tx: watch::Sender<ResolverState>,
    on_status: Box<dyn Fn(ResolverState) + Send + Sync>,
}

impl StatusReporter {
    fn current(&self) -> ResolverState {
        *self.state_tx.borrow()
    }

    fn set(&self, state: ResolverState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(target: LOG_TARGET, "[{}] {} -> {}", self.name, previous, state);
            (self.on_status)(state);
        }
    }
}

struct FallbackLoop {
    name: String,
    settings: ResolverSettings,
    target: Arc<dyn RefreshTarget>,
    cancel: CancellationToken,
    status: StatusReporter,
    subscription: Option<PushSubscription>,
    confirmation_deadline: Option<Pin<Box<Sleep>>>,
    poll: Option<Interval>,
}

impl FallbackLoop {
    async fn run(mut self, channel: Option<Arc<dyn PushChannel>>) {
        // A slow status API must not hold back the subscription
        let initial = {
            let target = self.target.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {}
                    () = target.refresh(RefreshReason::Initial) => {}
                }
            })
        };

        self.open(channel).await;
        self.drive().await;
        self.release();
        let _ = initial.await;
        self.status.set(ResolverState::Disposed);
    }

    /// Returns `false` if teardown interrupted the refresh.
    async fn refresh(&self, reason: RefreshReason) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = self.target.refresh(reason) => true,
        }
    }

    async fn open(&mut self, channel: Option<Arc<dyn PushChannel>>) {
        let Some(channel) = channel else {
            debug!(target: LOG_TARGET, "[{}] No push channel configured", self.name);
            self.enter_polling();
            return;
        };

        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            opened = channel.subscribe() => opened,
        };

        match opened {
            Ok(subscription) => {
                debug!(target: LOG_TARGET, "[{}] Subscribed to {}, awaiting confirmation", self.name, channel.name());
                self.subscription = Some(subscription);
                self.confirmation_deadline =
                    Some(Box::pin(tokio::time::sleep(self.settings.confirmation_timeout)));
                self.status.set(ResolverState::AwaitingConfirmation);
            }
            Err(e) => {
                warn!(target: LOG_TARGET, "[{}] Could not open push channel: {}", self.name, e);
                self.enter_polling();
            }
        }
    }

    async fn drive(&mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                signal = next_signal(&mut self.subscription) => {
                    if !self.on_signal(signal).await {
                        return;
                    }
                }
                () = expired(&mut self.confirmation_deadline) => {
                    info!(
                        target: LOG_TARGET,
                        "[{}] Push channel not confirmed within {:?}, falling back to polling",
                        self.name, self.settings.confirmation_timeout
                    );
                    self.enter_polling();
                }
                () = next_poll(&mut self.poll) => {
                    if !self.refresh(RefreshReason::Poll).await {
                        return;
                    }
                }
            }
        }
    }

    async fn on_signal(&mut self, signal: Option<ChannelSignal>) -> bool {
        match signal {
            Some(ChannelSignal::Status(status)) => self.on_status(status),
            Some(ChannelSignal::Notification { event, .. }) => {
                if event != self.settings.event {
                    debug!(target: LOG_TARGET, "[{}] Ignoring event {}", self.name, event);
                } else if self.status.current() == ResolverState::Confirmed {
                    return self.refresh(RefreshReason::Notification).await;
                } else {
                    debug!(
                        target: LOG_TARGET,
                        "[{}] Ignoring {} while {}", self.name, event, self.status.current()
                    );
                }
            }
            None => {
                debug!(target: LOG_TARGET, "[{}] Push channel connection ended", self.name);
                if let Some(mut subscription) = self.subscription.take() {
                    subscription.unsubscribe();
                }
                self.on_status(SubscriptionStatus::Closed);
            }
        }
        true
    }

    fn on_status(&mut self, status: SubscriptionStatus) {
        let current = self.status.current();
        match status {
            SubscriptionStatus::Subscribed => {
                if matches!(
                    current,
                    ResolverState::AwaitingConfirmation | ResolverState::Polling
                ) {
                    self.enter_confirmed();
                }
            }
            failure => {
                if matches!(
                    current,
                    ResolverState::AwaitingConfirmation | ResolverState::Confirmed
                ) {
                    info!(
                        target: LOG_TARGET,
                        "[{}] Push channel reported {}, falling back to polling", self.name, failure
                    );
                    self.enter_polling();
                }
            }
        }
    }

    fn enter_polling(&mut self) {
        self.confirmation_deadline = None;
        if self.poll.is_none() {
            let period = self.settings.poll_interval;
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.poll = Some(interval);
            info!(target: LOG_TARGET, "[{}] Polling every {:?}", self.name, period);
        }
        self.status.set(ResolverState::Polling);
    }

    fn enter_confirmed(&mut self) {
        self.confirmation_deadline = None;
        if self.poll.take().is_some() {
            info!(target: LOG_TARGET, "[{}] Push channel confirmed, polling stopped", self.name);
        }
        self.status.set(ResolverState::Confirmed);
    }

    fn release(&mut self) {
        self.confirmation_deadline = None;
        self.poll = None;
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

async fn next_signal(subscription: &mut Option<PushSubscription>) -> Option<ChannelSignal> {
    match subscription {
        Some(subscription) => subscription.next_signal().await,
        None => pending().await,
    }
}

async fn expired(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn next_poll(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
