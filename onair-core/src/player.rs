//! Stream playback controller.
//!
//! [`StreamController`] owns one [`AudioTransport`] and turns the listener's
//! play/stop intent into a connection phase, a ticking playhead, refreshed
//! track metadata and a visualizer spectrum. Observers read state through
//! `watch` channels and lifecycle changes through a broadcast event bus.

use crate::backend::StatusSource;
use crate::config::PlayerConfig;
use crate::error::Result;
use crate::resolver::{RefreshReason, RefreshTarget};
use crate::session::SessionStore;
use crate::state::{ConnectionPhase, PlaybackSnapshot, Progress};
use crate::time::unix_millis;
use crate::track::{StreamState, TrackMetadata};
use crate::transport::{AnalysisGraph, AudioTransport, FrequencyAnalyser, TransportError, TransportEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const LOG_TARGET: &str = "onair::player";

/// Query parameter carrying the cache-busting timestamp
pub const CACHE_BUST_PARAM: &str = "t";

/// Events emitted by the stream controller
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// The listener's play/stop intent changed
    IntentChanged { playing: bool },
    /// The connection phase changed
    PhaseChanged { phase: ConnectionPhase },
    /// Track metadata was refreshed from the backend
    MetadataRefreshed {
        track: Option<TrackMetadata>,
        listeners: u32,
        position: u32,
    },
    /// A metadata refresh failed; the previous metadata is kept
    MetadataRefreshFailed { message: String },
    /// Volume or mute changed
    VolumeChanged { volume: f32, muted: bool },
    /// Playback could not start or broke down
    PlaybackFailed { message: String },
}

#[derive(Default)]
struct Control {
    /// Bumped by every intent change; stale play results compare against it
    generation: u64,
    /// Progress and metadata timers of the current listening session
    session: Option<CancellationToken>,
    visualizer: Option<CancellationToken>,
    stalled: bool,
}

/// Controller for one live stream.
pub struct StreamController {
    transport: Arc<dyn AudioTransport>,
    status: Arc<dyn StatusSource>,
    sessions: Arc<dyn SessionStore>,
    source: Url,
    metadata_interval: Duration,
    progress_tick: Duration,
    frame_interval: Duration,
    graph: AnalysisGraph,
    control: Mutex<Control>,
    snapshot_tx: watch::Sender<PlaybackSnapshot>,
    spectrum_tx: watch::Sender<Vec<u8>>,
    last_updated_tx: watch::Sender<Option<DateTime<Utc>>>,
    event_tx: broadcast::Sender<PlayerEvent>,
    shutdown: CancellationToken,
}

impl StreamController {
    /// Create a controller for the configured stream.
    ///
    /// Restores volume and mute from `sessions` and starts listening to
    /// transport events, so it must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream URL is invalid.
    pub fn new(
        config: &PlayerConfig,
        transport: Arc<dyn AudioTransport>,
        status: Arc<dyn StatusSource>,
        sessions: Arc<dyn SessionStore>,
    ) -> Result<Arc<Self>> {
        let source = config.stream_url()?;
        let flags = sessions.load();

        let snapshot = PlaybackSnapshot {
            volume: flags.volume.clamp(0.0, 1.0),
            muted: flags.muted,
            ..PlaybackSnapshot::default()
        };
        transport.set_volume(snapshot.effective_volume());

        let (snapshot_tx, _) = watch::channel(snapshot);
        let (spectrum_tx, _) = watch::channel(Vec::new());
        let (last_updated_tx, _) = watch::channel(None);
        let (event_tx, _) = broadcast::channel(64);

        let min = Duration::from_millis(1);
        let controller = Arc::new(Self {
            transport,
            status,
            sessions,
            source,
            metadata_interval: config.metadata_refresh_interval().max(min),
            progress_tick: config.progress_tick().max(min),
            frame_interval: config.frame_interval().max(min),
            graph: AnalysisGraph::new(),
            control: Mutex::new(Control::default()),
            snapshot_tx,
            spectrum_tx,
            last_updated_tx,
            event_tx,
            shutdown: CancellationToken::new(),
        });

        controller.spawn_transport_listener();
        Ok(controller)
    }

    /// Subscribe to controller events
    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.event_tx.subscribe()
    }

    /// Watch the playback snapshot
    pub fn watch_snapshot(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Watch visualizer frames. Empty while nothing is playing.
    pub fn watch_spectrum(&self) -> watch::Receiver<Vec<u8>> {
        self.spectrum_tx.subscribe()
    }

    /// Watch the time of the last successful metadata refresh
    pub fn watch_last_updated(&self) -> watch::Receiver<Option<DateTime<Utc>>> {
        self.last_updated_tx.subscribe()
    }

    /// Current playback snapshot
    #[must_use]
    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    #[must_use]
    pub fn connection_phase(&self) -> ConnectionPhase {
        self.snapshot_tx.borrow().connection_phase
    }

    #[must_use]
    pub fn is_playing_requested(&self) -> bool {
        self.snapshot_tx.borrow().is_user_requested_playing
    }

    /// Progress indicator values for the current track
    #[must_use]
    pub fn progress(&self) -> Progress {
        self.snapshot_tx.borrow().progress()
    }

    /// The analyser, once the analysis graph has been built
    #[must_use]
    pub fn analyser(&self) -> Option<Arc<dyn FrequencyAnalyser>> {
        self.graph.get()
    }

    /// Express the listener's intent to play or stop.
    ///
    /// The latest call always wins: a play request overtaken by a newer
    /// intent is discarded when it settles. Repeating the current intent
    /// does nothing.
    pub async fn set_playing(self: &Arc<Self>, playing: bool) {
        if playing {
            self.start_playback().await;
        } else {
            self.stop_playback().await;
        }
    }

    async fn start_playback(self: &Arc<Self>) {
        let generation = {
            let mut control = self.control.lock().await;
            if self.shutdown.is_cancelled() {
                debug!(target: LOG_TARGET, "Ignoring play request after shutdown");
                return;
            }
            if self.is_playing_requested() {
                return;
            }

            control.generation += 1;
            control.stalled = false;

            let session = self.shutdown.child_token();
            self.spawn_progress_ticker(session.clone());
            self.spawn_metadata_timer(session.clone());
            control.session = Some(session);

            self.set_intent(true);
            self.set_phase(ConnectionPhase::Connecting);

            let source = cache_busted(&self.source, unix_millis());
            info!(target: LOG_TARGET, "Tuning in to {}", source);
            self.transport.attach(&source);
            control.generation
        };

        let result = self.transport.play().await;

        let mut control = self.control.lock().await;
        if control.generation != generation {
            debug!(target: LOG_TARGET, "Discarding result of superseded play request");
            return;
        }

        match result {
            Ok(()) => {
                self.set_phase(ConnectionPhase::Connected);
                drop(control);
                self.sessions
                    .update(&mut |flags| flags.experience_started = true);
                self.start_visualizer(generation).await;
                self.spawn_refresh();
            }
            Err(e) if e.is_superseded() => {
                debug!(target: LOG_TARGET, "Play request superseded: {}", e);
            }
            Err(e) => {
                self.fail(&mut control, &e);
            }
        }
    }

    async fn stop_playback(&self) {
        let mut control = self.control.lock().await;
        if !self.is_playing_requested() {
            return;
        }

        control.generation += 1;
        Self::cancel_session(&mut control);
        self.clear_spectrum();
        self.transport.pause();
        self.transport.detach();

        self.set_intent(false);
        self.set_phase(ConnectionPhase::Offline);
        info!(target: LOG_TARGET, "Playback stopped");
    }

    /// Tear playback down after a non-recoverable transport failure
    fn fail(&self, control: &mut Control, error: &TransportError) {
        warn!(target: LOG_TARGET, "Playback failed: {}", error);

        control.generation += 1;
        Self::cancel_session(control);
        self.clear_spectrum();
        self.transport.pause();
        self.transport.detach();

        self.set_intent(false);
        self.set_phase(ConnectionPhase::Error);
        let _ = self.event_tx.send(PlayerEvent::PlaybackFailed {
            message: error.to_string(),
        });
    }

    fn cancel_session(control: &mut Control) {
        if let Some(visualizer) = control.visualizer.take() {
            visualizer.cancel();
        }
        if let Some(session) = control.session.take() {
            session.cancel();
        }
        control.stalled = false;
    }

    /// Stop playback and every background task. Idempotent.
    pub async fn shutdown(&self) {
        let mut control = self.control.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }

        control.generation += 1;
        Self::cancel_session(&mut control);
        self.shutdown.cancel();
        self.clear_spectrum();
        self.transport.pause();
        self.transport.detach();

        self.set_intent(false);
        self.set_phase(ConnectionPhase::Offline);
        info!(target: LOG_TARGET, "Stream controller shut down");
    }

    /// Set the volume level, clamped to `0.0..=1.0`. NaN is ignored.
    pub fn set_volume(&self, volume: f32) {
        if volume.is_nan() {
            warn!(target: LOG_TARGET, "Ignoring NaN volume");
            return;
        }
        let volume = volume.clamp(0.0, 1.0);
        self.snapshot_tx.send_modify(|s| s.volume = volume);
        self.apply_volume();
    }

    /// Mute or unmute without losing the volume level
    pub fn set_muted(&self, muted: bool) {
        self.snapshot_tx.send_modify(|s| s.muted = muted);
        self.apply_volume();
    }

    fn apply_volume(&self) {
        let (effective, volume, muted) = {
            let snapshot = self.snapshot_tx.borrow();
            (snapshot.effective_volume(), snapshot.volume, snapshot.muted)
        };
        self.transport.set_volume(effective);
        self.sessions.update(&mut |flags| {
            flags.volume = volume;
            flags.muted = muted;
        });
        debug!(target: LOG_TARGET, "Volume {:.2} (muted: {})", volume, muted);
        let _ = self.event_tx.send(PlayerEvent::VolumeChanged { volume, muted });
    }

    /// Fetch the current stream state and apply it.
    ///
    /// Failures are logged and leave the previous metadata in place.
    pub async fn refresh_metadata(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        match self.status.current_stream_state().await {
            Ok(state) => self.apply_stream_state(state),
            Err(e) => {
                warn!(target: LOG_TARGET, "Metadata refresh failed: {}", e);
                let _ = self.event_tx.send(PlayerEvent::MetadataRefreshFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    fn apply_stream_state(&self, state: StreamState) {
        let now = Utc::now();
        let event = PlayerEvent::MetadataRefreshed {
            track: state.track.clone(),
            listeners: state.listeners,
            position: state.seek_position,
        };

        if let Some(track) = &state.track {
            debug!(target: LOG_TARGET, "Now playing {} at {}s", track, state.seek_position);
        }
        self.snapshot_tx.send_modify(|s| {
            s.current_track = state.track;
            s.next_track = state.next_track;
            s.listener_count = state.listeners;
            s.elapsed_seconds = state.seek_position;
            s.last_updated = Some(now);
        });
        self.last_updated_tx.send_replace(Some(now));
        let _ = self.event_tx.send(event);
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let changed = self.snapshot_tx.send_if_modified(|s| {
            if s.connection_phase == phase {
                return false;
            }
            s.connection_phase = phase;
            true
        });
        if changed {
            debug!(target: LOG_TARGET, "Connection phase: {}", phase);
            let _ = self.event_tx.send(PlayerEvent::PhaseChanged { phase });
        }
    }

    fn set_intent(&self, playing: bool) {
        let changed = self.snapshot_tx.send_if_modified(|s| {
            if s.is_user_requested_playing == playing {
                return false;
            }
            s.is_user_requested_playing = playing;
            true
        });
        if changed {
            let _ = self.event_tx.send(PlayerEvent::IntentChanged { playing });
        }
    }

    fn clear_spectrum(&self) {
        self.spectrum_tx.send_replace(Vec::new());
    }

    async fn start_visualizer(self: &Arc<Self>, generation: u64) {
        let analyser = match self.graph.get_or_init(self.transport.as_ref()).await {
            Ok(analyser) => analyser,
            Err(e) => {
                warn!(target: LOG_TARGET, "Visualizer unavailable: {}", e);
                return;
            }
        };

        let mut control = self.control.lock().await;
        if control.generation != generation
            || self.connection_phase() != ConnectionPhase::Connected
        {
            return;
        }
        let Some(session) = control.session.as_ref() else {
            return;
        };
        let token = session.child_token();
        if let Some(previous) = control.visualizer.replace(token.clone()) {
            previous.cancel();
        }
        drop(control);

        let spectrum_tx = self.spectrum_tx.clone();
        let frame = self.frame_interval;
        tokio::spawn(async move {
            let mut bins = vec![0u8; analyser.bin_count()];
            let mut ticker = tokio::time::interval(frame);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        analyser.frequency_data(&mut bins);
                        // Checked under the channel lock so a stop's clear always wins
                        spectrum_tx.send_if_modified(|frame| {
                            if token.is_cancelled() {
                                return false;
                            }
                            frame.clone_from(&bins);
                            true
                        });
                    }
                }
            }
        });
    }

    fn stop_visualizer(&self, control: &mut Control) {
        if let Some(visualizer) = control.visualizer.take() {
            visualizer.cancel();
        }
        self.clear_spectrum();
    }

    fn spawn_progress_ticker(self: &Arc<Self>, session: CancellationToken) {
        let weak = Arc::downgrade(self);
        let period = self.progress_tick;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = session.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(controller) = weak.upgrade() else { break };
                        controller.snapshot_tx.send_modify(|s| {
                            s.elapsed_seconds = s.elapsed_seconds.saturating_add(1);
                        });
                    }
                }
            }
        });
    }

    fn spawn_metadata_timer(self: &Arc<Self>, session: CancellationToken) {
        let weak = Arc::downgrade(self);
        let period = self.metadata_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = session.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(controller) = weak.upgrade() else { break };
                        controller.refresh_metadata().await;
                    }
                }
            }
        });
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(controller) = weak.upgrade() {
                controller.refresh_metadata().await;
            }
        });
    }

    fn spawn_transport_listener(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut events = self.transport.events();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        let Some(controller) = weak.upgrade() else { break };
                        controller.on_transport_event(event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: LOG_TARGET, "Missed {} transport events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(target: LOG_TARGET, "Transport listener stopped");
        });
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let mut control = self.control.lock().await;
        if !self.is_playing_requested() {
            debug!(target: LOG_TARGET, "Ignoring {:?} while stopped", event);
            return;
        }

        match event {
            TransportEvent::Stalled => {
                if self.connection_phase() == ConnectionPhase::Connected {
                    info!(target: LOG_TARGET, "Stream stalled, buffering");
                    control.stalled = true;
                    self.stop_visualizer(&mut control);
                    self.set_phase(ConnectionPhase::Connecting);
                }
            }
            TransportEvent::Resumed => {
                if control.stalled {
                    info!(target: LOG_TARGET, "Stream resumed");
                    control.stalled = false;
                    self.set_phase(ConnectionPhase::Connected);
                    let generation = control.generation;
                    drop(control);
                    self.start_visualizer(generation).await;
                }
            }
            TransportEvent::Ended => {
                self.fail(
                    &mut control,
                    &TransportError::Unreachable {
                        reason: "stream ended".into(),
                    },
                );
            }
            TransportEvent::Failed { reason } => {
                self.fail(&mut control, &TransportError::Unreachable { reason });
            }
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            self.transport.pause();
            self.transport.detach();
        }
    }
}

#[async_trait]
impl RefreshTarget for StreamController {
    async fn refresh(&self, reason: RefreshReason) {
        match reason {
            RefreshReason::Notification => self.refresh_metadata().await,
            RefreshReason::Initial | RefreshReason::Poll => {
                // While playing, the controller's own timer keeps metadata fresh
                if self.is_playing_requested() {
                    debug!(target: LOG_TARGET, "Skipping {:?} refresh while playing", reason);
                } else {
                    self.refresh_metadata().await;
                }
            }
        }
    }
}

/// Source URL with a fresh cache-busting parameter, keeping other query pairs
fn cache_busted(source: &Url, stamp: u64) -> Url {
    let pairs: Vec<(String, String)> = source
        .query_pairs()
        .filter(|(key, _)| key != CACHE_BUST_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut url = source.clone();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(pairs)
        .append_pair(CACHE_BUST_PARAM, &stamp.to_string());
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::session::MemorySessionStore;
    use crate::track::NowPlaying;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout};

    struct RampAnalyser;

    impl FrequencyAnalyser for RampAnalyser {
        fn bin_count(&self) -> usize {
            4
        }

        fn frequency_data(&self, out: &mut [u8]) {
            for (i, bin) in out.iter_mut().enumerate() {
                *bin = u8::try_from(i * 10).unwrap_or(u8::MAX);
            }
        }
    }

    /// Blocks inside its first frame until the gate opens
    struct GatedAnalyser {
        entered: StdMutex<Option<std::sync::mpsc::Sender<()>>>,
        gate: StdMutex<Option<std::sync::mpsc::Receiver<()>>>,
    }

    impl FrequencyAnalyser for GatedAnalyser {
        fn bin_count(&self) -> usize {
            4
        }

        fn frequency_data(&self, out: &mut [u8]) {
            if let Some(entered) = self.entered.lock().expect("lock").take() {
                let _ = entered.send(());
                let gate = self.gate.lock().expect("lock").take();
                if let Some(gate) = gate {
                    let _ = gate.recv();
                }
            }
            out.fill(200);
        }
    }

    #[derive(Default)]
    struct TransportLog {
        source: Option<Url>,
        attached: Vec<Url>,
        pending: Option<oneshot::Sender<std::result::Result<(), TransportError>>>,
        pauses: usize,
        detaches: usize,
        volume: Option<f32>,
    }

    struct FakeTransport {
        log: StdMutex<TransportLog>,
        gated: bool,
        failure: Option<TransportError>,
        analysers: AtomicUsize,
        analyser: StdMutex<Option<Box<dyn FrequencyAnalyser>>>,
        events: broadcast::Sender<TransportEvent>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Self::build(false, None)
        }

        fn gated() -> Arc<Self> {
            Self::build(true, None)
        }

        fn failing(error: TransportError) -> Arc<Self> {
            Self::build(false, Some(error))
        }

        fn build(gated: bool, failure: Option<TransportError>) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                log: StdMutex::new(TransportLog::default()),
                gated,
                failure,
                analysers: AtomicUsize::new(0),
                analyser: StdMutex::new(None),
                events,
            })
        }

        fn has_pending(&self) -> bool {
            self.log.lock().expect("lock").pending.is_some()
        }

        fn release(&self) {
            if let Some(pending) = self.log.lock().expect("lock").pending.take() {
                let _ = pending.send(Ok(()));
            }
        }

        fn emit(&self, event: TransportEvent) {
            self.events.send(event).expect("controller listening");
        }

        fn with_log<T>(&self, read: impl FnOnce(&TransportLog) -> T) -> T {
            read(&self.log.lock().expect("lock"))
        }
    }

    #[async_trait]
    impl AudioTransport for FakeTransport {
        fn attach(&self, source: &Url) {
            let mut log = self.log.lock().expect("lock");
            log.source = Some(source.clone());
            log.attached.push(source.clone());
        }

        async fn play(&self) -> std::result::Result<(), TransportError> {
            let rx = {
                let mut log = self.log.lock().expect("lock");
                if log.source.is_none() {
                    return Err(TransportError::NoSource);
                }
                if let Some(previous) = log.pending.take() {
                    let _ = previous.send(Err(TransportError::Superseded));
                }
                if let Some(failure) = self.failure.clone() {
                    return Err(failure);
                }
                if !self.gated {
                    return Ok(());
                }
                let (tx, rx) = oneshot::channel();
                log.pending = Some(tx);
                rx
            };
            rx.await.unwrap_or(Err(TransportError::Aborted))
        }

        fn pause(&self) {
            let mut log = self.log.lock().expect("lock");
            log.pauses += 1;
            if let Some(pending) = log.pending.take() {
                let _ = pending.send(Err(TransportError::Aborted));
            }
        }

        fn detach(&self) {
            let mut log = self.log.lock().expect("lock");
            log.detaches += 1;
            log.source = None;
        }

        fn set_volume(&self, volume: f32) {
            self.log.lock().expect("lock").volume = Some(volume);
        }

        fn create_analyser(&self) -> std::result::Result<Box<dyn FrequencyAnalyser>, TransportError> {
            self.analysers.fetch_add(1, Ordering::SeqCst);
            let custom = self.analyser.lock().expect("lock").take();
            Ok(custom.unwrap_or_else(|| Box::new(RampAnalyser)))
        }

        fn events(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }
    }

    #[derive(Default)]
    struct FakeStatus {
        state: StdMutex<Option<StreamState>>,
        calls: AtomicUsize,
    }

    impl FakeStatus {
        fn serving(state: StreamState) -> Arc<Self> {
            let status = Self::default();
            *status.state.lock().expect("lock") = Some(state);
            Arc::new(status)
        }

        fn go_down(&self) {
            self.state.lock().expect("lock").take();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusSource for FakeStatus {
        async fn current_stream_state(&self) -> Result<StreamState> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.state
                .lock()
                .expect("lock")
                .clone()
                .ok_or_else(|| CoreError::BackendStatus {
                    endpoint: "current-stream-state".into(),
                    status: 503,
                })
        }

        async fn now_playing(&self) -> Result<NowPlaying> {
            Ok(NowPlaying::default())
        }
    }

    fn on_air(seek_position: u32, duration: u32) -> StreamState {
        StreamState {
            playing: true,
            track: Some(TrackMetadata::new("7", "Blue Monday", "New Order", duration)),
            next_track: Some(TrackMetadata::new("8", "Age of Consent", "New Order", 315)),
            listeners: 12,
            seek_position,
        }
    }

    fn controller_with(
        transport: Arc<FakeTransport>,
        status: Arc<FakeStatus>,
        sessions: Arc<MemorySessionStore>,
    ) -> Arc<StreamController> {
        let config = PlayerConfig::with_stream_url("https://radio.example.com/live?format=mp3&t=1");
        StreamController::new(&config, transport, status, sessions).expect("valid config")
    }

    fn controller(transport: Arc<FakeTransport>, status: Arc<FakeStatus>) -> Arc<StreamController> {
        controller_with(transport, status, Arc::new(MemorySessionStore::new()))
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<PlayerEvent>,
        matches: impl Fn(&PlayerEvent) -> bool,
    ) -> PlayerEvent {
        timeout(Duration::from_secs(60), async {
            loop {
                let event = events.recv().await.expect("event bus open");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event arrived")
    }

    fn is_refreshed(event: &PlayerEvent) -> bool {
        matches!(event, PlayerEvent::MetadataRefreshed { .. })
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_connects_and_loads_metadata() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(42, 180));
        let controller = controller(transport.clone(), status.clone());
        let mut events = controller.subscribe();

        controller.set_playing(true).await;
        assert_eq!(controller.connection_phase(), ConnectionPhase::Connected);
        assert!(controller.is_playing_requested());

        wait_for(&mut events, is_refreshed).await;
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.elapsed_seconds, 42);
        assert_eq!(snapshot.listener_count, 12);
        assert_eq!(
            snapshot.current_track.map(|t| t.title),
            Some("Blue Monday".to_string())
        );
        assert_eq!(
            snapshot.next_track.map(|t| t.title),
            Some("Age of Consent".to_string())
        );
        assert!(snapshot.last_updated.is_some());
        assert_eq!(*controller.watch_last_updated().borrow(), snapshot.last_updated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_ticks_from_seek_position() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(42, 180));
        let controller = controller(transport, status);
        let mut events = controller.subscribe();

        controller.set_playing(true).await;
        wait_for(&mut events, is_refreshed).await;
        sleep(Duration::from_millis(3_500)).await;

        let progress = controller.progress();
        assert_eq!(progress.elapsed, 45);
        assert_eq!(progress.duration, 180);
        assert!((progress.percent - 25.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_duration_reports_zero_percent() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(30, 0));
        let controller = controller(transport, status);
        let mut events = controller.subscribe();

        controller.set_playing(true).await;
        wait_for(&mut events, is_refreshed).await;
        sleep(Duration::from_millis(2_500)).await;

        let progress = controller.progress();
        assert_eq!(progress.elapsed, 32);
        assert!(progress.percent.abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_timer_resyncs_playhead() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(42, 180));
        let controller = controller(transport, status.clone());
        let mut events = controller.subscribe();

        controller.set_playing(true).await;
        wait_for(&mut events, is_refreshed).await;
        *status.state.lock().expect("lock") = Some(on_air(100, 180));

        sleep(Duration::from_millis(10_100)).await;
        assert_eq!(status.calls(), 2);
        // The tenth progress tick shares the refresh instant
        assert!((100..=101).contains(&controller.snapshot().elapsed_seconds));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rapid_toggle_latest_intent_wins() {
        let transport = FakeTransport::gated();
        let status = FakeStatus::serving(on_air(0, 200));
        let controller = controller(transport.clone(), status);

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.set_playing(true).await }
        });
        while !transport.has_pending() {
            tokio::task::yield_now().await;
        }

        controller.set_playing(false).await;
        assert_eq!(controller.connection_phase(), ConnectionPhase::Offline);

        let third = tokio::spawn({
            let controller = controller.clone();
            async move { controller.set_playing(true).await }
        });
        while !transport.has_pending() {
            tokio::task::yield_now().await;
        }
        transport.release();
        third.await.expect("third request");
        first.await.expect("first request");

        let snapshot = controller.snapshot();
        assert!(snapshot.is_user_requested_playing);
        assert_eq!(snapshot.connection_phase, ConnectionPhase::Connected);
        assert!(transport.with_log(|log| log.source.is_some()));
        assert_eq!(transport.with_log(|log| log.attached.len()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_intent_is_noop() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(0, 200));
        let controller = controller(transport.clone(), status);

        controller.set_playing(false).await;
        assert_eq!(transport.with_log(|log| log.pauses), 0);

        controller.set_playing(true).await;
        controller.set_playing(true).await;
        assert_eq!(transport.with_log(|log| log.attached.len()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_is_cache_busted() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(0, 200));
        let controller = controller(transport.clone(), status);

        controller.set_playing(true).await;
        let source = transport
            .with_log(|log| log.attached.first().cloned())
            .expect("attached");

        let pairs: Vec<(String, String)> = source
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("format".to_string(), "mp3".to_string()));
        assert_eq!(pairs[1].0, CACHE_BUST_PARAM);
        assert_ne!(pairs[1].1, "1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_detaches_and_halts_timers() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(10, 200));
        let controller = controller(transport.clone(), status.clone());
        let mut events = controller.subscribe();

        controller.set_playing(true).await;
        wait_for(&mut events, is_refreshed).await;
        controller.set_playing(false).await;

        assert_eq!(controller.connection_phase(), ConnectionPhase::Offline);
        assert!(!controller.is_playing_requested());
        assert!(transport.with_log(|log| log.source.is_none()));
        assert!(controller.watch_spectrum().borrow().is_empty());

        let elapsed = controller.snapshot().elapsed_seconds;
        let calls = status.calls();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(controller.snapshot().elapsed_seconds, elapsed);
        assert_eq!(status.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_play_failure_enters_error() {
        let transport = FakeTransport::failing(TransportError::Unreachable {
            reason: "connection refused".into(),
        });
        let status = FakeStatus::serving(on_air(0, 200));
        let controller = controller(transport.clone(), status);
        let mut events = controller.subscribe();

        controller.set_playing(true).await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.connection_phase, ConnectionPhase::Error);
        assert!(!snapshot.is_user_requested_playing);
        assert_eq!(transport.with_log(|log| log.detaches), 1);
        wait_for(&mut events, |e| matches!(e, PlayerEvent::PlaybackFailed { .. })).await;

        // Error is left by a new play attempt
        controller.set_playing(true).await;
        assert_eq!(controller.connection_phase(), ConnectionPhase::Error);
        assert_eq!(transport.with_log(|log| log.attached.len()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_and_resume() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(0, 200));
        let controller = controller(transport.clone(), status);

        controller.set_playing(true).await;
        let mut events = controller.subscribe();
        transport.emit(TransportEvent::Stalled);
        wait_for(&mut events, |e| {
            *e == PlayerEvent::PhaseChanged {
                phase: ConnectionPhase::Connecting,
            }
        })
        .await;
        assert!(controller.is_playing_requested());

        transport.emit(TransportEvent::Resumed);
        wait_for(&mut events, |e| {
            *e == PlayerEvent::PhaseChanged {
                phase: ConnectionPhase::Connected,
            }
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_is_error() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(0, 200));
        let controller = controller(transport.clone(), status);
        let mut events = controller.subscribe();

        controller.set_playing(true).await;
        transport.emit(TransportEvent::Ended);
        wait_for(&mut events, |e| {
            *e == PlayerEvent::PhaseChanged {
                phase: ConnectionPhase::Error,
            }
        })
        .await;

        assert!(!controller.is_playing_requested());
        assert!(transport.with_log(|log| log.source.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_analysis_graph_built_once() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(0, 200));
        let controller = controller(transport.clone(), status);

        controller.set_playing(true).await;
        sleep(Duration::from_millis(100)).await;
        assert_eq!(*controller.watch_spectrum().borrow(), vec![0, 10, 20, 30]);

        controller.set_playing(false).await;
        controller.set_playing(true).await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(transport.analysers.load(Ordering::SeqCst), 1);
        assert!(controller.analyser().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_metadata() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(42, 180));
        let controller = controller(transport, status.clone());

        controller.refresh_metadata().await;
        status.go_down();
        controller.refresh_metadata().await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.current_track.map(|t| t.id), Some("7".to_string()));
        assert_eq!(snapshot.connection_phase, ConnectionPhase::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_and_mute() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(0, 200));
        let sessions = Arc::new(MemorySessionStore::new());
        let controller = controller_with(transport.clone(), status, sessions.clone());

        controller.set_volume(0.4);
        controller.set_muted(true);
        assert_eq!(transport.with_log(|log| log.volume), Some(0.0));
        assert!((controller.snapshot().volume - 0.4).abs() < f32::EPSILON);

        controller.set_muted(false);
        assert_eq!(transport.with_log(|log| log.volume), Some(0.4));

        controller.set_volume(3.0);
        assert_eq!(transport.with_log(|log| log.volume), Some(1.0));
        controller.set_volume(f32::NAN);
        assert_eq!(transport.with_log(|log| log.volume), Some(1.0));

        let flags = sessions.load();
        assert!((flags.volume - 1.0).abs() < f32::EPSILON);
        assert!(!flags.muted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restores_volume_from_session() {
        let sessions = Arc::new(MemorySessionStore::new());
        sessions.update(&mut |flags| {
            flags.volume = 0.3;
            flags.muted = true;
        });
        let transport = FakeTransport::new();
        let controller = controller_with(
            transport.clone(),
            FakeStatus::serving(on_air(0, 200)),
            sessions.clone(),
        );

        assert!(controller.snapshot().muted);
        assert_eq!(transport.with_log(|log| log.volume), Some(0.0));

        assert!(!sessions.load().experience_started);
        controller.set_playing(true).await;
        assert!(sessions.load().experience_started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolver_refreshes_defer_to_timer_while_playing() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(0, 200));
        let controller = controller(transport, status.clone());

        controller.refresh(RefreshReason::Poll).await;
        assert_eq!(status.calls(), 1);

        let mut events = controller.subscribe();
        controller.set_playing(true).await;
        wait_for(&mut events, is_refreshed).await;
        let calls = status.calls();

        controller.refresh(RefreshReason::Poll).await;
        assert_eq!(status.calls(), calls);
        controller.refresh(RefreshReason::Notification).await;
        assert_eq!(status.calls(), calls + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(0, 200));
        let controller = controller(transport.clone(), status);

        controller.set_playing(true).await;
        controller.shutdown().await;
        controller.shutdown().await;

        assert_eq!(transport.with_log(|log| log.detaches), 1);
        controller.set_playing(true).await;
        assert_eq!(controller.connection_phase(), ConnectionPhase::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_controller_detaches_transport() {
        let transport = FakeTransport::new();
        let status = FakeStatus::serving(on_air(0, 200));
        let controller = controller(transport.clone(), status);
        let mut events = controller.subscribe();

        controller.set_playing(true).await;
        wait_for(&mut events, is_refreshed).await;
        sleep(Duration::from_millis(10)).await;

        let weak = Arc::downgrade(&controller);
        drop(controller);
        assert!(weak.upgrade().is_none());

        assert_eq!(transport.with_log(|log| log.detaches), 1);
        assert!(transport.with_log(|log| log.source.is_none()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_frame_leaves_spectrum_clear() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let transport = FakeTransport::new();
        *transport.analyser.lock().expect("lock") = Some(Box::new(GatedAnalyser {
            entered: StdMutex::new(Some(entered_tx)),
            gate: StdMutex::new(Some(gate_rx)),
        }));
        let controller = controller(transport, FakeStatus::serving(on_air(0, 200)));

        controller.set_playing(true).await;
        tokio::task::spawn_blocking(move || entered_rx.recv())
            .await
            .expect("join")
            .expect("frame started");

        controller.set_playing(false).await;
        gate_tx.send(()).expect("analyser waiting");
        sleep(Duration::from_millis(100)).await;

        assert!(controller.watch_spectrum().borrow().is_empty());
    }

    #[test]
    fn test_cache_busted_replaces_stamp() {
        let source = Url::parse("https://radio.example.com/live?t=5&bitrate=128").expect("url");
        let busted = cache_busted(&source, 1_700_000_000_000);
        assert_eq!(
            busted.as_str(),
            "https://radio.example.com/live?bitrate=128&t=1700000000000"
        );

        let bare = Url::parse("https://radio.example.com/live").expect("url");
        assert_eq!(
            cache_busted(&bare, 9).as_str(),
            "https://radio.example.com/live?t=9"
        );
    }
}
