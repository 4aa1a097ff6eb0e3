//! Audio transport reading the live stream over HTTP.
//!
//! The transport consumes the stream body and feeds a level meter from the
//! received bytes; decoding and audio output are left to the embedder.

use crate::error::BackendError;
use futures::StreamExt;
use onair_core::{AudioTransport, CoreError, FrequencyAnalyser, PlayerConfig, TransportError, TransportEvent};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const LOG_TARGET: &str = "onair::backend::stream";

const CONNECT_TIMEOUT_SECS: u64 = 10;
const EVENT_BUFFER: usize = 16;
/// Weight of the previous level when smoothing the meter (out of 4)
const DECAY_WEIGHT: u16 = 3;

type Pending = oneshot::Sender<Result<(), TransportError>>;

#[derive(Default)]
struct StreamSession {
    source: Option<Url>,
    /// Cancels the running body pump
    pump: Option<CancellationToken>,
    /// The unsettled play request and its id
    pending: Option<(u64, Pending)>,
    next_id: u64,
}

impl StreamSession {
    fn settle(&mut self, id: u64, outcome: Result<(), TransportError>) {
        if self.pending.as_ref().is_some_and(|(pending, _)| *pending == id)
            && let Some((_, tx)) = self.pending.take()
        {
            let _ = tx.send(outcome);
        }
    }

    fn abort_pending(&mut self, error: TransportError) {
        if let Some((_, tx)) = self.pending.take() {
            let _ = tx.send(Err(error));
        }
    }

    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }
    }
}

/// Byte-energy level meter shared between the pump and its analysers.
#[derive(Debug)]
pub struct LevelMeter {
    levels: Mutex<Vec<u8>>,
}

impl LevelMeter {
    #[must_use]
    pub fn new(bins: usize) -> Self {
        Self {
            levels: Mutex::new(vec![0; bins.max(1)]),
        }
    }

    #[must_use]
    pub fn bin_count(&self) -> usize {
        self.levels.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Fold a received chunk into the meter.
    ///
    /// The chunk is split evenly across the bins; each bin's level is the
    /// mean distance of its bytes from the midpoint, scaled to 0-255 and
    /// smoothed against the previous level.
    pub fn feed(&self, chunk: &[u8]) {
        let mut levels = self.levels.lock().unwrap_or_else(PoisonError::into_inner);
        let bins = levels.len();
        if chunk.is_empty() || bins == 0 {
            return;
        }

        let span = chunk.len().div_ceil(bins);
        for (level, part) in levels.iter_mut().zip(chunk.chunks(span)) {
            let energy: usize = part
                .iter()
                .map(|byte| usize::from(byte.abs_diff(128)))
                .sum();
            // Distance from the midpoint is at most 128, so this fits in 0..=256
            let mean = (energy * 2 / part.len()).min(255);
            let current = u16::try_from(mean).unwrap_or(255);
            let smoothed = (u16::from(*level) * DECAY_WEIGHT + current) / (DECAY_WEIGHT + 1);
            *level = u8::try_from(smoothed).unwrap_or(u8::MAX);
        }
    }

    pub fn clear(&self) {
        self.levels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill(0);
    }

    fn read(&self, out: &mut [u8]) {
        let levels = self.levels.lock().unwrap_or_else(PoisonError::into_inner);
        let n = out.len().min(levels.len());
        out[..n].copy_from_slice(&levels[..n]);
        out[n..].fill(0);
    }
}

struct ChunkLevelAnalyser {
    meter: Arc<LevelMeter>,
}

impl FrequencyAnalyser for ChunkLevelAnalyser {
    fn bin_count(&self) -> usize {
        self.meter.bin_count()
    }

    fn frequency_data(&self, out: &mut [u8]) {
        self.meter.read(out);
    }
}

/// HTTP live-stream transport.
pub struct HttpStreamTransport {
    client: reqwest::Client,
    stall_timeout: Duration,
    session: Arc<Mutex<StreamSession>>,
    meter: Arc<LevelMeter>,
    volume: AtomicU32,
    events: broadcast::Sender<TransportEvent>,
}

impl HttpStreamTransport {
    /// Create a transport using the player config's stall window and bin count.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &PlayerConfig) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(concat!("onair/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(BackendError::from)?;
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        Ok(Self {
            client,
            stall_timeout: config.stall_timeout().max(Duration::from_millis(1)),
            session: Arc::new(Mutex::new(StreamSession::default())),
            meter: Arc::new(LevelMeter::new(config.frequency_bins)),
            volume: AtomicU32::new(1.0_f32.to_bits()),
            events,
        })
    }

    /// Last applied effective volume
    #[must_use]
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HttpStreamTransport {
    fn drop(&mut self) {
        let mut session = self.lock();
        session.abort_pending(TransportError::Aborted);
        session.stop_pump();
    }
}

#[async_trait::async_trait]
impl AudioTransport for HttpStreamTransport {
    fn attach(&self, source: &Url) {
        let mut session = self.lock();
        session.abort_pending(TransportError::Aborted);
        session.stop_pump();
        session.source = Some(source.clone());
        debug!(target: LOG_TARGET, "Attached {}", source);
    }

    async fn play(&self) -> Result<(), TransportError> {
        let rx = {
            let mut session = self.lock();
            let Some(source) = session.source.clone() else {
                return Err(TransportError::NoSource);
            };
            session.abort_pending(TransportError::Superseded);
            session.stop_pump();

            session.next_id += 1;
            let id = session.next_id;
            let (tx, rx) = oneshot::channel();
            session.pending = Some((id, tx));

            let cancel = CancellationToken::new();
            session.pump = Some(cancel.clone());

            let pump = Pump {
                id,
                client: self.client.clone(),
                source,
                stall_timeout: self.stall_timeout,
                session: self.session.clone(),
                meter: self.meter.clone(),
                events: self.events.clone(),
                cancel,
            };
            tokio::spawn(pump.run());
            rx
        };

        rx.await.unwrap_or(Err(TransportError::Aborted))
    }

    fn pause(&self) {
        let mut session = self.lock();
        session.abort_pending(TransportError::Aborted);
        session.stop_pump();
        self.meter.clear();
    }

    fn detach(&self) {
        self.pause();
        if let Some(source) = self.lock().source.take() {
            debug!(target: LOG_TARGET, "Detached {}", source);
        }
    }

    fn set_volume(&self, volume: f32) {
        self.volume.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    fn create_analyser(&self) -> Result<Box<dyn FrequencyAnalyser>, TransportError> {
        Ok(Box::new(ChunkLevelAnalyser {
            meter: self.meter.clone(),
        }))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Reads one stream connection until it ends or is cancelled
struct Pump {
    id: u64,
    client: reqwest::Client,
    source: Url,
    stall_timeout: Duration,
    session: Arc<Mutex<StreamSession>>,
    meter: Arc<LevelMeter>,
    events: broadcast::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl Pump {
    fn settle(&self, outcome: Result<(), TransportError>) {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settle(self.id, outcome);
    }

    fn unreachable(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(target: LOG_TARGET, "Stream unreachable: {}", reason);
        self.settle(Err(TransportError::Unreachable { reason }));
    }

    fn publish(&self, event: TransportEvent) {
        if !self.cancel.is_cancelled() {
            let _ = self.events.send(event);
        }
    }

    async fn run(self) {
        let response = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            response = self.client.get(self.source.clone()).send() => response,
        };
        let response = match response.and_then(reqwest::Response::error_for_status) {
            Ok(response) => response,
            Err(e) => {
                self.unreachable(e.to_string());
                return;
            }
        };

        let mut body = response.bytes_stream();
        let mut started = false;
        let mut stalled = false;
        let mut total_bytes: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                next = tokio::time::timeout(self.stall_timeout, body.next()) => next,
            };

            match next {
                Ok(Some(Ok(chunk))) => {
                    total_bytes = total_bytes.saturating_add(u64::try_from(chunk.len()).unwrap_or(u64::MAX));
                    self.meter.feed(&chunk);
                    if !started {
                        started = true;
                        info!(target: LOG_TARGET, "Audio flowing from {}", self.source);
                        self.settle(Ok(()));
                    } else if stalled {
                        stalled = false;
                        self.publish(TransportEvent::Resumed);
                    }
                }
                Ok(Some(Err(e))) => {
                    if started {
                        warn!(target: LOG_TARGET, "Stream read failed after {} bytes: {}", total_bytes, e);
                        self.publish(TransportEvent::Failed {
                            reason: e.to_string(),
                        });
                    } else {
                        self.unreachable(e.to_string());
                    }
                    return;
                }
                Ok(None) => {
                    if started {
                        info!(target: LOG_TARGET, "Stream ended after {} bytes", total_bytes);
                        self.publish(TransportEvent::Ended);
                    } else {
                        self.unreachable("stream closed before audio arrived");
                    }
                    return;
                }
                Err(_) => {
                    if !started {
                        self.unreachable(format!("no audio within {:?}", self.stall_timeout));
                        return;
                    }
                    if !stalled {
                        stalled = true;
                        self.meter.clear();
                        debug!(target: LOG_TARGET, "No audio for {:?}", self.stall_timeout);
                        self.publish(TransportEvent::Stalled);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    const HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: audio/mpeg\r\nConnection: close\r\n\r\n";

    fn transport(stall_ms: u64) -> HttpStreamTransport {
        let mut config = PlayerConfig::with_stream_url("http://127.0.0.1/live");
        config.stall_timeout_ms = stall_ms;
        config.frequency_bins = 4;
        HttpStreamTransport::new(&config).unwrap()
    }

    /// Serve one stream connection: a chunk, a pause, another chunk, then EOF
    async fn serve_stream(pause: Duration) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(HEADERS).await.unwrap();
            socket.write_all(&[255u8; 64]).await.unwrap();
            socket.flush().await.unwrap();
            sleep(pause).await;
            socket.write_all(&[0u8; 64]).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        Url::parse(&format!("http://{addr}/live?t=1")).unwrap()
    }

    /// Stream chunks until the client goes away, then report it
    async fn serve_endless() -> (Url, oneshot::Receiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (gone_tx, gone_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            socket.write_all(HEADERS).await.unwrap();
            loop {
                if socket.write_all(&[200u8; 1024]).await.is_err() {
                    let _ = gone_tx.send(());
                    return;
                }
                sleep(Duration::from_millis(10)).await;
            }
        });
        (Url::parse(&format!("http://{addr}/live")).unwrap(), gone_rx)
    }

    /// Accept connections and never answer
    async fn serve_silence() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        Url::parse(&format!("http://{addr}/live")).unwrap()
    }

    #[test]
    fn test_level_meter_tracks_energy() {
        let meter = LevelMeter::new(2);
        let mut quiet = [0u8; 2];

        meter.feed(&[128; 32]);
        meter.read(&mut quiet);
        assert_eq!(quiet, [0, 0]);

        meter.feed(&[128, 128, 0, 255]);
        let mut loud = [0u8; 3];
        meter.read(&mut loud);
        assert_eq!(loud[0], 0);
        assert!(loud[1] > 0);
        assert_eq!(loud[2], 0);

        meter.clear();
        meter.read(&mut loud);
        assert_eq!(loud, [0, 0, 0]);
    }

    #[tokio::test]
    async fn test_play_without_source() {
        let transport = transport(1_000);
        assert_eq!(transport.play().await, Err(TransportError::NoSource));
    }

    #[tokio::test]
    async fn test_play_resolves_on_first_chunk_then_stall_resume_end() {
        let transport = transport(200);
        let mut events = transport.events();
        let source = serve_stream(Duration::from_millis(600)).await;

        transport.attach(&source);
        timeout(Duration::from_secs(5), transport.play())
            .await
            .unwrap()
            .unwrap();

        let analyser = transport.create_analyser().unwrap();
        let mut bins = vec![0u8; analyser.bin_count()];
        analyser.frequency_data(&mut bins);
        assert!(bins.iter().all(|level| *level > 0));

        let wait = Duration::from_secs(5);
        assert_eq!(timeout(wait, events.recv()).await.unwrap().unwrap(), TransportEvent::Stalled);
        assert_eq!(timeout(wait, events.recv()).await.unwrap().unwrap(), TransportEvent::Resumed);
        assert_eq!(timeout(wait, events.recv()).await.unwrap().unwrap(), TransportEvent::Ended);
    }

    #[tokio::test]
    async fn test_newer_play_supersedes_and_pause_aborts() {
        let transport = Arc::new(transport(30_000));
        let source = serve_silence().await;
        transport.attach(&source);

        let first = tokio::spawn({
            let transport = transport.clone();
            async move { transport.play().await }
        });
        sleep(Duration::from_millis(50)).await;

        let second = tokio::spawn({
            let transport = transport.clone();
            async move { transport.play().await }
        });
        assert_eq!(first.await.unwrap(), Err(TransportError::Superseded));

        sleep(Duration::from_millis(50)).await;
        transport.pause();
        assert_eq!(second.await.unwrap(), Err(TransportError::Aborted));
    }

    #[tokio::test]
    async fn test_drop_closes_stream_connection() {
        let transport = transport(30_000);
        let (source, gone) = serve_endless().await;

        transport.attach(&source);
        timeout(Duration::from_secs(5), transport.play())
            .await
            .unwrap()
            .unwrap();
        drop(transport);

        timeout(Duration::from_secs(5), gone).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = transport(1_000);
        transport.attach(&Url::parse(&format!("http://{addr}/live")).unwrap());
        let result = timeout(Duration::from_secs(5), transport.play()).await.unwrap();
        assert!(matches!(result, Err(TransportError::Unreachable { .. })));
    }

    #[test]
    fn test_volume_is_clamped() {
        let transport = transport(1_000);
        transport.set_volume(1.7);
        assert!((transport.volume() - 1.0).abs() < f32::EPSILON);
        transport.set_volume(0.25);
        assert!((transport.volume() - 0.25).abs() < f32::EPSILON);
    }
}
