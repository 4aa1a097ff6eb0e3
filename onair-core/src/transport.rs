//! Audio transport contract and the guarded analysis graph.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::{OnceCell, broadcast};
use tracing::debug;
use url::Url;

const LOG_TARGET: &str = "onair::transport";

/// Failures reported by an [`AudioTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A newer play request replaced this one
    #[error("play request superseded by a newer request")]
    Superseded,

    /// Playback was paused or detached before the play request settled
    #[error("play request aborted by pause or detach")]
    Aborted,

    #[error("no stream source attached")]
    NoSource,

    #[error("stream unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("stream could not be decoded: {reason}")]
    Decode { reason: String },

    #[error("audio analysis unavailable: {reason}")]
    Analysis { reason: String },
}

impl TransportError {
    /// Whether the failure only means a newer intent took over.
    ///
    /// These are expected under rapid toggling and are not errors.
    #[must_use]
    pub const fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded | Self::Aborted)
    }
}

/// Unsolicited lifecycle events from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Audio stopped arriving
    Stalled,
    /// Audio is flowing again after a stall
    Resumed,
    /// The stream ended
    Ended,
    /// The connection failed after playback had started
    Failed { reason: String },
}

/// The network audio connection.
///
/// One transport backs exactly one [`StreamController`](crate::StreamController).
#[async_trait]
pub trait AudioTransport: Send + Sync {
    /// Point the transport at a stream source without starting it
    fn attach(&self, source: &Url);

    /// Start playback of the attached source.
    ///
    /// Resolves once audio flows. A later `play`, `pause` or `detach` makes a
    /// pending call fail with an error for which
    /// [`TransportError::is_superseded`] is true.
    ///
    /// # Errors
    ///
    /// Returns an error if playback cannot start.
    async fn play(&self) -> Result<(), TransportError>;

    /// Stop playback, keeping the source attached
    fn pause(&self);

    /// Drop the source and stop consuming network bandwidth
    fn detach(&self);

    /// Apply an effective volume in `0.0..=1.0`
    fn set_volume(&self, volume: f32);

    /// Build a frequency analyser tapping this transport's audio.
    ///
    /// Called at most once per transport through [`AnalysisGraph`].
    ///
    /// # Errors
    ///
    /// Returns an error if the platform cannot provide analysis.
    fn create_analyser(&self) -> Result<Box<dyn FrequencyAnalyser>, TransportError>;

    /// Subscribe to lifecycle events
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Frequency-domain tap on the audio graph.
pub trait FrequencyAnalyser: Send + Sync {
    /// Number of frequency bins produced per sample
    fn bin_count(&self) -> usize;

    /// Fill `out` with the current amplitude per bin (0-255)
    fn frequency_data(&self, out: &mut [u8]);
}

/// Lazily built analysis graph for one transport.
///
/// The audio-processing graph can be constructed at most once per transport,
/// so every caller goes through [`get_or_init`](Self::get_or_init) and shares
/// the handle built first.
#[derive(Default)]
pub struct AnalysisGraph {
    analyser: OnceCell<Arc<dyn FrequencyAnalyser>>,
    attempts: AtomicUsize,
}

impl AnalysisGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the analyser, building it on first use.
    ///
    /// A failed build leaves the slot empty so a later call may retry.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the analyser cannot be built.
    pub async fn get_or_init(
        &self,
        transport: &dyn AudioTransport,
    ) -> Result<Arc<dyn FrequencyAnalyser>, TransportError> {
        self.analyser
            .get_or_try_init(|| async {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                debug!(target: LOG_TARGET, "Building audio analysis graph");
                transport.create_analyser().map(Arc::from)
            })
            .await
            .cloned()
    }

    /// The analyser, if it has been built
    #[must_use]
    pub fn get(&self) -> Option<Arc<dyn FrequencyAnalyser>> {
        self.analyser.get().cloned()
    }

    /// Number of build attempts so far
    #[must_use]
    pub fn build_attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}
