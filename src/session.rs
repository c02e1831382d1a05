//! One live stream: a dedicated ingestion thread, a latest-frame viewer feed,
//! a published counting snapshot, and an optional relay.

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use crate::frame::{AnnotatedFrame, FrameSink, TrackId};
use crate::ingest::FrameSource;
use crate::pipeline::FramePipeline;
use crate::relay::{RelayConduit, RelayStats};
use crate::task::{CancelToken, TaskHandle};

pub const DEFAULT_VIEWER_CAPACITY: usize = 1;
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 25;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub viewer_capacity: usize,
    /// Default wait for `get_latest_frame`.
    pub frame_timeout: Duration,
    /// Bound on joining the ingestion thread during stop.
    pub stop_timeout: Duration,
    /// Consecutive pipeline failures that end the session.
    pub max_consecutive_errors: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            viewer_capacity: DEFAULT_VIEWER_CAPACITY,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Why the ingestion task ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// Stopped on request.
    Stopped,
    /// The source reported end of stream.
    SourceEnded,
    SourceFailed(String),
    PipelineFailed(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub total_count: u64,
    pub current_count: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct StreamInfo {
    pub id: String,
    pub input_url: String,
    pub rtsp_url: Option<String>,
    pub state: SessionState,
    pub termination: Option<Termination>,
    pub statistics: StreamStats,
    /// Frames delivered by the source, including ones that failed processing.
    pub frames_captured: u64,
    pub frames_processed: u64,
    pub frame_errors: u64,
    pub relay: Option<RelayStats>,
}

#[derive(Debug, Default)]
struct CountSnapshot {
    total_count: u64,
    current_ids: Vec<TrackId>,
}

struct Shared {
    id: String,
    state: Mutex<SessionState>,
    termination: Mutex<Option<Termination>>,
    snapshot: RwLock<Arc<CountSnapshot>>,
    viewer: FrameSink<AnnotatedFrame>,
    frames_captured: AtomicU64,
    frames_processed: AtomicU64,
    frame_errors: AtomicU64,
    relay: Option<Arc<RelayConduit>>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        *lock(&self.state) = state;
    }

    fn publish(&self, frame: &AnnotatedFrame) {
        let snapshot = Arc::new(CountSnapshot {
            total_count: frame.total_count(),
            current_ids: frame.current_ids().to_vec(),
        });
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    fn snapshot(&self) -> Arc<CountSnapshot> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn stop_relay(&self) {
        if let Some(relay) = &self.relay {
            if let Err(err) = relay.stop() {
                log::warn!("stream {}: relay teardown failed: {:#}", self.id, err);
            }
        }
    }

    /// Record the terminal status (first writer wins) and mark the session stopped.
    fn finish(&self, termination: Termination) {
        {
            let mut slot = lock(&self.termination);
            if slot.is_none() {
                match &termination {
                    Termination::Stopped => log::info!("stream {} stopped", self.id),
                    Termination::SourceEnded => log::info!("stream {}: source ended", self.id),
                    Termination::SourceFailed(reason) => {
                        log::error!("stream {}: source failed: {}", self.id, reason)
                    }
                    Termination::PipelineFailed(reason) => {
                        log::error!("stream {}: pipeline failed: {}", self.id, reason)
                    }
                }
                *slot = Some(termination);
            }
        }
        self.set_state(SessionState::Stopped);
    }
}

// ----------------------------------------------------------------------------
// StreamSession
// ----------------------------------------------------------------------------

pub struct StreamSession {
    shared: Arc<Shared>,
    source_uri: String,
    settings: SessionSettings,
    task: Mutex<Option<TaskHandle<()>>>,
}

impl StreamSession {
    /// A session in `Starting` state. Nothing runs until `launch`.
    pub fn new(
        id: &str,
        source_uri: &str,
        relay: Option<Arc<RelayConduit>>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: id.to_string(),
                state: Mutex::new(SessionState::Starting),
                termination: Mutex::new(None),
                snapshot: RwLock::new(Arc::new(CountSnapshot::default())),
                viewer: FrameSink::new(settings.viewer_capacity),
                frames_captured: AtomicU64::new(0),
                frames_processed: AtomicU64::new(0),
                frame_errors: AtomicU64::new(0),
                relay,
            }),
            source_uri: source_uri.to_string(),
            settings,
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn source_uri(&self) -> &str {
        &self.source_uri
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn relay(&self) -> Option<&Arc<RelayConduit>> {
        self.shared.relay.as_ref()
    }

    pub fn relay_url(&self) -> Option<String> {
        self.shared.relay.as_ref().and_then(|relay| relay.url())
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.shared.state)
    }

    pub fn termination(&self) -> Option<Termination> {
        lock(&self.shared.termination).clone()
    }

    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Stopped
    }

    /// Spawn the ingestion thread and move Starting -> Running.
    pub fn launch(&self, source: Box<dyn FrameSource>, pipeline: FramePipeline) -> Result<()> {
        let mut state = lock(&self.shared.state);
        if *state != SessionState::Starting {
            bail!("stream {} is {:?}; cannot launch", self.id(), *state);
        }
        let shared = Arc::clone(&self.shared);
        let max_errors = self.settings.max_consecutive_errors.max(1);
        let task = TaskHandle::spawn(format!("ingest-{}", self.id()), move |cancel| {
            let termination = ingest(&shared, source, pipeline, &cancel, max_errors);
            shared.stop_relay();
            shared.finish(termination);
        })?;
        *lock(&self.task) = Some(task);
        *state = SessionState::Running;
        log::info!("stream {} running ({})", self.id(), self.source_uri);
        Ok(())
    }

    /// Cancel the ingestion thread, join it (bounded), tear down the relay.
    ///
    /// Safe to call on a session that already terminated on its own.
    pub fn stop(&self) -> Result<()> {
        {
            let mut state = lock(&self.shared.state);
            if *state != SessionState::Stopped {
                *state = SessionState::Stopping;
            }
        }
        let task = lock(&self.task).take();
        let mut outcome = Ok(());
        if let Some(mut task) = task {
            if let Err(err) = task.stop(self.settings.stop_timeout) {
                outcome = Err(err);
            }
        }
        self.shared.stop_relay();
        self.shared.finish(Termination::Stopped);
        outcome
    }

    /// Wait up to `timeout` for the next annotated frame.
    pub fn get_latest_frame(&self, timeout: Duration) -> Option<AnnotatedFrame> {
        self.shared.viewer.pop(timeout)
    }

    pub fn stats(&self) -> StreamStats {
        let snapshot = self.shared.snapshot();
        StreamStats {
            total_count: snapshot.total_count,
            current_count: snapshot.current_ids.len(),
        }
    }

    /// Ids confirmed in the most recently processed frame.
    pub fn current_ids(&self) -> Vec<TrackId> {
        self.shared.snapshot().current_ids.clone()
    }

    pub fn frames_captured(&self) -> u64 {
        self.shared.frames_captured.load(Ordering::Relaxed)
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared.frames_processed.load(Ordering::Relaxed)
    }

    pub fn frame_errors(&self) -> u64 {
        self.shared.frame_errors.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id().to_string(),
            input_url: self.source_uri.clone(),
            rtsp_url: self.relay_url(),
            state: self.state(),
            termination: self.termination(),
            statistics: self.stats(),
            frames_captured: self.frames_captured(),
            frames_processed: self.frames_processed(),
            frame_errors: self.frame_errors(),
            relay: self.shared.relay.as_ref().map(|relay| relay.stats()),
        }
    }
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.shared.id)
            .field("source_uri", &self.source_uri)
            .field("state", &self.state())
            .finish()
    }
}

fn ingest(
    shared: &Shared,
    mut source: Box<dyn FrameSource>,
    mut pipeline: FramePipeline,
    cancel: &CancelToken,
    max_errors: u32,
) -> Termination {
    if let Err(err) = source.connect() {
        return Termination::SourceFailed(format!("{:#}", err));
    }
    if let Err(err) = pipeline.warm_up() {
        return Termination::PipelineFailed(format!("{:#}", err));
    }

    let mut consecutive_errors = 0u32;
    while !cancel.is_cancelled() {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Termination::SourceEnded,
            Err(err) => return Termination::SourceFailed(format!("{:#}", err)),
        };
        shared
            .frames_captured
            .store(source.stats().frames_captured, Ordering::Relaxed);
        match pipeline.process(frame) {
            Ok(annotated) => {
                consecutive_errors = 0;
                shared.frames_processed.fetch_add(1, Ordering::Relaxed);
                shared.publish(&annotated);
                if let Some(relay) = &shared.relay {
                    relay.put_frame(annotated.image());
                }
                shared.viewer.push(annotated);
            }
            Err(err) => {
                consecutive_errors += 1;
                shared.frame_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "stream {}: frame failed ({}/{}): {:#}",
                    shared.id,
                    consecutive_errors,
                    max_errors,
                    err
                );
                if consecutive_errors >= max_errors {
                    return Termination::PipelineFailed(format!("{:#}", err));
                }
            }
        }
    }
    Termination::Stopped
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection, Detector, ObjectClass};
    use crate::frame::Frame;
    use crate::ingest::{open_source, IngestSettings};
    use crate::pipeline::PipelineConfig;
    use crate::track::{IouTracker, TrackerConfig};

    struct FixedDetector {
        fail: bool,
    }

    impl Detector for FixedDetector {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            if self.fail {
                bail!("model crashed");
            }
            Ok(vec![Detection {
                bbox: BoundingBox::from_ltrb(2.0, 2.0, 12.0, 10.0),
                class: ObjectClass::Vehicle,
                confidence: 0.9,
            }])
        }
    }

    fn pipeline(fail: bool) -> FramePipeline {
        FramePipeline::new(
            Box::new(FixedDetector { fail }),
            Box::new(IouTracker::new(TrackerConfig {
                min_hits: 1,
                ..TrackerConfig::default()
            })),
            PipelineConfig::default(),
        )
    }

    fn source(uri: &str) -> Box<dyn FrameSource> {
        open_source(uri, &IngestSettings::default()).unwrap()
    }

    fn wait_stopped(session: &StreamSession) {
        for _ in 0..500 {
            if !session.is_active() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("session did not stop");
    }

    #[test]
    fn finite_source_ends_session() {
        let session = StreamSession::new("a", "stub://a", None, SessionSettings::default());
        session
            .launch(source("stub://a?frames=5&fps=0&width=32&height=24"), pipeline(false))
            .unwrap();
        wait_stopped(&session);
        assert_eq!(session.termination(), Some(Termination::SourceEnded));
        assert_eq!(session.frames_processed(), 5);
        assert_eq!(session.stats(), StreamStats { total_count: 1, current_count: 1 });
        session.stop().unwrap();
        assert_eq!(session.termination(), Some(Termination::SourceEnded));
    }

    #[test]
    fn repeated_pipeline_errors_end_session() {
        let settings = SessionSettings {
            max_consecutive_errors: 3,
            ..SessionSettings::default()
        };
        let session = StreamSession::new("b", "stub://b", None, settings);
        session
            .launch(source("stub://b?fps=0&width=8&height=8"), pipeline(true))
            .unwrap();
        wait_stopped(&session);
        assert!(matches!(
            session.termination(),
            Some(Termination::PipelineFailed(_))
        ));
        assert_eq!(session.frame_errors(), 3);
        assert_eq!(session.frames_processed(), 0);
        let info = session.info();
        assert_eq!(info.frames_captured, 3);
        assert_eq!(info.frames_processed, 0);
    }

    #[test]
    fn source_failure_is_reported() {
        let session = StreamSession::new("c", "stub://c", None, SessionSettings::default());
        session
            .launch(source("stub://c?fail_after=2&fps=0&width=8&height=8"), pipeline(false))
            .unwrap();
        wait_stopped(&session);
        assert!(matches!(
            session.termination(),
            Some(Termination::SourceFailed(_))
        ));
    }

    #[test]
    fn stop_cancels_live_session() {
        let session = StreamSession::new("d", "stub://d", None, SessionSettings::default());
        session
            .launch(source("stub://d?width=16&height=16"), pipeline(false))
            .unwrap();
        assert_eq!(session.state(), SessionState::Running);
        let frame = session.get_latest_frame(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.current_count(), frame.current_ids().len());
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.termination(), Some(Termination::Stopped));
        assert!(session.launch(source("stub://d"), pipeline(false)).is_err());
    }
}
