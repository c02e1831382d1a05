//! Per-frame processing: detect, filter, track, annotate, count.

use anyhow::{Context, Result};
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::sync::Arc;

use crate::count::{TrackCountWindow, DEFAULT_COUNT_WINDOW};
use crate::detect::{BackendRegistry, Detection, Detector, ObjectClass};
use crate::frame::{AnnotatedFrame, Frame, PixelBuffer, TrackId};
use crate::track::{IouTracker, Track, TrackInput, Tracker, TrackerConfig};

pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
pub const DEFAULT_BOX_THICKNESS: u32 = 2;
/// (0, 255, 0) is green in both BGR and RGB order.
pub const DEFAULT_BOX_COLOR: [u8; 3] = [0, 255, 0];

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    pub target_class: ObjectClass,
    /// Detections at or below this confidence are discarded.
    pub min_confidence: f32,
    pub count_window: usize,
    pub box_color: [u8; 3],
    pub box_thickness: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_class: ObjectClass::Vehicle,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            count_window: DEFAULT_COUNT_WINDOW,
            box_color: DEFAULT_BOX_COLOR,
            box_thickness: DEFAULT_BOX_THICKNESS,
        }
    }
}

// ----------------------------------------------------------------------------
// FramePipeline
// ----------------------------------------------------------------------------

/// Owns one session's detector, tracker and counting window.
pub struct FramePipeline {
    detector: Box<dyn Detector>,
    tracker: Box<dyn Tracker>,
    window: TrackCountWindow,
    config: PipelineConfig,
}

impl FramePipeline {
    pub fn new(
        detector: Box<dyn Detector>,
        tracker: Box<dyn Tracker>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            detector,
            tracker,
            window: TrackCountWindow::new(config.count_window),
            config,
        }
    }

    pub fn warm_up(&mut self) -> Result<()> {
        self.detector
            .warm_up()
            .with_context(|| format!("warm up detector {}", self.detector.name()))
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    pub fn tracker_name(&self) -> &'static str {
        self.tracker.name()
    }

    pub fn total_count(&self) -> u64 {
        self.window.total_count()
    }

    /// Run one frame through the pipeline.
    ///
    /// Detector and tracker errors are returned as-is; the counting window is
    /// only touched after both succeed.
    pub fn process(&mut self, frame: Frame) -> Result<AnnotatedFrame> {
        let detections = self.detector.infer(&frame)?;
        let inputs = self.select(&detections);

        if inputs.is_empty() {
            if self.tracker.wants_empty_updates() {
                self.tracker.update(&[], &frame)?;
            }
            return Ok(AnnotatedFrame::new(
                frame,
                self.window.total_count(),
                Vec::new(),
            ));
        }

        let confirmed: Vec<Track> = self
            .tracker
            .update(&inputs, &frame)?
            .into_iter()
            .filter(|track| track.confirmed)
            .collect();

        let mut current_ids: Vec<TrackId> = Vec::with_capacity(confirmed.len());
        for track in &confirmed {
            if self.window.observe(track.id) {
                log::debug!("new track {} (total {})", track.id, self.window.total_count());
            }
            current_ids.push(track.id);
        }

        let image = if confirmed.is_empty() {
            frame
        } else {
            let mut buffer = frame.into_buffer();
            for track in &confirmed {
                draw_box(
                    &mut buffer,
                    track,
                    self.config.box_color,
                    self.config.box_thickness,
                );
            }
            Frame::from_buffer(buffer)
        };

        Ok(AnnotatedFrame::new(
            image,
            self.window.total_count(),
            current_ids,
        ))
    }

    fn select(&self, detections: &[Detection]) -> Vec<TrackInput> {
        detections
            .iter()
            .filter(|d| d.class == self.config.target_class)
            .filter(|d| d.confidence > self.config.min_confidence)
            .map(|d| TrackInput {
                left: d.bbox.x1,
                top: d.bbox.y1,
                width: d.bbox.width(),
                height: d.bbox.height(),
                confidence: d.confidence,
                label: d.class,
            })
            .collect()
    }
}

/// Draw a hollow rectangle `thickness` pixels wide, growing inwards.
fn draw_box(buffer: &mut PixelBuffer, track: &Track, color: [u8; 3], thickness: u32) {
    let left = track.bbox.x1.round() as i32;
    let top = track.bbox.y1.round() as i32;
    let width = track.bbox.width().round() as i64;
    let height = track.bbox.height().round() as i64;
    for inset in 0..thickness.max(1) as i64 {
        let w = width - 2 * inset;
        let h = height - 2 * inset;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = Rect::at(left + inset as i32, top + inset as i32).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(buffer, rect, Rgb(color));
    }
}

// ----------------------------------------------------------------------------
// Factories
// ----------------------------------------------------------------------------

/// Builds a fresh pipeline for each new session.
pub trait PipelineFactory: Send + Sync {
    fn build(&self, session_id: &str) -> Result<FramePipeline>;
}

impl<F> PipelineFactory for F
where
    F: Fn(&str) -> Result<FramePipeline> + Send + Sync,
{
    fn build(&self, session_id: &str) -> Result<FramePipeline> {
        self(session_id)
    }
}

/// The registry's default detector plus the reference `IouTracker`.
#[derive(Clone)]
pub struct DefaultPipelineFactory {
    detectors: Arc<BackendRegistry>,
    tracker: TrackerConfig,
    pipeline: PipelineConfig,
}

impl DefaultPipelineFactory {
    pub fn new(
        detectors: Arc<BackendRegistry>,
        tracker: TrackerConfig,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            detectors,
            tracker,
            pipeline,
        }
    }
}

impl PipelineFactory for DefaultPipelineFactory {
    fn build(&self, session_id: &str) -> Result<FramePipeline> {
        let detector = self
            .detectors
            .create_default()
            .with_context(|| format!("create detector for session {}", session_id))?;
        Ok(FramePipeline::new(
            detector,
            Box::new(IouTracker::new(self.tracker)),
            self.pipeline.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;
    use std::sync::{Arc, Mutex};

    /// Detector that replays a script of per-frame detections.
    struct ScriptedDetector {
        script: Vec<Vec<Detection>>,
        cursor: usize,
    }

    impl Detector for ScriptedDetector {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn infer(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            let out = self.script.get(self.cursor).cloned().unwrap_or_default();
            self.cursor += 1;
            Ok(out)
        }
    }

    /// Tracker that confirms every input with a fixed id sequence and records calls.
    struct EchoTracker {
        ids: Vec<u64>,
        calls: Arc<Mutex<Vec<usize>>>,
        empty_updates: bool,
    }

    impl Tracker for EchoTracker {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn update(&mut self, detections: &[TrackInput], _frame: &Frame) -> Result<Vec<Track>> {
            self.calls.lock().unwrap().push(detections.len());
            Ok(detections
                .iter()
                .zip(&self.ids)
                .map(|(d, id)| Track {
                    id: TrackId(*id),
                    confirmed: true,
                    bbox: d.bbox(),
                })
                .collect())
        }

        fn wants_empty_updates(&self) -> bool {
            self.empty_updates
        }
    }

    fn det(class: ObjectClass, confidence: f32) -> Detection {
        Detection {
            bbox: BoundingBox::from_ltrb(10.0, 10.0, 30.0, 30.0),
            class,
            confidence,
        }
    }

    fn pipeline(
        script: Vec<Vec<Detection>>,
        ids: Vec<u64>,
        empty_updates: bool,
    ) -> (FramePipeline, Arc<Mutex<Vec<usize>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let pipeline = FramePipeline::new(
            Box::new(ScriptedDetector { script, cursor: 0 }),
            Box::new(EchoTracker {
                ids,
                calls: Arc::clone(&calls),
                empty_updates,
            }),
            PipelineConfig::default(),
        );
        (pipeline, calls)
    }

    fn black() -> Frame {
        Frame::filled(64, 48, [0, 0, 0]).unwrap()
    }

    #[test]
    fn filters_class_and_confidence() {
        let script = vec![vec![
            det(ObjectClass::Vehicle, 0.9),
            det(ObjectClass::Person, 0.99),
            det(ObjectClass::Vehicle, 0.5),
            det(ObjectClass::Vehicle, 0.3),
        ]];
        let (mut pipeline, calls) = pipeline(script, vec![7], false);
        let out = pipeline.process(black()).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![1]);
        assert_eq!(out.current_ids(), &[TrackId(7)]);
        assert_eq!(out.total_count(), 1);
    }

    #[test]
    fn no_detections_skips_tracker_and_reports_nothing() {
        let (mut pipeline, calls) = pipeline(vec![vec![]], vec![1], false);
        let out = pipeline.process(black()).unwrap();
        assert!(calls.lock().unwrap().is_empty());
        assert!(out.current_ids().is_empty());
        assert_eq!(out.total_count(), 0);
    }

    #[test]
    fn empty_update_output_is_ignored() {
        let (mut pipeline, calls) = pipeline(vec![vec![]], vec![1], true);
        let out = pipeline.process(black()).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![0]);
        assert_eq!(out.current_count(), 0);
    }

    #[test]
    fn confirmed_track_is_boxed_in_green() {
        let script = vec![vec![det(ObjectClass::Vehicle, 0.8)]];
        let (mut pipeline, _) = pipeline(script, vec![3], false);
        let out = pipeline.process(black()).unwrap();
        let image = out.image();
        assert_eq!(image.pixel(10, 10), Some([0, 255, 0]));
        assert_eq!(image.pixel(11, 11), Some([0, 255, 0]));
        assert_eq!(image.pixel(12, 12), Some([0, 0, 0]));
        assert_eq!(image.pixel(20, 20), Some([0, 0, 0]));
    }

    #[test]
    fn repeated_id_counted_once() {
        let script = vec![
            vec![det(ObjectClass::Vehicle, 0.8)],
            vec![det(ObjectClass::Vehicle, 0.8)],
        ];
        let (mut pipeline, _) = pipeline(script, vec![5], false);
        pipeline.process(black()).unwrap();
        let out = pipeline.process(black()).unwrap();
        assert_eq!(out.total_count(), 1);
        assert_eq!(out.current_count(), 1);
    }

    #[test]
    fn default_factory_uses_registry_default() {
        let factory = DefaultPipelineFactory::new(
            Arc::new(BackendRegistry::with_builtin()),
            TrackerConfig::default(),
            PipelineConfig::default(),
        );
        let pipeline = factory.build("cam-1").unwrap();
        assert_eq!(pipeline.detector_name(), "stub");
        assert_eq!(pipeline.tracker_name(), "iou");

        let empty = DefaultPipelineFactory::new(
            Arc::new(BackendRegistry::new()),
            TrackerConfig::default(),
            PipelineConfig::default(),
        );
        assert!(empty.build("cam-2").is_err());
    }
}
