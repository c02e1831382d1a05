//! Identity tracking boundary.
//!
//! A tracker assigns persistent ids to detections across frames and reports a
//! `confirmed` flag once an identity is stable enough to count. The algorithm
//! behind the trait is replaceable; `IouTracker` is the bundled reference.

mod iou;

use anyhow::Result;

use crate::detect::{BoundingBox, ObjectClass};
use crate::frame::{Frame, TrackId};

pub use iou::{IouTracker, TrackerConfig};

/// Detection handed to the tracker, in `[left, top, width, height]` form.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackInput {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub label: ObjectClass,
}

impl TrackInput {
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::from_xywh(self.left, self.top, self.width, self.height)
    }
}

/// One track reported for the current frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Track {
    pub id: TrackId,
    pub confirmed: bool,
    pub bbox: BoundingBox,
}

/// Tracker capability. One instance per session, called from the ingestion thread.
pub trait Tracker: Send {
    fn name(&self) -> &'static str;

    /// Feed this frame's detections and return the tracker's current tracks.
    fn update(&mut self, detections: &[TrackInput], frame: &Frame) -> Result<Vec<Track>>;

    /// Whether frames with no detections should still be passed to `update`.
    /// Trackers that age out tracks per frame return true.
    fn wants_empty_updates(&self) -> bool {
        false
    }
}
