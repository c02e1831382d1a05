use anyhow::Result;

use super::{Track, TrackInput, Tracker};
use crate::detect::BoundingBox;
use crate::frame::{Frame, TrackId};

pub const DEFAULT_MIN_IOU: f32 = 0.3;
pub const DEFAULT_MIN_HITS: u32 = 3;
pub const DEFAULT_MAX_AGE: u32 = 30;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerConfig {
    /// Minimum overlap for a detection to continue an existing track.
    pub min_iou: f32,
    /// Consecutive matched frames before a track is reported as confirmed.
    pub min_hits: u32,
    /// Frames a track may go unmatched before it is dropped.
    pub max_age: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: DEFAULT_MIN_IOU,
            min_hits: DEFAULT_MIN_HITS,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

#[derive(Clone, Debug)]
struct TrackState {
    id: TrackId,
    bbox: BoundingBox,
    hits: u32,
    misses: u32,
}

/// Greedy IoU tracker.
///
/// Each frame, detection/track pairs above `min_iou` are matched best-first.
/// Unmatched detections open new tracks; unmatched tracks age and are dropped
/// after `max_age` frames. A track is confirmed while it was matched this
/// frame and has at least `min_hits` consecutive matches.
pub struct IouTracker {
    config: TrackerConfig,
    tracks: Vec<TrackState>,
    next_id: u64,
}

impl IouTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Number of live (confirmed or tentative) tracks.
    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    fn match_greedy(&self, detections: &[TrackInput]) -> Vec<(usize, usize)> {
        let mut candidates = Vec::new();
        for (det_idx, det) in detections.iter().enumerate() {
            let det_box = det.bbox();
            for (track_idx, track) in self.tracks.iter().enumerate() {
                let iou = det_box.iou(&track.bbox);
                if iou >= self.config.min_iou {
                    candidates.push((iou, det_idx, track_idx));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut used_det = vec![false; detections.len()];
        let mut used_track = vec![false; self.tracks.len()];
        let mut assignments = Vec::new();
        for (_, det_idx, track_idx) in candidates {
            if !used_det[det_idx] && !used_track[track_idx] {
                used_det[det_idx] = true;
                used_track[track_idx] = true;
                assignments.push((det_idx, track_idx));
            }
        }
        assignments
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl Tracker for IouTracker {
    fn name(&self) -> &'static str {
        "iou"
    }

    fn update(&mut self, detections: &[TrackInput], _frame: &Frame) -> Result<Vec<Track>> {
        let assignments = self.match_greedy(detections);

        let mut matched_det = vec![false; detections.len()];
        let mut matched_track = vec![false; self.tracks.len()];
        for &(det_idx, track_idx) in &assignments {
            matched_det[det_idx] = true;
            matched_track[track_idx] = true;
            let track = &mut self.tracks[track_idx];
            track.bbox = detections[det_idx].bbox();
            track.hits += 1;
            track.misses = 0;
        }

        for (track, matched) in self.tracks.iter_mut().zip(&matched_track) {
            if !matched {
                track.misses += 1;
                track.hits = 0;
            }
        }
        let max_age = self.config.max_age;
        self.tracks.retain(|track| track.misses <= max_age);

        for (det, matched) in detections.iter().zip(&matched_det) {
            if *matched {
                continue;
            }
            self.tracks.push(TrackState {
                id: TrackId(self.next_id),
                bbox: det.bbox(),
                hits: 1,
                misses: 0,
            });
            self.next_id += 1;
        }

        let min_hits = self.config.min_hits.max(1);
        Ok(self
            .tracks
            .iter()
            .map(|track| Track {
                id: track.id,
                confirmed: track.misses == 0 && track.hits >= min_hits,
                bbox: track.bbox,
            })
            .collect())
    }

    fn wants_empty_updates(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectClass;

    fn input(left: f32, top: f32) -> TrackInput {
        TrackInput {
            left,
            top,
            width: 50.0,
            height: 40.0,
            confidence: 0.9,
            label: ObjectClass::Vehicle,
        }
    }

    fn frame() -> Frame {
        Frame::filled(16, 16, [0, 0, 0]).unwrap()
    }

    #[test]
    fn track_confirms_after_min_hits() {
        let mut tracker = IouTracker::new(TrackerConfig {
            min_hits: 3,
            ..TrackerConfig::default()
        });
        let f = frame();
        let first = tracker.update(&[input(10.0, 10.0)], &f).unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first[0].confirmed);
        tracker.update(&[input(12.0, 10.0)], &f).unwrap();
        let third = tracker.update(&[input(14.0, 10.0)], &f).unwrap();
        assert!(third[0].confirmed);
        assert_eq!(third[0].id, first[0].id);
    }

    #[test]
    fn distant_detection_opens_new_track() {
        let mut tracker = IouTracker::new(TrackerConfig {
            min_hits: 1,
            ..TrackerConfig::default()
        });
        let f = frame();
        let a = tracker.update(&[input(0.0, 0.0)], &f).unwrap();
        let b = tracker
            .update(&[input(0.0, 0.0), input(400.0, 300.0)], &f)
            .unwrap();
        assert_eq!(b.len(), 2);
        assert!(b.iter().any(|t| t.id == a[0].id));
        assert!(b.iter().all(|t| t.confirmed));
    }

    #[test]
    fn unmatched_tracks_age_out() {
        let mut tracker = IouTracker::new(TrackerConfig {
            min_hits: 1,
            max_age: 2,
            ..TrackerConfig::default()
        });
        let f = frame();
        tracker.update(&[input(0.0, 0.0)], &f).unwrap();
        let missed = tracker.update(&[], &f).unwrap();
        assert_eq!(missed.len(), 1);
        assert!(!missed[0].confirmed);
        tracker.update(&[], &f).unwrap();
        assert_eq!(tracker.live_tracks(), 1);
        tracker.update(&[], &f).unwrap();
        assert_eq!(tracker.live_tracks(), 0);
    }
}
