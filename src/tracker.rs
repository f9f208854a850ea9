// src/tracker.rs
//
// Filter bank turning noisy per-frame detections into temporally smoothed
// tracks. Greedy best-IoU association within a label, one alpha-beta
// (constant-velocity, predict-then-correct) filter per box coordinate, and
// bounded coasting through brief detector gaps before a track is destroyed.

use crate::codec::DetectionResult;
use crate::types::{Detection, Label, SmoothedDetection, TrackerConfig};
use std::cmp::Ordering;
use tracing::debug;

/// One-dimensional alpha-beta filter state. `advance` is a pure
/// value-to-value step: predict along the current velocity, then correct
/// toward the observation when one exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaBeta {
    pub value: f32,
    pub velocity: f32,
}

impl AlphaBeta {
    pub fn init(observation: f32) -> Self {
        Self {
            value: observation,
            velocity: 0.0,
        }
    }

    pub fn advance(self, observation: Option<f32>, alpha: f32, beta: f32) -> Self {
        let predicted = self.value + self.velocity;
        match observation {
            Some(obs) => {
                let residual = obs - predicted;
                Self {
                    value: predicted + alpha * residual,
                    velocity: self.velocity + beta * residual,
                }
            }
            None => Self {
                value: predicted,
                velocity: self.velocity,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct BoxFilter {
    coords: [AlphaBeta; 4],
}

impl BoxFilter {
    fn init(bbox: [i32; 4]) -> Self {
        Self {
            coords: bbox.map(|c| AlphaBeta::init(c as f32)),
        }
    }

    fn advance(&mut self, observation: Option<[i32; 4]>, alpha: f32, beta: f32) {
        for (i, filter) in self.coords.iter_mut().enumerate() {
            *filter = filter.advance(observation.map(|b| b[i] as f32), alpha, beta);
        }
    }

    fn bbox(&self) -> [i32; 4] {
        let mut out = self.coords.map(|c| c.value.round() as i32);
        // A filter can momentarily invert a box edge; keep it well-formed.
        if out[0] >= out[2] {
            out[2] = out[0] + 1;
        }
        if out[1] >= out[3] {
            out[3] = out[1] + 1;
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub label: Label,
    bbox: BoxFilter,
    confidence: f32,
    pub last_seen: u64,
    pub misses: u32,
    pub hits: u32,
}

impl Track {
    fn new(id: u64, det: &Detection, frame_id: u64) -> Self {
        Self {
            id,
            label: det.label,
            bbox: BoxFilter::init(det.bbox),
            confidence: det.confidence,
            last_seen: frame_id,
            misses: 0,
            hits: 1,
        }
    }

    fn update(&mut self, det: &Detection, frame_id: u64, alpha: f32, beta: f32) {
        self.bbox.advance(Some(det.bbox), alpha, beta);
        self.confidence = (self.confidence + alpha * (det.confidence - self.confidence))
            .clamp(0.0, 1.0);
        self.last_seen = frame_id;
        self.misses = 0;
        self.hits += 1;
    }

    fn coast(&mut self, alpha: f32, beta: f32) {
        self.bbox.advance(None, alpha, beta);
        self.misses += 1;
    }

    pub fn bbox(&self) -> [i32; 4] {
        self.bbox.bbox()
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

pub struct ObjectTracker {
    tracks: Vec<Track>,
    next_id: u64,
    config: TrackerConfig,
    created: u64,
}

impl ObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            config,
            created: 0,
        }
    }

    /// Feed one frame tick. Returns one smoothed record per live track.
    pub fn observe(&mut self, frame: &DetectionResult) -> Vec<SmoothedDetection> {
        let assignments = self.associate(&frame.detections);
        let mut track_matched = vec![false; self.tracks.len()];

        for (det_idx, det) in frame.detections.iter().enumerate() {
            match assignments[det_idx] {
                Some(track_idx) => {
                    track_matched[track_idx] = true;
                    self.tracks[track_idx].update(
                        det,
                        frame.frame_id,
                        self.config.alpha,
                        self.config.beta,
                    );
                }
                None => {
                    let track = Track::new(self.next_id, det, frame.frame_id);
                    debug!(
                        track_id = track.id,
                        label = det.label.as_str(),
                        "new track"
                    );
                    self.next_id += 1;
                    self.created += 1;
                    self.tracks.push(track);
                    track_matched.push(true);
                }
            }
        }

        for (idx, matched) in track_matched.iter().enumerate() {
            if !matched {
                self.tracks[idx].coast(self.config.alpha, self.config.beta);
            }
        }

        let miss_threshold = self.config.miss_threshold;
        self.tracks.retain(|t| {
            if t.misses >= miss_threshold {
                debug!(track_id = t.id, label = t.label.as_str(), "track destroyed");
                false
            } else {
                true
            }
        });

        self.tracks
            .iter()
            .map(|t| SmoothedDetection {
                track_id: t.id,
                label: t.label,
                confidence: t.confidence,
                bbox: t.bbox(),
                frame_id: frame.frame_id,
                timestamp: frame.timestamp,
            })
            .collect()
    }

    /// Greedy best-IoU assignment: detection -> existing track of the same
    /// label, highest overlap first, overlap at least `min_iou`.
    fn associate(&self, detections: &[Detection]) -> Vec<Option<usize>> {
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (det_idx, det) in detections.iter().enumerate() {
            for (track_idx, track) in self.tracks.iter().enumerate() {
                if track.label != det.label {
                    continue;
                }
                let overlap = iou(det.bbox, track.bbox());
                if overlap >= self.config.min_iou {
                    candidates.push((overlap, det_idx, track_idx));
                }
            }
        }
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut assignments: Vec<Option<usize>> = vec![None; detections.len()];
        let mut track_taken = vec![false; self.tracks.len()];
        for (_, det_idx, track_idx) in candidates {
            if assignments[det_idx].is_none() && !track_taken[track_idx] {
                assignments[det_idx] = Some(track_idx);
                track_taken[track_idx] = true;
            }
        }
        assignments
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn tracks_created(&self) -> u64 {
        self.created
    }

    /// Session teardown: drop every track at once.
    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}

pub fn iou(a: [i32; 4], b: [i32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);
    if x1 >= x2 || y1 >= y2 {
        return 0.0;
    }
    let inter = ((x2 - x1) as f32) * ((y2 - y1) as f32);
    let area_a = ((a[2] - a[0]) as f32) * ((a[3] - a[1]) as f32);
    let area_b = ((b[2] - b[0]) as f32) * ((b[3] - b[1]) as f32);
    inter / (area_a + area_b - inter)
}
