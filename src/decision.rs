// src/decision.rs
//
// Event decision engine. Converts sustained per-label evidence into case
// triggers and suppresses transient false positives with a sliding
// time-window vote plus hysteresis:
//
//   - one EvidenceWindow per label over the last W seconds
//   - a tick's sample is a hit when the best smoothed confidence for that
//     label exceeds the per-label threshold
//   - trigger when hit fraction > trigger_ratio (with a minimum sample
//     count so a lone early frame cannot vote 100%)
//   - once open, only an operator close or a zero-evidence cool-down ends
//     the episode; the instantaneous fraction is ignored

use crate::types::{CaseType, DecisionConfig, Label, SmoothedDetection};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvidenceSample {
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
    pub hit: bool,
    pub confidence: f32,
}

/// Rolling per-label history of matched/unmatched confidence samples.
/// Entries are monotonically increasing in timestamp; anything older than
/// the window length is evicted before each evaluation.
#[derive(Debug, Default)]
pub struct EvidenceWindow {
    samples: VecDeque<EvidenceSample>,
}

impl EvidenceWindow {
    pub fn push(&mut self, sample: EvidenceSample) {
        debug_assert!(
            self.samples
                .back()
                .map(|last| sample.timestamp >= last.timestamp)
                .unwrap_or(true),
            "evidence samples must be time-ordered"
        );
        self.samples.push_back(sample);
    }

    pub fn evict_older_than(&mut self, now: DateTime<Utc>, window: Duration) {
        while let Some(front) = self.samples.front() {
            if now.signed_duration_since(front.timestamp) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.samples.iter().filter(|s| s.hit).count()
    }

    pub fn hit_fraction(&self) -> f32 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.hits() as f32 / self.samples.len() as f32
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionEvent {
    /// Sustained evidence crossed the trigger ratio; the state machine
    /// should open a case.
    Triggered {
        label: Label,
        case_type: CaseType,
        frame_id: u64,
        timestamp: DateTime<Utc>,
        confidence: f32,
    },
    /// Evidence stayed at zero for the whole cool-down; the open case for
    /// this label can auto-close.
    EvidenceCleared {
        label: Label,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Default)]
struct OpenEpisode {
    zero_since: Option<DateTime<Utc>>,
}

pub struct DecisionEngine {
    config: DecisionConfig,
    windows: HashMap<Label, EvidenceWindow>,
    open: HashMap<Label, OpenEpisode>,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
            open: HashMap::new(),
        }
    }

    /// Evaluate one frame tick of smoothed tracks. Emits at most one event
    /// per label; concurrent evidence for different labels produces
    /// independent events.
    pub fn evaluate(
        &mut self,
        smoothed: &[SmoothedDetection],
        frame_id: u64,
        timestamp: DateTime<Utc>,
    ) -> Vec<DecisionEvent> {
        let window = Duration::milliseconds((self.config.window_secs * 1000.0) as i64);
        let cooldown = Duration::milliseconds((self.config.cooldown_secs * 1000.0) as i64);
        let mut events = Vec::new();

        for label in Label::ALL {
            let Some(&case_type) = self.config.case_mapping.get(&label) else {
                continue;
            };
            let threshold = self.config.threshold_for(label);
            let best = smoothed
                .iter()
                .filter(|s| s.label == label)
                .map(|s| s.confidence)
                .fold(0.0_f32, f32::max);
            let hit = best > threshold;

            let evidence = self.windows.entry(label).or_default();
            evidence.push(EvidenceSample {
                frame_id,
                timestamp,
                hit,
                confidence: best,
            });
            evidence.evict_older_than(timestamp, window);

            if let Some(episode) = self.open.get_mut(&label) {
                // Hysteresis: an open episode ignores the instantaneous
                // fraction entirely. Only a full cool-down of zero evidence
                // ends it from this side.
                if evidence.hits() > 0 {
                    episode.zero_since = None;
                } else {
                    let since = *episode.zero_since.get_or_insert(timestamp);
                    if timestamp.signed_duration_since(since) >= cooldown {
                        info!(
                            label = label.as_str(),
                            "evidence stayed at zero through cool-down, releasing episode"
                        );
                        self.open.remove(&label);
                        evidence.clear();
                        events.push(DecisionEvent::EvidenceCleared { label, timestamp });
                    }
                }
                continue;
            }

            if evidence.len() >= self.config.min_samples
                && evidence.hit_fraction() > self.config.trigger_ratio
            {
                info!(
                    label = label.as_str(),
                    fraction = evidence.hit_fraction(),
                    samples = evidence.len(),
                    "sustained evidence crossed trigger ratio"
                );
                self.open.insert(label, OpenEpisode::default());
                events.push(DecisionEvent::Triggered {
                    label,
                    case_type,
                    frame_id,
                    timestamp,
                    confidence: best,
                });
            }
        }
        events
    }

    /// Feedback from the state machine: the operator closed this label's
    /// case. The window is cleared so residual evidence cannot instantly
    /// re-trigger.
    pub fn notify_case_closed(&mut self, label: Label) {
        if self.open.remove(&label).is_some() {
            debug!(label = label.as_str(), "episode closed by operator");
        }
        if let Some(evidence) = self.windows.get_mut(&label) {
            evidence.clear();
        }
    }

    pub fn is_open(&self, label: Label) -> bool {
        self.open.contains_key(&label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn smoothed(label: Label, confidence: f32, frame_id: u64, ts: DateTime<Utc>) -> SmoothedDetection {
        SmoothedDetection {
            track_id: 1,
            label,
            confidence,
            bbox: [0, 0, 10, 10],
            frame_id,
            timestamp: ts,
        }
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(DecisionConfig::default())
    }

    #[test]
    fn gun_at_45_percent_of_a_2s_window_opens_with_the_trigger_frame_time() {
        let mut engine = engine();
        let mut triggered = None;

        // 40 frames over 2 seconds; gun at 0.9 on the last 18 frames (45%).
        for fid in 1..=40u64 {
            let ts = t0() + Duration::milliseconds((fid as i64 - 1) * 50);
            let dets = if fid >= 23 {
                vec![smoothed(Label::Gun, 0.9, fid, ts)]
            } else {
                vec![]
            };
            for event in engine.evaluate(&dets, fid, ts) {
                assert!(triggered.is_none(), "must trigger exactly once");
                triggered = Some((event, ts));
            }
        }

        let (event, _) = triggered.expect("case must open");
        match event {
            DecisionEvent::Triggered {
                label,
                case_type,
                frame_id,
                timestamp,
                ..
            } => {
                assert_eq!(label, Label::Gun);
                assert_eq!(case_type, CaseType::Danger);
                // 15 hits of 37 samples = 0.405 is the first fraction > 0.40.
                assert_eq!(frame_id, 37);
                assert_eq!(timestamp, t0() + Duration::milliseconds(36 * 50));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn confidence_below_threshold_never_opens() {
        let mut engine = engine();
        for fid in 1..=60u64 {
            let ts = t0() + Duration::milliseconds(fid as i64 * 50);
            let dets = vec![smoothed(Label::Gun, 0.5, fid, ts)];
            assert!(engine.evaluate(&dets, fid, ts).is_empty());
        }
        assert!(!engine.is_open(Label::Gun));
    }

    #[test]
    fn single_confident_frame_does_not_trigger() {
        let mut engine = engine();
        let ts = t0();
        let dets = vec![smoothed(Label::Knife, 0.99, 1, ts)];
        assert!(engine.evaluate(&dets, 1, ts).is_empty());
    }

    #[test]
    fn open_episode_survives_fraction_dropping_below_trigger() {
        let mut engine = engine();
        let mut opened = false;
        // Open with steady evidence.
        for fid in 1..=20u64 {
            let ts = t0() + Duration::milliseconds(fid as i64 * 50);
            let dets = vec![smoothed(Label::Knife, 0.9, fid, ts)];
            opened |= !engine.evaluate(&dets, fid, ts).is_empty();
        }
        assert!(opened);

        // Sparse evidence: fraction falls well below 40%, never to zero.
        for fid in 21..=80u64 {
            let ts = t0() + Duration::milliseconds(fid as i64 * 50);
            let dets = if fid % 10 == 0 {
                vec![smoothed(Label::Knife, 0.9, fid, ts)]
            } else {
                vec![]
            };
            assert!(engine.evaluate(&dets, fid, ts).is_empty());
        }
        assert!(engine.is_open(Label::Knife));
    }

    #[test]
    fn zero_evidence_for_the_cooldown_clears_the_episode() {
        let mut config = DecisionConfig::default();
        config.cooldown_secs = 1.0;
        let mut engine = DecisionEngine::new(config);

        for fid in 1..=20u64 {
            let ts = t0() + Duration::milliseconds(fid as i64 * 50);
            engine.evaluate(&[smoothed(Label::Gun, 0.9, fid, ts)], fid, ts);
        }
        assert!(engine.is_open(Label::Gun));

        let mut cleared = None;
        for fid in 21..=120u64 {
            let ts = t0() + Duration::milliseconds(fid as i64 * 50);
            for event in engine.evaluate(&[], fid, ts) {
                cleared = Some(event);
            }
        }
        match cleared.expect("episode must clear") {
            DecisionEvent::EvidenceCleared { label, .. } => assert_eq!(label, Label::Gun),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!engine.is_open(Label::Gun));
    }

    #[test]
    fn operator_close_clears_window_so_residual_evidence_cannot_retrigger() {
        let mut engine = engine();
        for fid in 1..=20u64 {
            let ts = t0() + Duration::milliseconds(fid as i64 * 50);
            engine.evaluate(&[smoothed(Label::Cigarette, 0.9, fid, ts)], fid, ts);
        }
        assert!(engine.is_open(Label::Cigarette));

        engine.notify_case_closed(Label::Cigarette);
        assert!(!engine.is_open(Label::Cigarette));

        // The very next quiet tick must not re-open from stale samples.
        let ts = t0() + Duration::milliseconds(21 * 50);
        assert!(engine.evaluate(&[], 21, ts).is_empty());
    }

    #[test]
    fn concurrent_labels_open_independent_episodes() {
        let mut engine = engine();
        let mut labels_opened = Vec::new();
        for fid in 1..=20u64 {
            let ts = t0() + Duration::milliseconds(fid as i64 * 50);
            let dets = vec![
                smoothed(Label::Gun, 0.9, fid, ts),
                smoothed(Label::LyingDown, 0.9, fid, ts),
            ];
            for event in engine.evaluate(&dets, fid, ts) {
                if let DecisionEvent::Triggered { label, case_type, .. } = event {
                    labels_opened.push((label, case_type));
                }
            }
        }
        labels_opened.sort_by_key(|(l, _)| l.as_str());
        assert_eq!(
            labels_opened,
            vec![
                (Label::Gun, CaseType::Danger),
                (Label::LyingDown, CaseType::Emergency),
            ]
        );
    }
}
