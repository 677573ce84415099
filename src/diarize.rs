//! Diarization lane.
//!
//! Trusts the external model's relative speaker decisions and only
//! post-processes them: internal cluster ids are mapped onto dense
//! session-wide labels (1, 2, …) in first-appearance order, adjacent
//! same-speaker intervals with small gaps are merged, and blips shorter
//! than the minimum duration are dropped. A diarizer failure degrades
//! the session (speakers stay unassigned) instead of ending it.

use std::collections::HashMap;

use crate::backend::Diarizer;
use crate::model::SpeakerInterval;

/// Adjacent same-speaker intervals closer than this are merged.
pub const MERGE_GAP_SEC: f64 = 0.2;
/// Intervals shorter than this are discarded.
pub const MIN_INTERVAL_SEC: f64 = 0.1;

/// First-appearance-order relabeling of the model's internal cluster
/// ids. The mapping is 1:1 within a session and labels are never reused.
#[derive(Debug, Default)]
pub struct SpeakerRelabel {
    map: HashMap<u64, i32>,
    next: i32,
}

impl SpeakerRelabel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
            next: 1,
        }
    }

    pub fn label(&mut self, internal_id: u64) -> i32 {
        *self.map.entry(internal_id).or_insert_with(|| {
            let label = self.next;
            self.next += 1;
            label
        })
    }

    #[must_use]
    pub fn speaker_count(&self) -> usize {
        self.map.len()
    }
}

/// Boundary smoothing and minimum-duration filtering over the session's
/// interval list. Intervals are sorted by start; overlapping or nearly
/// adjacent intervals of one speaker collapse into one.
pub fn postprocess(intervals: &mut Vec<SpeakerInterval>) {
    intervals.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut merged: Vec<SpeakerInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals.drain(..) {
        match merged.last_mut() {
            Some(last) if last.speaker == interval.speaker
                && interval.start - last.end < MERGE_GAP_SEC =>
            {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    merged.retain(|i| i.end - i.start >= MIN_INTERVAL_SEC);
    *intervals = merged;
}

pub struct DiarizationLane {
    diarizer: Box<dyn Diarizer>,
    relabel: SpeakerRelabel,
    degraded: bool,
}

impl DiarizationLane {
    #[must_use]
    pub fn new(diarizer: Box<dyn Diarizer>) -> Self {
        Self {
            diarizer,
            relabel: SpeakerRelabel::new(),
            degraded: false,
        }
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Feed the PCM tap; returns relabeled raw intervals. On a model
    /// failure the lane degrades permanently and goes quiet.
    pub fn feed(&mut self, pcm: &[i16], stream_time: f64) -> Vec<SpeakerInterval> {
        if self.degraded {
            return Vec::new();
        }
        match self.diarizer.feed(pcm, stream_time) {
            Ok(raw) => raw
                .into_iter()
                .map(|interval| SpeakerInterval {
                    speaker: self.relabel.label(interval.internal_id),
                    start: interval.start,
                    end: interval.end,
                })
                .collect(),
            Err(error) => {
                tracing::warn!(
                    stage = "diarization",
                    %error,
                    "diarizer failed; continuing with unassigned speakers"
                );
                self.degraded = true;
                Vec::new()
            }
        }
    }

    pub fn silence(&mut self, duration: f64) {
        if !self.degraded {
            self.diarizer.silence(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::ScriptedDiarizer;
    use crate::backend::RawSpeakerInterval;

    #[test]
    fn labels_are_dense_in_first_appearance_order() {
        let mut relabel = SpeakerRelabel::new();
        assert_eq!(relabel.label(42), 1);
        assert_eq!(relabel.label(7), 2);
        assert_eq!(relabel.label(42), 1);
        assert_eq!(relabel.label(1000), 3);
        assert_eq!(relabel.speaker_count(), 3);
    }

    #[test]
    fn small_gaps_between_same_speaker_are_merged() {
        let mut intervals = vec![
            SpeakerInterval {
                speaker: 1,
                start: 0.0,
                end: 1.0,
            },
            SpeakerInterval {
                speaker: 1,
                start: 1.1,
                end: 2.0,
            },
        ];
        postprocess(&mut intervals);
        assert_eq!(intervals.len(), 1);
        assert!((intervals[0].end - 2.0).abs() < 1e-9);
    }

    #[test]
    fn large_gaps_and_speaker_changes_stay_separate() {
        let mut intervals = vec![
            SpeakerInterval {
                speaker: 1,
                start: 0.0,
                end: 1.0,
            },
            SpeakerInterval {
                speaker: 1,
                start: 1.5,
                end: 2.0,
            },
            SpeakerInterval {
                speaker: 2,
                start: 2.05,
                end: 3.0,
            },
        ];
        postprocess(&mut intervals);
        assert_eq!(intervals.len(), 3);
    }

    #[test]
    fn blips_below_minimum_duration_are_dropped() {
        let mut intervals = vec![
            SpeakerInterval {
                speaker: 1,
                start: 0.0,
                end: 0.05,
            },
            SpeakerInterval {
                speaker: 2,
                start: 1.0,
                end: 2.0,
            },
        ];
        postprocess(&mut intervals);
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].speaker, 2);
    }

    #[test]
    fn unsorted_input_is_handled() {
        let mut intervals = vec![
            SpeakerInterval {
                speaker: 2,
                start: 2.0,
                end: 3.0,
            },
            SpeakerInterval {
                speaker: 1,
                start: 0.0,
                end: 1.0,
            },
        ];
        postprocess(&mut intervals);
        assert_eq!(intervals[0].speaker, 1);
        assert_eq!(intervals[1].speaker, 2);
    }

    #[test]
    fn lane_relabels_model_ids() {
        let mut lane = DiarizationLane::new(Box::new(ScriptedDiarizer::new(vec![
            RawSpeakerInterval {
                internal_id: 99,
                start: 0.0,
                end: 1.0,
            },
            RawSpeakerInterval {
                internal_id: 11,
                start: 1.0,
                end: 2.0,
            },
        ])));
        let intervals = lane.feed(&[], 3.0);
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].speaker, 1);
        assert_eq!(intervals[1].speaker, 2);
    }

    #[test]
    fn failing_diarizer_degrades_lane() {
        let mut lane = DiarizationLane::new(Box::new(ScriptedDiarizer::failing()));
        assert!(lane.feed(&[], 1.0).is_empty());
        assert!(lane.is_degraded());
        // Subsequent feeds stay quiet instead of re-erroring.
        assert!(lane.feed(&[], 2.0).is_empty());
    }
}
