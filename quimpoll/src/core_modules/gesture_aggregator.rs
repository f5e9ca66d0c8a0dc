// THEORY:
// The `GestureAggregator` is where individual classifier calls become results.
//
// Key architectural principles:
// 1.  **Shared Evaluation**: Image and video processing run the exact same
//     per-candidate path: confidence/raised gate, crop, classify, and discard
//     anything that is absent or labelled "None".
// 2.  **Images Do Not Compete**: In a still image every usable observation is its
//     own result, even if two of them came from the same hand.
// 3.  **Videos Keep The Best**: Across frames, observations compete per
//     `AggregationKey` (person index, hand). The table is an online, single-pass
//     max-reduction: a newcomer replaces the incumbent only with a strictly
//     higher score, so ties keep whichever was seen first in decode order.
// 4.  **Positional Identity**: The key's person index is the pose model's output
//     position within one frame. If the model reorders people between frames,
//     "person 0" may be two different individuals. This is accepted; fixing it
//     would need real cross-frame tracking.

use crate::collaborators::GestureClassifier;
use crate::core_modules::crop_geometry::crop_box;
use crate::core_modules::keypoint_analyzer::{HandSide, Person, analyze_person};
use crate::error::PipelineResult;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Label the classifier uses for "hand seen, no gesture".
pub const NO_GESTURE_LABEL: &str = "None";

/// A hand landmark, x/y normalized to the crop it was found in.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HandLandmark {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureResult {
    pub label: String,
    pub score: f32,
    #[serde(default)]
    pub landmarks: Vec<HandLandmark>,
}

impl GestureResult {
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        Self {
            label: label.into(),
            score,
            landmarks: Vec::new(),
        }
    }

    pub fn is_gesture(&self) -> bool {
        self.label != NO_GESTURE_LABEL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey {
    pub person_index: usize,
    pub side: HandSide,
}

impl fmt::Display for AggregationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "person{}_gesture{}", self.person_index, self.side.ordinal())
    }
}

/// One usable gesture observation: the crop it came from and what it was.
#[derive(Debug, Clone)]
pub struct BestGestureRecord {
    pub key: AggregationKey,
    pub image: RgbImage,
    pub result: GestureResult,
}

/// Runs the gate → crop → classify path for both wrists of a person.
///
/// Returns the usable observations, left hand first.
pub fn evaluate_person<C>(
    person: &Person,
    frame: &RgbImage,
    threshold: f32,
    crop_scale: f32,
    classifier: &mut C,
) -> PipelineResult<Vec<BestGestureRecord>>
where
    C: GestureClassifier + ?Sized,
{
    let (width, height) = frame.dimensions();
    let mut observations = Vec::new();

    for candidate in analyze_person(person) {
        if !candidate.is_candidate(threshold) {
            continue;
        }

        let key = AggregationKey {
            person_index: person.index,
            side: candidate.side,
        };
        let Some(bounds) =
            crop_box(candidate.position, candidate.scale, crop_scale, width, height)
        else {
            debug!(%key, "crop collapsed after clipping, skipping");
            continue;
        };

        let crop = bounds.extract(frame);
        match classifier.classify(&crop)? {
            Some(result) if result.is_gesture() => {
                debug!(%key, label = %result.label, score = result.score, "gesture recognised");
                observations.push(BestGestureRecord {
                    key,
                    image: crop,
                    result,
                });
            }
            _ => debug!(%key, "no gesture"),
        }
    }

    Ok(observations)
}

/// Best observation per key across the frames of one video.
#[derive(Debug, Default)]
pub struct BestGestureTable {
    records: BTreeMap<AggregationKey, BestGestureRecord>,
}

impl BestGestureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation. Returns true if it became the key's best.
    pub fn offer(&mut self, record: BestGestureRecord) -> bool {
        match self.records.get_mut(&record.key) {
            None => {
                self.records.insert(record.key, record);
                true
            }
            Some(existing) if record.result.score > existing.result.score => {
                *existing = record;
                true
            }
            Some(_) => false,
        }
    }

    pub fn get(&self, key: &AggregationKey) -> Option<&BestGestureRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Final records ordered by person index, then left before right.
    pub fn into_records(self) -> Vec<BestGestureRecord> {
        self.records.into_values().collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core_modules::keypoint_analyzer::Keypoint;
    use crate::core_modules::keypoint_analyzer::tests::person_with_wrists;
    use std::collections::VecDeque;

    /// Replays scripted answers and remembers the size of every crop it saw.
    pub(crate) struct ScriptedClassifier {
        pub answers: VecDeque<Option<GestureResult>>,
        pub seen: Vec<(u32, u32)>,
    }

    impl ScriptedClassifier {
        pub(crate) fn new(answers: Vec<Option<GestureResult>>) -> Self {
            Self {
                answers: answers.into(),
                seen: Vec::new(),
            }
        }
    }

    impl GestureClassifier for ScriptedClassifier {
        fn classify(&mut self, crop: &RgbImage) -> PipelineResult<Option<GestureResult>> {
            assert!(crop.width() > 0 && crop.height() > 0, "degenerate crop reached classifier");
            self.seen.push(crop.dimensions());
            Ok(self.answers.pop_front().flatten())
        }
    }

    fn record(
        person_index: usize,
        side: HandSide,
        label: &str,
        score: f32,
        marker: u8,
    ) -> BestGestureRecord {
        BestGestureRecord {
            key: AggregationKey { person_index, side },
            image: RgbImage::from_pixel(2, 2, image::Rgb([marker, marker, marker])),
            result: GestureResult::new(label, score),
        }
    }

    #[test]
    fn low_confidence_wrists_never_reach_the_classifier() {
        let person = person_with_wrists(
            0,
            Keypoint::new(400.0, 100.0, 0.6),
            Keypoint::new(240.0, 100.0, 0.2),
        );
        let frame = RgbImage::new(640, 480);
        let mut classifier = ScriptedClassifier::new(vec![]);
        let found = evaluate_person(&person, &frame, 0.6, 1.0, &mut classifier).unwrap();
        assert!(found.is_empty());
        assert!(classifier.seen.is_empty());
    }

    #[test]
    fn lowered_hands_never_reach_the_classifier() {
        let person = person_with_wrists(
            0,
            Keypoint::new(400.0, 400.0, 0.95),
            Keypoint::new(240.0, 400.0, 0.95),
        );
        let frame = RgbImage::new(640, 480);
        let mut classifier = ScriptedClassifier::new(vec![]);
        evaluate_person(&person, &frame, 0.6, 1.0, &mut classifier).unwrap();
        assert!(classifier.seen.is_empty());
    }

    #[test]
    fn none_label_and_missing_result_are_misses() {
        let person = person_with_wrists(
            3,
            Keypoint::new(400.0, 100.0, 0.9),
            Keypoint::new(240.0, 100.0, 0.9),
        );
        let frame = RgbImage::new(640, 480);
        let mut classifier =
            ScriptedClassifier::new(vec![Some(GestureResult::new("None", 0.99)), None]);
        let found = evaluate_person(&person, &frame, 0.6, 1.0, &mut classifier).unwrap();
        assert!(found.is_empty());
        assert_eq!(classifier.seen, vec![(80, 80), (80, 80)]);
    }

    #[test]
    fn usable_results_are_keyed_by_person_and_side() {
        let person = person_with_wrists(
            2,
            Keypoint::new(400.0, 100.0, 0.9),
            Keypoint::new(240.0, 100.0, 0.9),
        );
        let frame = RgbImage::new(640, 480);
        let mut classifier = ScriptedClassifier::new(vec![
            Some(GestureResult::new("Open_Palm", 0.7)),
            Some(GestureResult::new("Thumb_Up", 0.8)),
        ]);
        let found = evaluate_person(&person, &frame, 0.6, 1.0, &mut classifier).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].key.to_string(), "person2_gesture0");
        assert_eq!(found[0].result.label, "Open_Palm");
        assert_eq!(found[1].key.to_string(), "person2_gesture1");
        assert_eq!(found[1].result.label, "Thumb_Up");
    }

    #[test]
    fn wrist_off_frame_is_skipped_without_classifying() {
        let person = person_with_wrists(
            0,
            Keypoint::new(-500.0, 100.0, 0.9),
            Keypoint::new(240.0, 100.0, 0.9),
        );
        let frame = RgbImage::new(640, 480);
        let mut classifier =
            ScriptedClassifier::new(vec![Some(GestureResult::new("Victory", 0.5))]);
        let found = evaluate_person(&person, &frame, 0.6, 1.0, &mut classifier).unwrap();
        assert_eq!(classifier.seen.len(), 1);
        assert_eq!(found[0].key.side, HandSide::Right);
    }

    #[test]
    fn table_keeps_strictly_higher_scores() {
        let mut table = BestGestureTable::new();
        assert!(table.offer(record(0, HandSide::Right, "Thumb_Up", 0.5, 1)));
        assert!(table.offer(record(0, HandSide::Right, "Victory", 0.9, 2)));
        assert!(!table.offer(record(0, HandSide::Right, "Open_Palm", 0.7, 3)));

        let key = AggregationKey {
            person_index: 0,
            side: HandSide::Right,
        };
        assert_eq!(table.get(&key).unwrap().result.label, "Victory");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn ties_keep_the_earliest_observation() {
        let mut table = BestGestureTable::new();
        table.offer(record(1, HandSide::Left, "Thumb_Up", 0.8, 10));
        assert!(!table.offer(record(1, HandSide::Left, "Victory", 0.8, 20)));

        let key = AggregationKey {
            person_index: 1,
            side: HandSide::Left,
        };
        let best = table.get(&key).unwrap();
        assert_eq!(best.result.label, "Thumb_Up");
        assert_eq!(best.image.get_pixel(0, 0)[0], 10);
    }

    #[test]
    fn table_result_is_the_max_of_every_observed_score() {
        let scores = [0.31f32, 0.72, 0.15, 0.72, 0.99, 0.4, 0.98];
        let mut table = BestGestureTable::new();
        for (frame, score) in scores.iter().enumerate() {
            table.offer(record(0, HandSide::Left, "Thumb_Up", *score, frame as u8));
        }
        let best = table.into_records().remove(0);
        assert!(scores.iter().all(|s| best.result.score >= *s));
        assert_eq!(best.image.get_pixel(0, 0)[0], 4);
    }

    #[test]
    fn records_flush_in_key_order() {
        let mut table = BestGestureTable::new();
        table.offer(record(1, HandSide::Right, "a", 0.1, 0));
        table.offer(record(0, HandSide::Right, "b", 0.1, 0));
        table.offer(record(1, HandSide::Left, "c", 0.1, 0));
        table.offer(record(0, HandSide::Left, "d", 0.1, 0));
        let names: Vec<String> = table.into_records().iter().map(|r| r.key.to_string()).collect();
        assert_eq!(
            names,
            ["person0_gesture0", "person0_gesture1", "person1_gesture0", "person1_gesture1"]
        );
    }
}
