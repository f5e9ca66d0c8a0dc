use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The structured report a polling client fetches after a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollData {
    pub people_detected: PeopleDetected,
    pub gestures_detected: GesturesDetected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeopleDetected {
    pub count: u32,
    /// Base64 of the annotated image (JPEG) or video (MP4).
    pub media: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GesturesDetected {
    pub count: u32,
    /// Base64 JPEG per reported gesture, in report order.
    pub media: Vec<String>,
    /// Label → number of reported gestures with that label.
    pub gestures: BTreeMap<String, u32>,
}

impl PollData {
    /// Adds one gesture to the report.
    pub fn record_gesture(&mut self, label: &str, inline_image: String) {
        let detected = &mut self.gestures_detected;
        detected.count += 1;
        *detected.gestures.entry(label.to_string()).or_insert(0) += 1;
        detected.media.push(inline_image);
    }
}
